#![warn(missing_docs)]

//! Tag-matching hello-world demo over the memfab fabric.

use anyhow::Result;
use clap::{Parser, Subcommand};
use memfab_transport::hello::{self, HelloConfig, HelloListener};
use memfab_transport::DEFAULT_OOB_PORT;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tag-matching hello-world demo.
#[derive(Parser)]
#[command(name = "memfab-hello", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for one peer and send it the greeting.
    Listen {
        /// Out-of-band bind address.
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Out-of-band port.
        #[arg(long, default_value_t = DEFAULT_OOB_PORT)]
        port: u16,
        /// Greeting length in bytes.
        #[arg(long, default_value_t = 16)]
        msg_len: usize,
    },
    /// Connect to a listener and receive the greeting.
    Connect {
        /// Listener host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Out-of-band port.
        #[arg(long, default_value_t = DEFAULT_OOB_PORT)]
        port: u16,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Listen {
            bind,
            port,
            msg_len,
        } => {
            let config = HelloConfig {
                msg_len,
                ..HelloConfig::default()
            };
            let listener = HelloListener::bind(&format!("{bind}:{port}"), config)?;
            tracing::info!(port = listener.oob_port(), "waiting for a peer");
            let greeting = listener.run()?;
            println!(
                "sent: {}",
                String::from_utf8_lossy(&greeting[..greeting.len().min(16)])
            );
        }
        Command::Connect { host, port } => {
            let greeting = hello::run_connector(&host, port, HelloConfig::default())?;
            println!(
                "received: {}",
                String::from_utf8_lossy(&greeting[..greeting.len().min(16)])
            );
        }
    }
    Ok(())
}
