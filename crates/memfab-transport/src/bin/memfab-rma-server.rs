#![warn(missing_docs)]

//! RMA demo server: registers one buffer and serves puts and gets until
//! interrupted.

use anyhow::Result;
use clap::Parser;
use memfab_transport::rma::{RmaServer, RmaServerConfig};
use memfab_transport::DEFAULT_OOB_PORT;
use std::sync::atomic::AtomicBool;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// RMA demo server.
#[derive(Parser)]
#[command(name = "memfab-rma-server", version, about)]
struct Cli {
    /// Out-of-band bind address.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    /// Out-of-band port.
    #[arg(long, default_value_t = DEFAULT_OOB_PORT)]
    port: u16,
    /// Size of the exposed buffer in bytes.
    #[arg(long, default_value_t = 4096)]
    buf_len: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RmaServerConfig {
        buf_len: cli.buf_len,
        ..RmaServerConfig::default()
    };
    let server = RmaServer::bind(&format!("{}:{}", cli.bind, cli.port), config)?;
    tracing::info!(port = server.oob_port(), "serving until interrupted");

    let stop = AtomicBool::new(false);
    server.serve(&stop)?;
    Ok(())
}
