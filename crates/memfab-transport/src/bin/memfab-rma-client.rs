#![warn(missing_docs)]

//! RMA demo client: performs one put or one get against a server buffer
//! and prints the head of its local buffer.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use memfab_transport::rma::{self, RmaClientConfig, RmaOp};
use memfab_transport::DEFAULT_OOB_PORT;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Op {
    /// Write the client pattern into the server buffer.
    Put,
    /// Read the server buffer.
    Get,
}

impl From<Op> for RmaOp {
    fn from(op: Op) -> Self {
        match op {
            Op::Put => RmaOp::Put,
            Op::Get => RmaOp::Get,
        }
    }
}

/// RMA demo client.
#[derive(Parser)]
#[command(name = "memfab-rma-client", version, about)]
struct Cli {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Out-of-band port.
    #[arg(long, default_value_t = DEFAULT_OOB_PORT)]
    port: u16,
    /// Operation to perform.
    #[arg(long, value_enum, default_value_t = Op::Get)]
    op: Op,
    /// Transfer length in bytes; capped to the server's buffer.
    #[arg(long, default_value_t = 64)]
    len: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RmaClientConfig {
        len: cli.len,
        ..RmaClientConfig::default()
    };
    let buf = rma::run_client(&cli.host, cli.port, cli.op.into(), config)?;
    println!("{}", rma::hex_head(&buf, 16));
    Ok(())
}
