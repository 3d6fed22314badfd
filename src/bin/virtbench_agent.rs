use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use virtbench::agent;
use virtbench::benches::Registry;
use virtbench::harness::CONTROL_PORT;
use virtbench::logging::{init_logging, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "virtbench-agent")]
#[command(about = "Benchmark agent answering a virtbench coordinator")]
struct Args {
    /// Address to accept coordinator connections on.
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], CONTROL_PORT)))]
    listen: SocketAddr,

    /// Log at debug level.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    init_logging(&LogConfig::from_env(level))?;

    let registry = Registry::builtin();
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(listen = %args.listen, benchmarks = registry.scheduled().count(), "agent ready");
    agent::accept_loop(listener, &registry).await?;
    Ok(())
}
