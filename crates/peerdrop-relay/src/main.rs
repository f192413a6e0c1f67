//! PeerDrop relay server binary.

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use peerdrop_core::tracing_init::init_tracing;
use peerdrop_relay::{SessionRegistry, serve};

#[derive(Parser, Debug)]
#[command(name = "peerdrop-relay")]
#[command(version, about = "PeerDrop rendezvous relay - signaling forwarder")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "PEERDROP_RELAY_ADDR")]
    addr: SocketAddr,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("peerdrop_relay=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting peerdrop-relay"
    );

    let listener = TcpListener::bind(args.addr).await?;
    let registry = SessionRegistry::new();

    tokio::select! {
        result = serve(listener, registry) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Relay stopped");
    Ok(())
}
