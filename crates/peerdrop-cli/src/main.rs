//! PeerDrop CLI binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use peerdrop_cli::commands;
use peerdrop_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "peerdrop")]
#[command(version, about = "Encrypted peer-to-peer file transfer")]
struct Cli {
    /// Relay server address, used only for connection setup.
    #[arg(long, default_value = "127.0.0.1:8080", env = "PEERDROP_RELAY")]
    relay: String,

    /// Print per-chunk encryption reports as JSON.
    #[arg(long)]
    verbose: bool,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to a receiving session.
    Send {
        /// Receiver session identifier, as displayed by `peerdrop receive`.
        #[arg(long)]
        peer: String,
        /// File to send.
        file: PathBuf,
    },
    /// Receive a file from a sending session.
    Receive {
        /// Sender session identifier to accept signals from.
        #[arg(long)]
        from: String,
        /// Directory to write the received file into.
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("peerdrop=warn", cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting peerdrop");

    match cli.command {
        Command::Send { peer, file } => {
            commands::send(&cli.relay, &peer, &file, cli.verbose).await
        }
        Command::Receive { from, output } => {
            commands::receive(&cli.relay, &from, &output, cli.verbose).await
        }
    }
}
