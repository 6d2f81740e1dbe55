mod cli;
mod handlers;
mod utils;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::handlers::{SendOptions, handle_hash, handle_send, handle_version};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG overrides the default level
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Hash => handle_hash(cli.username, cli.password_stdin),

        Command::Send {
            host,
            port,
            timeout,
            handshake_delay,
            no_verify_signature,
            strict_server_proof,
            payload,
        } => {
            let options = SendOptions {
                host,
                port,
                timeout,
                handshake_delay,
                verify_signature: !no_verify_signature,
                strict_server_proof,
                payload,
            };
            handle_send(options, cli.auth_hash, cli.username, cli.password_stdin).await;
        }

        Command::Version => handle_version(),
    }
}
