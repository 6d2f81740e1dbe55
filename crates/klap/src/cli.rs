use std::time::Duration;

use clap::{Parser, Subcommand};
use klap_core::DEFAULT_PORT;

pub fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

pub fn parse_millis(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let millis = arg.parse()?;
    Ok(Duration::from_millis(millis))
}

/// TP-Link KLAP protocol client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TP-Link cloud account username (email).
    /// Omit for devices that were never bound to a cloud account.
    /// Can also be set via KLAP_USERNAME environment variable.
    #[arg(short, long, global = true, env = "KLAP_USERNAME")]
    pub username: Option<String>,

    /// Read password from stdin.
    /// Useful for scripting: echo "password" | klap -u user@example.com --password-stdin hash
    #[arg(long, global = true)]
    pub password_stdin: bool,

    /// Precomputed auth secret as 64 hex characters (see `klap hash`).
    /// Takes precedence over username and password.
    #[arg(long, global = true, env = "KLAP_AUTH_HASH", hide_env_values = true)]
    pub auth_hash: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Derive the auth secret from the credentials and print it as hex
    Hash,

    /// Send one request through a KLAP session and print the response
    Send {
        /// Target hostname or IP address
        host: String,

        /// Target port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Timeout in seconds for each handshake round and the request
        #[arg(long, value_parser = parse_duration, default_value = "10")]
        timeout: Duration,

        /// Pause between handshake rounds, in milliseconds
        #[arg(long = "handshake-delay-ms", value_parser = parse_millis, default_value = "0")]
        handshake_delay: Duration,

        /// Accept responses without checking their signature
        #[arg(long)]
        no_verify_signature: bool,

        /// Abort if the device's handshake proof does not match the credentials
        #[arg(long)]
        strict_server_proof: bool,

        /// Request payload, typically JSON. Read from stdin when omitted.
        payload: Option<String>,
    },

    /// Show version information for CLI and core library
    Version,
}
