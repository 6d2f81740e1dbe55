use std::time::Duration;

use klap_core::{SessionConfig, SessionManager};
use tracing::debug;

use crate::utils::{format_response, get_auth_secret, get_credentials, read_payload};

/// Handle the hash command.
pub fn handle_hash(username: Option<String>, password_stdin: bool) {
    match get_credentials(username, password_stdin) {
        Ok(credentials) => {
            debug!(blank = credentials.is_blank(), "deriving auth secret");
            println!("{}", credentials.auth_secret().to_hex());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Options for the send command.
pub struct SendOptions {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub handshake_delay: Duration,
    pub verify_signature: bool,
    pub strict_server_proof: bool,
    pub payload: Option<String>,
}

/// Handle the send command.
pub async fn handle_send(
    options: SendOptions,
    auth_hash: Option<String>,
    username: Option<String>,
    password_stdin: bool,
) {
    let auth_secret = match get_auth_secret(auth_hash, username, password_stdin) {
        Ok(secret) => secret,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let payload = match read_payload(options.payload) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = SessionConfig::new()
        .with_timeout(options.timeout)
        .with_handshake_delay(options.handshake_delay)
        .with_signature_verification(options.verify_signature)
        .with_strict_server_proof(options.strict_server_proof);

    debug!(host = %options.host, port = options.port, bytes = payload.len(), "sending request");
    let manager = SessionManager::http(&options.host, options.port, auth_secret, config);

    match manager.send(&payload).await {
        Ok(response) => println!("{}", format_response(&response)),
        Err(e) => {
            debug!(host = %options.host, port = options.port, "request failed");
            eprint!("{}", send_failure_message(&options.host, options.port, &e));
            std::process::exit(1);
        }
    }
}

/// Builds the stderr report for a failed send, with hints for auth failures.
fn send_failure_message(host: &str, port: u16, error: &klap_core::Error) -> String {
    let mut message = format!("Error: Request to {}:{} failed: {}\n", host, port, error);
    if matches!(error, klap_core::Error::AuthenticationFailed(_)) {
        message.push('\n');
        message.push_str("Check the TP-Link account the device is bound to, e.g.:\n");
        message.push_str(&format!("  klap -u your-email@example.com send {} '{{}}'\n", host));
        message.push('\n');
        message.push_str("Or set credentials via environment variables:\n");
        message.push_str("  export KLAP_USERNAME=your-email@example.com\n");
        message.push_str("  export KLAP_PASSWORD=your-password\n");
    }
    message
}

/// Handle the version command.
pub fn handle_version() {
    println!("klap {}", env!("CARGO_PKG_VERSION"));
    println!("klap-core {}", klap_core::VERSION);
}
