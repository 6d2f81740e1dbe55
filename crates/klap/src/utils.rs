use std::io::{IsTerminal, Read};

use klap_core::{AuthSecret, Credentials};

/// Read password securely based on the provided options.
///
/// # Priority
///
/// 1. If `password_stdin` is true, read the first line of stdin
/// 2. Otherwise, prompt interactively (if terminal is available)
pub fn read_password(password_stdin: bool, prompt: &str) -> Result<String, String> {
    if password_stdin {
        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| format!("Failed to read password from stdin: {}", e))?;
        return Ok(input.trim_end_matches(['\r', '\n']).to_string());
    }

    if std::io::stdin().is_terminal() {
        eprint!("{}: ", prompt);
        rpassword::read_password().map_err(|e| format!("Failed to read password: {}", e))
    } else {
        Err("No password provided. Use --password-stdin when piping input.".to_string())
    }
}

/// Get credentials from CLI options and environment.
///
/// Password is read from KLAP_PASSWORD env var, stdin (if --password-stdin),
/// or interactively prompted. Without a username the credentials are blank.
pub fn get_credentials(
    username: Option<String>,
    password_stdin: bool,
) -> Result<Credentials, String> {
    let Some(user) = username else {
        return Ok(Credentials::blank());
    };

    if let Ok(pass) = std::env::var("KLAP_PASSWORD") {
        return Ok(Credentials::new(user, pass));
    }

    let prompt = format!("Password for {}", user);
    let pass = read_password(password_stdin, &prompt)?;
    Ok(Credentials::new(user, pass))
}

/// Resolve the auth secret: a precomputed hex value wins over credentials.
pub fn get_auth_secret(
    auth_hash: Option<String>,
    username: Option<String>,
    password_stdin: bool,
) -> Result<AuthSecret, String> {
    match auth_hash {
        Some(hex) => AuthSecret::from_hex(&hex).map_err(|e| e.to_string()),
        None => get_credentials(username, password_stdin).map(|c| c.auth_secret()),
    }
}

/// Use the payload argument, or read the rest of stdin if there is none.
pub fn read_payload(payload: Option<String>) -> Result<Vec<u8>, String> {
    if let Some(payload) = payload {
        return Ok(payload.into_bytes());
    }

    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .map_err(|e| format!("Failed to read payload from stdin: {}", e))?;
    Ok(input)
}

/// Render a response: pretty JSON when it parses, lossy UTF-8 otherwise.
pub fn format_response(response: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(response) {
        Ok(json) => serde_json::to_string_pretty(&json)
            .unwrap_or_else(|_| String::from_utf8_lossy(response).into_owned()),
        Err(_) => String::from_utf8_lossy(response).into_owned(),
    }
}
