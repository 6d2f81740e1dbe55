//! Raw HTTP/1.1 transport over TCP.
//!
//! This uses plain tokio sockets instead of an HTTP client library because
//! TP-Link devices have a non-compliant HTTP server that rejects requests with
//! lowercase headers. Modern HTTP libraries (reqwest, hyper, ureq) lowercase
//! header names, but the devices only accept title-case names such as
//! `Content-Type`.
//!
//! Every call opens a fresh connection; KLAP state lives in the cookies and
//! the sequence number, not in the TCP connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::{
    error::Error,
    transport::{
        DEFAULT_PORT, DEFAULT_TIMEOUT, HttpRequest, HttpResponse, HttpTransport, SessionCookies,
    },
};

/// Upper bound on an accepted response body.
const MAX_RESPONSE_LEN: usize = 1024 * 1024;

/// [`HttpTransport`] speaking HTTP/1.1 with title-case headers over TCP.
///
/// # Example
///
/// ```no_run
/// use klap_core::transport::{HttpRequest, HttpTransport, SessionCookies, TcpHttpTransport};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = TcpHttpTransport::new("192.168.1.100", 80, Duration::from_secs(5));
///     let mut cookies = SessionCookies::new();
///     let response = transport
///         .post(HttpRequest::new("/app/handshake1", &[0u8; 16]), &mut cookies)
///         .await?;
///     println!("status {}", response.status);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TcpHttpTransport {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpHttpTransport {
    /// Creates a transport for `host:port`.
    ///
    /// `timeout` bounds each of connect, write, and every read.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Creates a transport on the default port with the default timeout.
    pub fn with_defaults(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PORT, DEFAULT_TIMEOUT)
    }

    /// Returns the device host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the device port.
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];

        loop {
            let n = self.read_chunk(stream, &mut buf).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);

            let Some(header_end) = find_header_end(&response) else {
                continue;
            };

            let headers = String::from_utf8_lossy(&response[..header_end]);
            let body_start = header_end + 4;

            if let Some(expected_len) = parse_content_length(&headers) {
                if expected_len > MAX_RESPONSE_LEN {
                    return Err(Error::MalformedResponse(format!(
                        "response too large: {} bytes",
                        expected_len
                    )));
                }
                while response.len() - body_start < expected_len {
                    let n = self.read_chunk(stream, &mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    response.extend_from_slice(&buf[..n]);
                }
            }
            break;
        }

        Ok(response)
    }

    async fn read_chunk(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, Error> {
        timeout(self.timeout, stream.read(buf))
            .await
            .map_err(|_| Error::Transport("read timed out".into()))?
            .map_err(|e| Error::Transport(format!("read failed: {}", e)))
    }
}

#[async_trait]
impl HttpTransport for TcpHttpTransport {
    async fn post(
        &self,
        request: HttpRequest<'_>,
        cookies: &mut SessionCookies,
    ) -> Result<HttpResponse, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let target = request.target();

        let mut stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Transport(format!("connection to {} timed out", addr)))?
            .map_err(|e| Error::Transport(format!("connection to {} failed: {}", addr, e)))?;

        let mut payload = build_request_head(&self.host, self.port, &request, cookies).into_bytes();
        payload.extend_from_slice(request.body);

        debug!(addr = %addr, target = %target, bytes = request.body.len(), "sending POST");

        timeout(self.timeout, stream.write_all(&payload))
            .await
            .map_err(|_| Error::Transport("write timed out".into()))?
            .map_err(|e| Error::Transport(format!("write failed: {}", e)))?;

        let raw = self.read_response(&mut stream).await?;

        let header_end = find_header_end(&raw)
            .ok_or_else(|| Error::Transport("invalid HTTP response: no header end".into()))?;
        let headers = String::from_utf8_lossy(&raw[..header_end]);

        let status = parse_status_code(&headers)
            .ok_or_else(|| Error::Transport("invalid HTTP response: no status code".into()))?;

        for value in parse_set_cookies(&headers) {
            cookies.merge_set_cookie(value);
        }

        let body = raw[header_end + 4..].to_vec();
        debug!(target = %target, status, bytes = body.len(), "received response");

        Ok(HttpResponse { status, body })
    }
}

/// Builds the request line and headers, ending with the blank line.
fn build_request_head(
    host: &str,
    port: u16,
    request: &HttpRequest<'_>,
    cookies: &SessionCookies,
) -> String {
    let mut head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Accept: */*\r\n",
        request.target(),
        host,
        port,
        request.content_type,
        request.body.len()
    );

    if let Some(cookie) = cookies.header_value() {
        head.push_str(&format!("Cookie: {}\r\n", cookie));
    }

    head.push_str("\r\n");
    head
}

/// Find the position of "\r\n\r\n" in the response (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the HTTP status code from the response headers.
fn parse_status_code(headers: &str) -> Option<u16> {
    // First line should be "HTTP/1.1 200 OK" or similar
    let first_line = headers.lines().next()?;
    first_line.split_whitespace().nth(1)?.parse().ok()
}

/// Finds the value of a header, matching the name case-insensitively.
fn header_values<'a>(headers: &'a str, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers.lines().skip(1).filter_map(move |line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Parse the Content-Length header value.
fn parse_content_length(headers: &str) -> Option<usize> {
    header_values(headers, "content-length")
        .next()?
        .parse()
        .ok()
}

/// Collect every Set-Cookie header value.
fn parse_set_cookies(headers: &str) -> Vec<&str> {
    header_values(headers, "set-cookie").collect()
}
