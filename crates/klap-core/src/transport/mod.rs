//! Transport layer consumed by the KLAP session core.
//!
//! The core only needs one thing from HTTP: POST some bytes to a path, with
//! optional query parameters and the session cookies attached, and get back a
//! status code and a body. [`HttpTransport`] captures that; [`TcpHttpTransport`]
//! implements it with raw HTTP/1.1 over TCP.
//!
//! Cookies are the session continuity token. The device issues them on
//! handshake 1 and expects them back on handshake 2 and every request after
//! that. A [`SessionCookies`] jar is passed in and out of every call so the
//! transport can attach it and merge any `Set-Cookie` headers into it.

pub mod http;

pub use http::TcpHttpTransport;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::Error;

/// Default HTTP port for KLAP devices.
pub const DEFAULT_PORT: u16 = 80;

/// Default timeout for transport operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path for handshake round 1.
pub const HANDSHAKE1_PATH: &str = "/app/handshake1";

/// Path for handshake round 2.
pub const HANDSHAKE2_PATH: &str = "/app/handshake2";

/// Path for encrypted requests.
pub const REQUEST_PATH: &str = "/app/request";

/// Query parameter carrying the sequence number of an encrypted request.
pub const SEQ_PARAM: &str = "seq";

/// Content type of handshake bodies.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Content type of encrypted request bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Session cookie name used by KLAP devices.
pub const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// A POST request for the device.
#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    /// Request path without query string.
    pub path: &'a str,
    /// Query parameters, appended in order.
    pub query: Vec<(&'static str, String)>,
    /// Request body.
    pub body: &'a [u8],
    /// Value of the `Content-Type` header.
    pub content_type: &'static str,
}

impl<'a> HttpRequest<'a> {
    /// Creates a request with an `application/octet-stream` body.
    pub fn new(path: &'a str, body: &'a [u8]) -> Self {
        Self {
            path,
            query: Vec::new(),
            body,
            content_type: CONTENT_TYPE_OCTET_STREAM,
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = content_type;
        self
    }

    /// Returns the request target: the path followed by the query string.
    ///
    /// ```
    /// use klap_core::transport::HttpRequest;
    ///
    /// let request = HttpRequest::new("/app/request", b"").with_query("seq", -5);
    /// assert_eq!(request.target(), "/app/request?seq=-5");
    /// ```
    pub fn target(&self) -> String {
        let mut target = self.path.to_string();
        for (i, (name, value)) in self.query.iter().enumerate() {
            target.push(if i == 0 { '?' } else { '&' });
            target.push_str(name);
            target.push('=');
            target.push_str(value);
        }
        target
    }

    /// Returns the value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body returned by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for a `200 OK` response, the only status KLAP devices
    /// use for success.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Cookies tying requests to one device-side handshake.
///
/// Values are opaque; the jar only tracks `name=value` pairs, in the order the
/// device issued them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCookies {
    cookies: Vec<(String, String)>,
}

impl SessionCookies {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the jar holds no cookies.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Returns the value of a cookie.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a cookie, replacing any previous value with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = value,
            None => self.cookies.push((name, value)),
        }
    }

    /// Merges the value of a `Set-Cookie` header into the jar.
    ///
    /// Attributes after the first `;` (`Path`, `Max-Age`, ...) are ignored.
    /// Headers without a `name=value` pair are skipped.
    ///
    /// ```
    /// use klap_core::transport::SessionCookies;
    ///
    /// let mut jar = SessionCookies::new();
    /// jar.merge_set_cookie("TP_SESSIONID=ABC123;TIMEOUT=86400");
    /// assert_eq!(jar.get("TP_SESSIONID"), Some("ABC123"));
    /// ```
    pub fn merge_set_cookie(&mut self, header_value: &str) {
        let pair = header_value.split(';').next().unwrap_or_default().trim();
        if let Some((name, value)) = pair.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                self.set(name, value.trim());
            }
        }
    }

    /// Renders the jar as a `Cookie` header value, or `None` if empty.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(n, v)| format!("{}={}", n, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

// Cookie values are session credentials; only show the names.
impl fmt::Debug for SessionCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.cookies.iter().map(|(n, _)| n))
            .finish()
    }
}

/// HTTP POST capability the session core needs from its collaborator.
///
/// Implementations attach `cookies` to the request and merge any cookies
/// the response sets back into it. Network failures map to
/// [`Error::Transport`]; non-200 statuses are returned as responses, not
/// errors, since their meaning depends on the protocol step.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a POST request and returns the device's response.
    async fn post(
        &self,
        request: HttpRequest<'_>,
        cookies: &mut SessionCookies,
    ) -> Result<HttpResponse, Error>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn post(
        &self,
        request: HttpRequest<'_>,
        cookies: &mut SessionCookies,
    ) -> Result<HttpResponse, Error> {
        (**self).post(request, cookies).await
    }
}

/// Runs one transport call under an overall deadline.
pub(crate) async fn post_with_timeout<T: HttpTransport + ?Sized>(
    transport: &T,
    request: HttpRequest<'_>,
    cookies: &mut SessionCookies,
    limit: Duration,
) -> Result<HttpResponse, Error> {
    let path = request.path;
    timeout(limit, transport.post(request, cookies))
        .await
        .map_err(|_| Error::Transport(format!("POST {} timed out after {:?}", path, limit)))?
}
