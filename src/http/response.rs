//! HTTP response type shared by upstream fetches, cache snapshots, and the host.
//!
//! Responses are fully buffered: the body is a [`Bytes`] handle, so cloning a
//! response for a background cache write is cheap and never observes a
//! half-read body.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// A fully buffered HTTP response.
///
/// # Examples
///
/// ```
/// use fetchcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.body_ref().len(), 15);
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: impl Into<StatusCode>) -> Self {
        Self {
            status: status.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Builds a response from parts already captured elsewhere (upstream or snapshot).
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body.
    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the status is `2xx`.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Hop-by-hop framing headers captured from upstream (`Content-Length`,
    /// `Transfer-Encoding`, `Connection`) are dropped and rewritten to match the
    /// buffered body. Content-Encoding is dropped as well because upstream bodies
    /// are decoded before they reach the cache.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        for name in [
            "content-length",
            "transfer-encoding",
            "connection",
            "content-encoding",
        ] {
            self.headers.remove(name);
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        let reason = self.status.canonical_reason().unwrap_or("");
        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes());

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
