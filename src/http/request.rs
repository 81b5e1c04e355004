//! Outbound request descriptors and HTTP/1.1 request parsing via [`httparse`].

use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::{Headers, Method};

/// Errors that can occur while building or parsing a request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("declared body of {length} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { length: usize, limit: usize },
}

/// An outbound request as seen by the cache.
///
/// The URL is always absolute so the request can be classified by origin and
/// keyed by its full `scheme://host/path?query` form.
///
/// # Examples
///
/// ```
/// use fetchcache::http::{Method, Request};
///
/// let req = Request::get("https://app.example/assets/app.3f9a.js#main").unwrap();
/// assert_eq!(req.method(), &Method::Get);
/// assert_eq!(req.path(), "/assets/app.3f9a.js");
/// assert_eq!(req.cache_url(), "https://app.example/assets/app.3f9a.js");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per parsed request.
    const MAX_HEADERS: usize = 64;

    /// Largest `Content-Length` [`Request::parse`] will wait for (8 MiB).
    pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Builds a `GET` request for an absolute URL.
    pub fn get(url: &str) -> Result<Self, RequestError> {
        let url = Url::parse(url).map_err(|source| RequestError::InvalidTarget {
            target: url.to_owned(),
            source,
        })?;
        Ok(Self::new(Method::Get, url))
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parses a raw HTTP/1.1 request received by the host adapter.
    ///
    /// Origin-form targets (`/path?query`) are resolved against `base`;
    /// absolute-form targets (as sent to a forward proxy) are kept as-is.
    /// Returns the request and the number of bytes it occupied in `buf`,
    /// body included.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — headers or body not fully received yet.
    /// - [`RequestError::Parse`] — the data is malformed.
    /// - [`RequestError::MissingField`] — method, path or version absent.
    /// - [`RequestError::InvalidTarget`] — the target cannot form a URL.
    /// - [`RequestError::BodyTooLarge`] — `Content-Length` exceeds [`Request::MAX_BODY_SIZE`].
    pub fn parse(buf: &[u8], base: &Url) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let url = base
            .join(target)
            .map_err(|source| RequestError::InvalidTarget {
                target: target.to_owned(),
                source,
            })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length = match header_map.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength)?,
            None => 0,
        };
        if content_length > Self::MAX_BODY_SIZE {
            return Err(RequestError::BodyTooLarge {
                length: content_length,
                limit: Self::MAX_BODY_SIZE,
            });
        }
        let total = body_offset
            .checked_add(content_length)
            .ok_or(RequestError::InvalidContentLength)?;
        if buf.len() < total {
            return Err(RequestError::Incomplete);
        }
        let body = Bytes::copy_from_slice(&buf[body_offset..total]);

        Ok((
            Self {
                method,
                url,
                headers: header_map,
                body,
            },
            total,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the absolute request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the URL path (without the query string).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body (empty when none was sent).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The URL used for cache lookups: scheme, host, port, path and query,
    /// with any fragment removed.
    pub fn cache_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }

    /// Returns `true` if the client asked for the connection to be closed.
    pub fn wants_close(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|conn| conn.eq_ignore_ascii_case("close"))
    }
}
