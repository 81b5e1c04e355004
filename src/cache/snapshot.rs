//! Cache keys and immutable response snapshots.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Lookup key of a cache entry: the request method plus its fragment-free URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Creates a key from a method and an already normalized URL.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }

    /// Derives the key for `request`, dropping any URL fragment.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method().clone(), request.cache_url())
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the URL part of the key.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn byte_len(&self) -> usize {
        self.method.as_str().len() + self.url.len()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An immutable capture of a successful response.
///
/// Snapshots are only ever taken from fully buffered `2xx` responses, so a
/// stored entry is always complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    stored_at: SystemTime,
}

impl ResponseSnapshot {
    /// Captures `response`, or returns `None` unless it is a complete `2xx`.
    ///
    /// `206 Partial Content` is refused: a byte range must never be stored
    /// under the key of the whole resource.
    ///
    /// # Examples
    ///
    /// ```
    /// use fetchcache::cache::ResponseSnapshot;
    /// use fetchcache::http::{Response, StatusCode};
    ///
    /// let ok = Response::new(StatusCode::OK).body("hi");
    /// assert!(ResponseSnapshot::capture(&ok).is_some());
    ///
    /// let missing = Response::new(StatusCode::NOT_FOUND);
    /// assert!(ResponseSnapshot::capture(&missing).is_none());
    ///
    /// let range = Response::new(StatusCode::PARTIAL_CONTENT).body("hi");
    /// assert!(ResponseSnapshot::capture(&range).is_none());
    /// ```
    pub fn capture(response: &Response) -> Option<Self> {
        if !response.is_success() || response.status() == StatusCode::PARTIAL_CONTENT {
            return None;
        }
        Some(Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body_ref().clone(),
            stored_at: SystemTime::now(),
        })
    }

    /// Returns the captured status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the captured body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// When the snapshot was taken.
    pub fn stored_at(&self) -> SystemTime {
        self.stored_at
    }

    /// Rebuilds a response that replays the captured status, headers and body.
    pub fn to_response(&self) -> Response {
        Response::from_parts(self.status, self.headers.clone(), self.body.clone())
    }

    /// Bytes charged against the storage quota for this entry under `key`.
    pub(crate) fn footprint(&self, key: &CacheKey) -> usize {
        key.byte_len() + self.headers.byte_len() + self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_fragment() {
        let a = CacheKey::for_request(&Request::get("https://app.example/a#x").unwrap());
        let b = CacheKey::for_request(&Request::get("https://app.example/a#y").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://app.example/a");
    }

    #[test]
    fn key_distinguishes_query() {
        let a = CacheKey::for_request(&Request::get("https://app.example/a?v=1").unwrap());
        let b = CacheKey::for_request(&Request::get("https://app.example/a?v=2").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn only_success_is_captured() {
        for code in [204u16, 200, 299] {
            assert!(ResponseSnapshot::capture(&Response::new(code)).is_some());
        }
        for code in [101u16, 206, 304, 404, 500, 503] {
            assert!(ResponseSnapshot::capture(&Response::new(code)).is_none());
        }
    }

    #[test]
    fn replay_is_identical() {
        let original = Response::new(StatusCode::OK)
            .header("Content-Type", "font/woff2")
            .body_bytes(vec![0u8, 1, 2, 3]);
        let snapshot = ResponseSnapshot::capture(&original).unwrap();
        assert_eq!(snapshot.to_response(), original);
    }

    #[test]
    fn footprint_counts_key_headers_and_body() {
        let key = CacheKey::new(Method::Get, "https://a.b/c");
        let response = Response::new(StatusCode::OK).header("A", "b").body("xyz");
        let snapshot = ResponseSnapshot::capture(&response).unwrap();
        assert_eq!(snapshot.footprint(&key), 3 + 13 + 2 + 3);
    }
}
