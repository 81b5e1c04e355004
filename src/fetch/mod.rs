//! Upstream fetch — the network capability the strategies call into.
//!
//! [`Fetch`] is object safe so the cache can hold an `Arc<dyn Fetch>`. Any
//! async closure `Fn(Request) -> impl Future<Output = Result<Response, FetchError>>`
//! implements it, which keeps scripted upstreams in tests down to a few lines.
//! [`HttpFetcher`] is the production implementation on top of `reqwest`.
//!
//! An HTTP error status is *not* a fetch failure: a `404` or `503` comes back as
//! an ordinary [`Response`]. Only transport problems become [`FetchError`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::CacheConfig;
use crate::http::{Headers, Request, Response, StatusCode};

/// A transport-level failure to obtain any response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Shorthand for a [`FetchError::Network`] failure.
    pub fn network(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Boxed future returned by [`Fetch::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Response, FetchError>> + Send>>;

/// Capability to send a request upstream and buffer the full response.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, request: Request) -> FetchFuture;
}

impl<T, F> Fetch for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, FetchError>> + Send + 'static,
{
    fn fetch(&self, request: Request) -> FetchFuture {
        Box::pin((self)(request))
    }
}

// Headers describing the hop to us rather than the resource.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "te",
];

/// [`Fetch`] implementation backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Builds a fetcher using the configured timeout.
    pub fn from_config(config: &CacheConfig) -> Result<Self, FetchError> {
        Self::new(config.fetch_timeout())
    }

    /// Wraps a preconfigured client (proxies, pooling, TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, request: Request) -> FetchFuture {
        let client = self.client.clone();
        Box::pin(send(client, request))
    }
}

async fn send(client: reqwest::Client, request: Request) -> Result<Response, FetchError> {
    let url = request.url().to_string();
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|e| FetchError::InvalidRequest(format!("method {}: {e}", request.method())))?;

    let mut builder = client.request(method, request.url().clone());
    for (name, value) in request.headers().iter() {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !request.body().is_empty() {
        builder = builder.body(request.body().clone());
    }

    let upstream = builder.send().await.map_err(|e| map_reqwest(&url, e))?;
    let status = StatusCode::from_u16(upstream.status().as_u16());
    let headers: Headers = upstream
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();

    // The body is fully buffered before a response exists, so a dropped
    // connection mid-body is a fetch failure rather than a truncated entry.
    let body = upstream.bytes().await.map_err(|e| map_reqwest(&url, e))?;

    debug!(url = %url, status = status.as_u16(), bytes = body.len(), "upstream fetch complete");
    Ok(Response::from_parts(status, headers, body))
}

fn map_reqwest(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_owned(),
        }
    } else {
        FetchError::network(url, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_fetchers() {
        let fetcher = |req: Request| async move {
            Ok::<_, FetchError>(Response::new(StatusCode::OK).body(req.path().to_owned()))
        };
        let response = fetcher
            .fetch(Request::get("https://app.example/hello").unwrap())
            .await
            .unwrap();
        assert_eq!(response.body_ref().as_ref(), b"/hello");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
        // Nothing listens on the discard port.
        let err = fetcher
            .fetch(Request::get("http://127.0.0.1:9/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Network { .. } | FetchError::Timeout { .. }
        ));
    }
}
