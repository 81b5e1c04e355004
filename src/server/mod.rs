//! Host adapter — a local HTTP/1.1 server that routes every request through a
//! [`CacheWorker`].
//!
//! [`Server`] accepts TCP connections and dispatches parsed requests to any
//! async handler; it supports persistent connections out of the box.
//! [`CacheProxy`] is the handler that puts the cache in front of an upstream:
//! intercepted requests get the strategy's answer, declined ones are forwarded
//! untouched, and a fetch failure with no cached fallback becomes a
//! `502 Bad Gateway`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::worker::CacheWorker;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot derive a base URL from {0}")]
    BaseUrl(SocketAddr),
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// A minimal async HTTP/1.1 server.
///
/// Request targets are resolved against a base URL, which defaults to the
/// server's own address. A [`CacheProxy`] replaces it with the cached origin
/// so that `GET /app.js` on the local port means `GET https://origin/app.js`.
///
/// # Examples
///
/// ```rust,no_run
/// use fetchcache::server::Server;
/// use fetchcache::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    base: Url,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let base = Url::parse(&format!("http://{local_addr}/"))
            .map_err(|_| ServerError::BaseUrl(local_addr))?;
        Ok(Self {
            listener,
            local_addr,
            base,
        })
    }

    /// Resolves relative request targets against `base` instead of the local address.
    #[must_use]
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = base;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks, so it must be `Send + Sync + 'static`. Runs until the
    /// listener fails or the task is dropped.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let base = Arc::new(self.base);
        info!(address = %self.local_addr, base = %base, "fetchcache listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let base = Arc::clone(&base);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, &base, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime, one request per loop
/// iteration, until the peer closes or sends `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    base: &Url,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Pipelined requests may already be buffered; only read when we must.
        let parsed = match Request::parse(&buf, base) {
            Ok(pair) => Some(pair),
            Err(RequestError::Incomplete) => None,
            Err(e @ RequestError::BodyTooLarge { .. }) => {
                warn!(peer = %peer_addr, error = %e, "request too large — sending 413");
                let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                    .body("Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let Some((request, consumed)) = parsed else {
            if buf.len() > MAX_REQUEST_SIZE {
                warn!(peer = %peer_addr, "request too large — sending 413");
                let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                    .body("Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
            continue;
        };

        let keep_alive = !request.wants_close();
        debug!(
            peer = %peer_addr,
            method = %request.method(),
            url = %request.url(),
            "dispatching request"
        );

        let response = handler(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(consumed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

/// Serves a [`CacheWorker`] over HTTP.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fetchcache::config::CacheConfig;
/// use fetchcache::fetch::HttpFetcher;
/// use fetchcache::server::{CacheProxy, Server};
/// use fetchcache::worker::CacheWorker;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = CacheConfig::from_path("fetchcache.json")?;
///     let fetcher = HttpFetcher::from_config(&config)?;
///     let worker = Arc::new(CacheWorker::new(config, Arc::new(fetcher))?);
///     worker.on_install().await?;
///     worker.on_activate().await?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     CacheProxy::new(worker).serve(server).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CacheProxy {
    worker: Arc<CacheWorker>,
}

impl CacheProxy {
    /// Creates a proxy that answers through `worker`.
    pub fn new(worker: Arc<CacheWorker>) -> Self {
        Self { worker }
    }

    /// Answers one request through the worker.
    pub async fn handle(&self, request: Request) -> Response {
        let url = request.url().to_string();
        match self.worker.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "upstream unavailable and nothing cached");
                Response::new(StatusCode::BAD_GATEWAY).body(format!("upstream unavailable: {e}"))
            }
        }
    }

    /// Runs `server` with this proxy as its handler, resolving request
    /// targets against the worker's origin.
    pub async fn serve(self, server: Server) -> Result<(), ServerError> {
        let server = server.with_base(self.worker.config().origin.clone());
        let proxy = Arc::new(self);
        server
            .run(move |request: Request| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.handle(request).await }
            })
            .await
    }
}
