//! The cache served over real TCP: an upstream `Server`, an `HttpFetcher`, and
//! a `CacheProxy` in front of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fetchcache::{
    CacheConfig, CacheProxy, CacheWorker, HttpFetcher, Request, Response, Server, StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Installs a test-friendly subscriber once; `RUST_LOG=fetchcache=debug`
/// shows cache hits, misses and fills for a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

async fn start_upstream(hits: Arc<AtomicUsize>) -> (SocketAddr, JoinHandle<()>) {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let handle = tokio::spawn(async move {
        let _ = server
            .run(move |req: Request| {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if req.path() == "/missing" {
                        return Response::new(StatusCode::NOT_FOUND).body("nope");
                    }
                    Response::new(StatusCode::OK)
                        .header("Content-Type", "text/plain")
                        .body(format!("{} #{n}", req.path()))
                }
            })
            .await;
    });
    (addr, handle)
}

async fn start_proxy(upstream: SocketAddr) -> (SocketAddr, Arc<CacheWorker>) {
    let config = CacheConfig {
        generation_id: "v1".into(),
        origin: Url::parse(&format!("http://{upstream}")).unwrap(),
        precache: vec!["/".into()],
        ..CacheConfig::default()
    };
    // No idle pooling, so stopping the upstream really takes it offline.
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let fetcher = HttpFetcher::with_client(client);
    let worker = Arc::new(CacheWorker::new(config, Arc::new(fetcher)).unwrap());
    worker.on_install().await.unwrap();
    worker.on_activate().await.unwrap();

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let proxy = CacheProxy::new(Arc::clone(&worker));
    tokio::spawn(async move {
        let _ = proxy.serve(server).await;
    });
    (addr, worker)
}

async fn roundtrip(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8(buf).unwrap();

    let status = text[9..12].parse().unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn proxy_serves_cached_assets_after_upstream_dies() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let (upstream, upstream_task) = start_upstream(Arc::clone(&hits)).await;
    let (proxy, worker) = start_proxy(upstream).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "precache of /");

    let (status, logo) = roundtrip(proxy, "/img/logo.png").await;
    assert_eq!(status, 200);
    assert_eq!(logo, "/img/logo.png #2");
    worker.settle().await;

    let (_, again) = roundtrip(proxy, "/img/logo.png").await;
    assert_eq!(again, logo);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    upstream_task.abort();
    let _ = upstream_task.await;

    let (status, offline_logo) = roundtrip(proxy, "/img/logo.png").await;
    assert_eq!(status, 200);
    assert_eq!(offline_logo, logo);

    let (status, home) = roundtrip(proxy, "/").await;
    assert_eq!(status, 200);
    assert_eq!(home, "/ #1");

    let (status, _) = roundtrip(proxy, "/news").await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn proxy_passes_error_statuses_through_uncached() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let (upstream, _task) = start_upstream(Arc::clone(&hits)).await;
    let (proxy, worker) = start_proxy(upstream).await;

    let (status, body) = roundtrip(proxy, "/missing").await;
    worker.settle().await;
    assert_eq!(status, 404);
    assert_eq!(body, "nope");

    let generation = worker.store().current().await.unwrap();
    let urls: Vec<String> = generation
        .keys()
        .await
        .into_iter()
        .map(|k| k.url().to_owned())
        .collect();
    assert_eq!(urls, vec![format!("http://{upstream}/")]);
}

#[tokio::test]
async fn server_keeps_connection_alive_between_requests() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let (upstream, _task) = start_upstream(hits).await;

    let mut stream = TcpStream::connect(upstream).await.unwrap();
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8(buf).unwrap();

    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(text.contains("/a #1"));
    assert!(text.contains("/b #2"));
}

#[tokio::test]
async fn oversized_content_length_gets_413() {
    init_tracing();
    let (upstream, _task) = start_upstream(Arc::new(AtomicUsize::new(0))).await;
    let mut stream = TcpStream::connect(upstream).await.unwrap();
    stream
        .write_all(b"POST /api HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert!(String::from_utf8(buf).unwrap().starts_with("HTTP/1.1 413"));
}

#[tokio::test]
async fn malformed_request_gets_400() {
    init_tracing();
    let (upstream, _task) = start_upstream(Arc::new(AtomicUsize::new(0))).await;
    let mut stream = TcpStream::connect(upstream).await.unwrap();
    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert!(String::from_utf8(buf).unwrap().starts_with("HTTP/1.1 400 Bad Request"));
}
