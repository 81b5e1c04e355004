//! Caching strategies — how a classified request is answered.
//!
//! | Strategy        | Used for                           | Network                       |
//! |-----------------|------------------------------------|-------------------------------|
//! | `CacheFirst`    | `ImmutableStatic`, `StableBundle`  | only on a miss                |
//! | `NetworkFirst`  | `Dynamic`                          | always; cache on failure      |
//! | `PassThrough`   | `Ineligible`                       | always; cache never touched   |
//!
//! Cache-first is only safe because those URLs are content-addressed: a hit
//! can never be stale. Anything that can change under the same URL pays one
//! round-trip for freshness instead.
//!
//! Writes are handed to a [`FillQueue`] and never awaited on the response
//! path, so a slow or failing store cannot delay or fail a response.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::background::FillQueue;
use crate::cache::{CacheGeneration, CacheKey, ResponseSnapshot};
use crate::classify::VolatilityClass;
use crate::fetch::{Fetch, FetchError};
use crate::http::{Request, Response};

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    PassThrough,
}

impl Strategy {
    /// Returns the strategy bound to a volatility class.
    pub fn for_class(class: VolatilityClass) -> Self {
        match class {
            VolatilityClass::ImmutableStatic | VolatilityClass::StableBundle => Self::CacheFirst,
            VolatilityClass::Dynamic => Self::NetworkFirst,
            VolatilityClass::Ineligible => Self::PassThrough,
        }
    }
}

/// Runs strategies against an upstream [`Fetch`] and a cache generation.
#[derive(Clone)]
pub struct StrategyExecutor {
    fetcher: Arc<dyn Fetch>,
    fills: Arc<FillQueue>,
}

impl StrategyExecutor {
    /// Creates an executor that fetches through `fetcher` and hands cache
    /// writes to `fills`.
    pub fn new(fetcher: Arc<dyn Fetch>, fills: Arc<FillQueue>) -> Self {
        Self { fetcher, fills }
    }

    /// Returns the queue tracking background cache writes.
    pub fn fills(&self) -> &Arc<FillQueue> {
        &self.fills
    }

    /// Answers `request` with `strategy`.
    ///
    /// `storable` is `false` for resources that may be served from cache but
    /// must never be written to it.
    pub async fn execute(
        &self,
        strategy: Strategy,
        request: Request,
        generation: &Arc<CacheGeneration>,
        storable: bool,
    ) -> Result<Response, FetchError> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request, generation, storable).await,
            Strategy::NetworkFirst => self.network_first(request, generation, storable).await,
            Strategy::PassThrough => self.pass_through(request).await,
        }
    }

    /// Serves from `generation` when possible; otherwise fetches and fills.
    pub async fn cache_first(
        &self,
        request: Request,
        generation: &Arc<CacheGeneration>,
        storable: bool,
    ) -> Result<Response, FetchError> {
        let key = CacheKey::for_request(&request);
        if let Some(hit) = generation.get(&key).await {
            debug!(key = %key, generation = generation.id(), "cache hit");
            return Ok(hit.to_response());
        }

        debug!(key = %key, generation = generation.id(), "cache miss");
        let response = self.fetcher.fetch(request).await?;
        if storable {
            self.schedule_fill(generation, key, &response);
        } else {
            debug!(key = %key, "no-store resource, skipping cache fill");
        }
        Ok(response)
    }

    /// Fetches first; falls back to `generation` only on a transport failure.
    pub async fn network_first(
        &self,
        request: Request,
        generation: &Arc<CacheGeneration>,
        storable: bool,
    ) -> Result<Response, FetchError> {
        let key = CacheKey::for_request(&request);
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if storable {
                    self.schedule_fill(generation, key, &response);
                }
                Ok(response)
            }
            Err(err) => match generation.get(&key).await {
                Some(fallback) => {
                    warn!(key = %key, error = %err, "network failed, serving cached copy");
                    Ok(fallback.to_response())
                }
                None => {
                    debug!(key = %key, error = %err, "network failed and nothing cached");
                    Err(err)
                }
            },
        }
    }

    /// Forwards the request untouched. No cache involvement.
    pub async fn pass_through(&self, request: Request) -> Result<Response, FetchError> {
        self.fetcher.fetch(request).await
    }

    // Spawns the write of a complete 2xx response; anything else is not stored.
    fn schedule_fill(&self, generation: &Arc<CacheGeneration>, key: CacheKey, response: &Response) {
        let Some(snapshot) = ResponseSnapshot::capture(response) else {
            debug!(key = %key, status = response.status().as_u16(), "response not cacheable");
            return;
        };
        let generation = Arc::clone(generation);
        self.fills.spawn(async move {
            let id = generation.id().to_owned();
            let label = key.to_string();
            match generation.put(key, snapshot).await {
                Ok(()) => debug!(key = %label, generation = %id, "cache filled"),
                Err(e) => warn!(key = %label, generation = %id, error = %e, "cache fill dropped"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::cache::CacheStore;
    use crate::http::StatusCode;

    /// Scripted upstream: counts calls, can be taken offline, and serves a
    /// body that changes on every call.
    #[derive(Default)]
    struct Upstream {
        calls: AtomicUsize,
        offline: AtomicBool,
        status: Mutex<Option<StatusCode>>,
    }

    impl Upstream {
        fn fetcher(self: &Arc<Self>) -> Arc<dyn Fetch> {
            let upstream = Arc::clone(self);
            Arc::new(move |req: Request| {
                let upstream = Arc::clone(&upstream);
                async move {
                    let n = upstream.calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if upstream.offline.load(Ordering::SeqCst) {
                        return Err(FetchError::network(req.url().as_str(), "offline"));
                    }
                    let status = upstream.status.lock().unwrap().unwrap_or(StatusCode::OK);
                    Ok(Response::new(status).body(format!("{} #{n}", req.path())))
                }
            })
        }
    }

    async fn setup() -> (Arc<Upstream>, StrategyExecutor, Arc<CacheGeneration>) {
        let upstream = Arc::new(Upstream::default());
        let executor = StrategyExecutor::new(upstream.fetcher(), Arc::new(FillQueue::new()));
        let generation = CacheStore::new().open("v1").await;
        (upstream, executor, generation)
    }

    fn get(path: &str) -> Request {
        Request::get(&format!("https://app.example{path}")).unwrap()
    }

    fn body(response: &Response) -> &str {
        std::str::from_utf8(response.body_ref()).unwrap()
    }

    #[test]
    fn strategy_per_class() {
        assert_eq!(
            Strategy::for_class(VolatilityClass::ImmutableStatic),
            Strategy::CacheFirst
        );
        assert_eq!(
            Strategy::for_class(VolatilityClass::StableBundle),
            Strategy::CacheFirst
        );
        assert_eq!(
            Strategy::for_class(VolatilityClass::Dynamic),
            Strategy::NetworkFirst
        );
        assert_eq!(
            Strategy::for_class(VolatilityClass::Ineligible),
            Strategy::PassThrough
        );
    }

    #[tokio::test]
    async fn cache_first_hit_skips_network() {
        let (upstream, executor, generation) = setup().await;

        let first = executor.cache_first(get("/a.png"), &generation, true).await.unwrap();
        executor.fills().drain().await;
        let second = executor.cache_first(get("/a.png"), &generation, true).await.unwrap();

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(body(&first), "/a.png #1");
        assert_eq!(body(&second), "/a.png #1");
    }

    #[tokio::test]
    async fn cache_first_miss_offline_propagates() {
        let (upstream, executor, generation) = setup().await;
        upstream.offline.store(true, Ordering::SeqCst);
        let err = executor
            .cache_first(get("/a.png"), &generation, true)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }

    #[tokio::test]
    async fn cache_first_does_not_store_errors() {
        let (upstream, executor, generation) = setup().await;
        *upstream.status.lock().unwrap() = Some(StatusCode::NOT_FOUND);

        let response = executor.cache_first(get("/a.png"), &generation, true).await.unwrap();
        executor.fills().drain().await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(generation.is_empty().await);
    }

    #[tokio::test]
    async fn ranged_response_is_not_stored_under_full_key() {
        let fetcher: Arc<dyn Fetch> = Arc::new(|req: Request| async move {
            let status = if req.headers().contains("range") {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            Ok::<_, FetchError>(Response::new(status).body("first-100-bytes"))
        });
        let executor = StrategyExecutor::new(fetcher, Arc::new(FillQueue::new()));
        let generation = CacheStore::new().open("v1").await;

        let ranged = get("/video.webm").header("Range", "bytes=0-99");
        let partial = executor.cache_first(ranged, &generation, true).await.unwrap();
        executor.fills().drain().await;

        assert_eq!(partial.status(), StatusCode::PARTIAL_CONTENT);
        let key = CacheKey::for_request(&get("/video.webm"));
        assert!(generation.get(&key).await.is_none());

        let full = executor.cache_first(get("/video.webm"), &generation, true).await.unwrap();
        assert_eq!(full.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_store_resource_is_never_written() {
        let (upstream, executor, generation) = setup().await;
        for _ in 0..3 {
            executor.cache_first(get("/big.mp4"), &generation, false).await.unwrap();
            executor.fills().drain().await;
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
        assert!(generation.is_empty().await);
    }

    #[tokio::test]
    async fn network_first_prefers_fresh_response() {
        let (_upstream, executor, generation) = setup().await;

        executor.network_first(get("/page"), &generation, true).await.unwrap();
        executor.fills().drain().await;
        let second = executor.network_first(get("/page"), &generation, true).await.unwrap();
        executor.fills().drain().await;

        assert_eq!(body(&second), "/page #2");
        let key = CacheKey::for_request(&get("/page"));
        let stored = generation.get(&key).await.unwrap();
        assert_eq!(stored.body().as_ref(), b"/page #2");
    }

    #[tokio::test]
    async fn network_first_falls_back_when_offline() {
        let (upstream, executor, generation) = setup().await;
        executor.network_first(get("/page"), &generation, true).await.unwrap();
        executor.fills().drain().await;

        upstream.offline.store(true, Ordering::SeqCst);
        let fallback = executor.network_first(get("/page"), &generation, true).await.unwrap();
        assert_eq!(body(&fallback), "/page #1");

        let err = executor
            .network_first(get("/other"), &generation, true)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }

    #[tokio::test]
    async fn network_first_returns_error_status_without_fallback() {
        let (upstream, executor, generation) = setup().await;
        executor.network_first(get("/page"), &generation, true).await.unwrap();
        executor.fills().drain().await;

        *upstream.status.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);
        let response = executor.network_first(get("/page"), &generation, true).await.unwrap();
        executor.fills().drain().await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let key = CacheKey::for_request(&get("/page"));
        assert_eq!(generation.get(&key).await.unwrap().body().as_ref(), b"/page #1");
    }

    #[tokio::test]
    async fn fill_into_destroyed_generation_is_dropped() {
        let (_upstream, executor, generation) = setup().await;
        generation.destroy().await;
        let response = executor.cache_first(get("/a.png"), &generation, true).await.unwrap();
        executor.fills().drain().await;
        assert!(response.is_success());
        assert!(generation.is_empty().await);
    }
}
