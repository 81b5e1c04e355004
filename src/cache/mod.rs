//! Cache generation store — named, versioned cache containers.
//!
//! A [`CacheStore`] owns every [`CacheGeneration`] plus an explicit pointer to
//! the one currently serving traffic. Generations are created at install time,
//! promoted at activation, and destroyed wholesale by
//! [`evict_all_except`](CacheStore::evict_all_except); nothing ever expires
//! individual entries inside a generation.
//!
//! ```
//! use fetchcache::cache::CacheStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = CacheStore::new();
//! store.open("v1").await;
//! store.open("v2").await;
//! store.promote("v2").await.unwrap();
//!
//! assert_eq!(store.evict_all_except("v2").await, vec!["v1".to_string()]);
//! assert_eq!(store.list_generations().await, vec!["v2".to_string()]);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PrecachePolicy;
use crate::fetch::{Fetch, FetchError};
use crate::http::{Method, Request, StatusCode};

pub mod generation;
pub mod snapshot;

pub use generation::CacheGeneration;
pub use snapshot::{CacheKey, ResponseSnapshot};

use generation::Quota;

/// Storage-level failures. Always recovered silently on the serving path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("cache generation {0:?} has been destroyed")]
    Destroyed(String),

    #[error("unknown cache generation {0:?}")]
    UnknownGeneration(String),
}

/// Why a precache run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrecacheError {
    #[error("precache fetch of {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("precache fetch of {url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("precache could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a successful [`CacheStore::precache`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
    pub generation_id: String,
    /// URLs now held by the generation.
    pub stored: Vec<String>,
    /// URLs skipped under [`PrecachePolicy::BestEffort`], with the reason.
    pub failed: Vec<(String, PrecacheError)>,
}

impl PrecacheReport {
    /// Returns `true` if every URL was stored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns every cache generation and the pointer to the current one.
#[derive(Debug)]
pub struct CacheStore {
    generations: RwLock<HashMap<String, Arc<CacheGeneration>>>,
    current: RwLock<Option<Arc<CacheGeneration>>>,
    quota: Arc<Quota>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates an empty store with no byte limit.
    pub fn new() -> Self {
        Self::with_quota(None)
    }

    /// Creates an empty store whose generations share a byte budget.
    pub fn with_quota(limit: Option<usize>) -> Self {
        Self {
            generations: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            quota: Arc::new(Quota::new(limit)),
        }
    }

    /// Returns the generation named `id`, creating it if needed.
    pub async fn open(&self, id: &str) -> Arc<CacheGeneration> {
        if let Some(existing) = self.generations.read().await.get(id) {
            return Arc::clone(existing);
        }
        let mut generations = self.generations.write().await;
        let generation = generations.entry(id.to_owned()).or_insert_with(|| {
            debug!(generation = id, "cache generation created");
            Arc::new(CacheGeneration::new(id, Arc::clone(&self.quota)))
        });
        Arc::clone(generation)
    }

    /// Returns the generation named `id` without creating it.
    pub async fn get(&self, id: &str) -> Option<Arc<CacheGeneration>> {
        self.generations.read().await.get(id).cloned()
    }

    /// Ids of every live generation, sorted.
    pub async fn list_generations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.generations.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The generation serving traffic, if one has been promoted.
    pub async fn current(&self) -> Option<Arc<CacheGeneration>> {
        self.current.read().await.clone()
    }

    /// Makes `id` the current generation. Lookups through [`current`](Self::current)
    /// stop seeing the previous generation immediately.
    pub async fn promote(&self, id: &str) -> Result<Arc<CacheGeneration>, StoreError> {
        let generation = self
            .get(id)
            .await
            .ok_or_else(|| StoreError::UnknownGeneration(id.to_owned()))?;
        let previous = self.current.write().await.replace(Arc::clone(&generation));
        info!(
            generation = id,
            previous = previous.as_ref().map(|g| g.id()).unwrap_or("none"),
            "cache generation promoted"
        );
        Ok(generation)
    }

    /// Destroys the generation named `id`. Returns `false` if it did not exist.
    ///
    /// The current generation is never deleted this way.
    pub async fn delete(&self, id: &str) -> bool {
        if self.current().await.is_some_and(|g| g.id() == id) {
            warn!(generation = id, "refusing to delete the current cache generation");
            return false;
        }
        let removed = self.generations.write().await.remove(id);
        match removed {
            Some(generation) => {
                generation.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroys every generation except `current_id`, returning the evicted ids.
    pub async fn evict_all_except(&self, current_id: &str) -> Vec<String> {
        let stale: Vec<Arc<CacheGeneration>> = {
            let mut generations = self.generations.write().await;
            let ids: Vec<String> = generations
                .keys()
                .filter(|id| id.as_str() != current_id)
                .cloned()
                .collect();
            ids.iter().filter_map(|id| generations.remove(id)).collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for generation in stale {
            let entries = generation.destroy().await;
            info!(generation = generation.id(), entries, "stale cache generation evicted");
            evicted.push(generation.id().to_owned());
        }
        evicted.sort();

        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|g| g.id() != current_id) {
            *current = None;
        }
        evicted
    }

    /// Bytes currently charged against the store's quota.
    pub fn used_bytes(&self) -> usize {
        self.quota.used()
    }

    /// Fetches every URL and stores the responses in generation `id`.
    ///
    /// Under [`PrecachePolicy::Atomic`] all fetches run first; the entries are
    /// written in one all-or-nothing batch only if every fetch returned `2xx`,
    /// otherwise the first failure (in list order) is returned and nothing is
    /// stored. Under [`PrecachePolicy::BestEffort`] each success is stored and
    /// each failure is recorded in the report.
    pub async fn precache(
        &self,
        id: &str,
        urls: &[Url],
        fetcher: &dyn Fetch,
        policy: PrecachePolicy,
    ) -> Result<PrecacheReport, PrecacheError> {
        let generation = self.open(id).await;

        let results = join_all(urls.iter().map(|url| {
            let request = Request::new(Method::Get, url.clone());
            let key = CacheKey::for_request(&request);
            async move {
                let result = match fetcher.fetch(request).await {
                    Ok(response) => ResponseSnapshot::capture(&response).ok_or_else(|| {
                        PrecacheError::Status {
                            url: url.to_string(),
                            status: response.status(),
                        }
                    }),
                    Err(source) => Err(PrecacheError::Fetch {
                        url: url.to_string(),
                        source,
                    }),
                };
                (key, result)
            }
        }))
        .await;

        let mut report = PrecacheReport {
            generation_id: id.to_owned(),
            ..PrecacheReport::default()
        };

        match policy {
            PrecachePolicy::Atomic => {
                let mut batch = Vec::with_capacity(results.len());
                for (key, result) in results {
                    batch.push((key, result?));
                }
                report.stored = batch.iter().map(|(key, _)| key.url().to_owned()).collect();
                generation.put_all(batch).await?;
            }
            PrecachePolicy::BestEffort => {
                for (key, result) in results {
                    let url = key.url().to_owned();
                    let stored = match result {
                        Ok(snapshot) => generation.put(key, snapshot).await.map_err(Into::into),
                        Err(e) => Err(e),
                    };
                    match stored {
                        Ok(()) => report.stored.push(url),
                        Err(e) => {
                            warn!(generation = id, url = %url, error = %e, "precache entry skipped");
                            report.failed.push((url, e));
                        }
                    }
                }
            }
        }

        info!(
            generation = id,
            stored = report.stored.len(),
            failed = report.failed.len(),
            "precache finished"
        );
        Ok(report)
    }
}
