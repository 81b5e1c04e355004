//! Cache worker lifecycle — install, activate, then intercept.
//!
//! One [`CacheWorker`] exists per deployed generation id. The host drives it
//! through three signals:
//!
//! 1. [`on_install`](CacheWorker::on_install) precaches the critical paths into
//!    a fresh generation. A worker that installed successfully is ready to take
//!    over immediately; it does not wait for older workers to go idle.
//! 2. [`on_activate`](CacheWorker::on_activate) promotes the generation,
//!    destroys every other one, and claims all clients: from here on every
//!    request is intercepted.
//! 3. [`on_request`](CacheWorker::on_request) is the per-request hook.
//!
//! ```
//! use std::sync::Arc;
//! use fetchcache::config::CacheConfig;
//! use fetchcache::fetch::FetchError;
//! use fetchcache::http::{Request, Response, StatusCode};
//! use fetchcache::worker::{CacheWorker, WorkerState};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = CacheConfig::from_json(r#"{
//!     "generation_id": "v7",
//!     "origin": "https://app.example",
//!     "precache": ["/"]
//! }"#).unwrap();
//! let upstream = |_req: Request| async {
//!     Ok::<_, FetchError>(Response::new(StatusCode::OK).body("<html>"))
//! };
//!
//! let worker = CacheWorker::new(config, Arc::new(upstream)).unwrap();
//! worker.on_install().await.unwrap();
//! worker.on_activate().await.unwrap();
//! assert_eq!(worker.state(), WorkerState::Activated);
//!
//! let page = worker.fetch(Request::get("https://app.example/").unwrap()).await.unwrap();
//! assert_eq!(page.body_ref().as_ref(), b"<html>");
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::background::FillQueue;
use crate::cache::{CacheStore, PrecacheError, PrecacheReport, StoreError};
use crate::classify::Classifier;
use crate::config::{CacheConfig, ConfigError};
use crate::fetch::{Fetch, FetchError};
use crate::gateway::{Gateway, Interception};
use crate::http::{Request, Response};
use crate::strategy::StrategyExecutor;

/// Lifecycle state of a [`CacheWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, not yet installed.
    Parsed,
    Installing,
    /// Precache complete; ready to activate without waiting.
    Installed,
    Activating,
    /// Current generation; intercepting every client request.
    Activated,
    /// Installation failed. The worker will never serve.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`CacheWorker::on_install`].
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("cannot install a worker in state {0}")]
    InvalidState(WorkerState),

    #[error("precache for generation {generation} failed: {source}")]
    Precache {
        generation: String,
        #[source]
        source: PrecacheError,
    },

    #[error("generation {0} is already serving and cannot be reinstalled")]
    AlreadyCurrent(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors returned by [`CacheWorker::on_activate`].
#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("cannot activate a worker in state {0}")]
    InvalidState(WorkerState),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the cache core for one generation id and reacts to lifecycle signals.
pub struct CacheWorker {
    config: CacheConfig,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetch>,
    gateway: Gateway,
    state: Mutex<WorkerState>,
}

impl CacheWorker {
    /// Creates a worker with its own, empty store.
    pub fn new(config: CacheConfig, fetcher: Arc<dyn Fetch>) -> Result<Self, ConfigError> {
        let store = Arc::new(CacheStore::with_quota(config.quota_bytes));
        Self::with_store(config, fetcher, store)
    }

    /// Creates a worker over an existing store, as a new deploy does when
    /// generations from previous deploys are still on disk.
    pub fn with_store(
        config: CacheConfig,
        fetcher: Arc<dyn Fetch>,
        store: Arc<CacheStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = StrategyExecutor::new(Arc::clone(&fetcher), Arc::new(FillQueue::new()));
        let gateway = Gateway::new(
            config.generation_id.clone(),
            Classifier::from_config(&config),
            Arc::clone(&store),
            executor,
        );
        Ok(Self {
            config,
            store,
            fetcher,
            gateway,
            state: Mutex::new(WorkerState::Parsed),
        })
    }

    /// Returns the configuration this worker was built from.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the id of the generation this worker installs and serves.
    pub fn generation_id(&self) -> &str {
        &self.config.generation_id
    }

    /// Returns the store shared with other workers.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Returns the gateway that answers this worker's requests.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    /// Precaches the configured critical paths into this worker's generation.
    ///
    /// On failure the worker becomes [`WorkerState::Redundant`], its generation
    /// is discarded and nothing is promoted.
    ///
    /// A generation that is already current is never precached into again:
    /// installing its id a second time fails with
    /// [`InstallError::AlreadyCurrent`] and leaves the serving entries alone.
    pub async fn on_install(&self) -> Result<PrecacheReport, InstallError> {
        self.transition(&[WorkerState::Parsed], WorkerState::Installing)
            .map_err(InstallError::InvalidState)?;

        let id = self.generation_id();
        if self.store.current().await.is_some_and(|g| g.id() == id) {
            warn!(generation = id, "generation already serving, refusing reinstall");
            self.set_state(WorkerState::Redundant);
            return Err(InstallError::AlreadyCurrent(id.to_owned()));
        }
        info!(generation = id, "installing cache worker");

        let result = match self.config.precache_urls() {
            Ok(urls) => self
                .store
                .precache(id, &urls, self.fetcher.as_ref(), self.config.precache_policy)
                .await
                .map_err(|source| InstallError::Precache {
                    generation: id.to_owned(),
                    source,
                }),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(report) => {
                self.set_state(WorkerState::Installed);
                info!(generation = id, "cache worker installed, skipping wait");
                Ok(report)
            }
            Err(e) => {
                error!(generation = id, error = %e, "cache worker install failed");
                self.store.delete(id).await;
                self.set_state(WorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Promotes this worker's generation, evicts all others, and claims clients.
    ///
    /// Returns the ids of the evicted generations.
    pub async fn on_activate(&self) -> Result<Vec<String>, ActivateError> {
        self.transition(&[WorkerState::Installed], WorkerState::Activating)
            .map_err(ActivateError::InvalidState)?;

        let id = self.generation_id();
        if let Err(e) = self.store.promote(id).await {
            self.set_state(WorkerState::Installed);
            return Err(e.into());
        }
        let evicted = self.store.evict_all_except(id).await;

        self.set_state(WorkerState::Activated);
        info!(generation = id, evicted = evicted.len(), "cache worker activated, clients claimed");
        Ok(evicted)
    }

    /// The per-request hook.
    pub async fn on_request(&self, request: Request) -> Interception {
        self.gateway.intercept(request).await
    }

    /// Answers `request` through the cache, or straight from upstream if the
    /// cache declines it.
    pub async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        self.gateway.fetch(request).await
    }

    /// Waits for every background cache fill spawned so far.
    pub async fn settle(&self) {
        self.gateway.executor().fills().drain().await;
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: WorkerState) {
        *self.lock_state() = next;
    }

    // Moves to `next` if the current state is one of `from`; returns the
    // offending state otherwise.
    fn transition(&self, from: &[WorkerState], next: WorkerState) -> Result<(), WorkerState> {
        let mut state = self.lock_state();
        if !from.contains(&*state) {
            return Err(*state);
        }
        *state = next;
        Ok(())
    }
}
