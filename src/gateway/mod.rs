//! Interception gateway — the single entry point for outbound requests.
//!
//! Every request the host issues goes through [`Gateway::intercept`]. The
//! gateway classifies it, declines anything ineligible (the host then sends it
//! unmodified), and otherwise runs the matching strategy against the gateway's
//! own cache generation. That only happens while the generation is the
//! store's current one.

use std::sync::Arc;

use tracing::trace;

use crate::cache::{CacheGeneration, CacheStore};
use crate::classify::{Classifier, VolatilityClass};
use crate::fetch::FetchError;
use crate::http::{Request, Response};
use crate::strategy::{Strategy, StrategyExecutor};

/// Result of offering a request to the gateway.
#[derive(Debug)]
pub enum Interception {
    /// The gateway answered the request (from cache, network, or both).
    Handled(Result<Response, FetchError>),
    /// The gateway declined; the host should send the request as-is.
    PassThrough(Request),
}

/// Entry point for requests bound to one cache generation.
pub struct Gateway {
    generation_id: String,
    classifier: Classifier,
    store: Arc<CacheStore>,
    executor: StrategyExecutor,
}

impl Gateway {
    /// Creates a gateway that serves from `generation_id` once it is current.
    pub fn new(
        generation_id: impl Into<String>,
        classifier: Classifier,
        store: Arc<CacheStore>,
        executor: StrategyExecutor,
    ) -> Self {
        Self {
            generation_id: generation_id.into(),
            classifier,
            store,
            executor,
        }
    }

    /// Returns the classifier used to pick a strategy.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Returns the executor that runs strategies and owns the fill queue.
    pub fn executor(&self) -> &StrategyExecutor {
        &self.executor
    }

    /// The generation this gateway serves from, if it is the current one.
    pub async fn active_generation(&self) -> Option<Arc<CacheGeneration>> {
        self.store
            .current()
            .await
            .filter(|generation| generation.id() == self.generation_id)
    }

    /// Offers `request` to the cache.
    pub async fn intercept(&self, request: Request) -> Interception {
        let class = self.classifier.classify(&request);
        if class == VolatilityClass::Ineligible {
            trace!(method = %request.method(), url = %request.url(), "ineligible, passing through");
            return Interception::PassThrough(request);
        }

        let Some(generation) = self.active_generation().await else {
            trace!(url = %request.url(), "no active generation, passing through");
            return Interception::PassThrough(request);
        };

        let strategy = Strategy::for_class(class);
        let storable = !self.classifier.is_no_store(&request);
        trace!(url = %request.url(), %class, ?strategy, "intercepted");
        Interception::Handled(
            self.executor
                .execute(strategy, request, &generation, storable)
                .await,
        )
    }

    /// Intercepts `request`, forwarding it untouched if the gateway declines.
    pub async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        match self.intercept(request).await {
            Interception::Handled(result) => result,
            Interception::PassThrough(request) => self.executor.pass_through(request).await,
        }
    }
}
