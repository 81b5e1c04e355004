//! # fetchcache
//!
//! An offline-tolerant, client-side HTTP response cache.
//!
//! Every outbound request is classified by how volatile its resource is and
//! answered with a matching strategy:
//!
//! - content-addressed media and hashed bundles are served **cache-first**;
//! - pages and API responses are fetched **network-first**, falling back to the
//!   cache only when the network fails;
//! - non-GET and cross-origin requests **pass through** untouched.
//!
//! Entries live in versioned cache *generations*. A deploy bumps the
//! generation id; installing the new worker precaches the critical paths and
//! activating it destroys every older generation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fetchcache::{CacheConfig, CacheWorker, HttpFetcher, Request};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json(r#"{
//!         "generation_id": "2024-06-01",
//!         "origin": "https://app.example",
//!         "precache": ["/", "/favicon.ico"]
//!     }"#)?;
//!     let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
//!     let worker = CacheWorker::new(config, fetcher)?;
//!
//!     worker.on_install().await?;
//!     worker.on_activate().await?;
//!
//!     let logo = worker.fetch(Request::get("https://app.example/img/logo.webp")?).await?;
//!     println!("{} bytes", logo.body_ref().len());
//!     Ok(())
//! }
//! ```

// ── Cache core ────────────────────────────────────────────────────────────────
pub mod cache;
pub mod classify;
pub mod gateway;
pub mod strategy;
pub mod worker;

// ── Supporting infrastructure ─────────────────────────────────────────────────
pub mod background;
pub mod config;
pub mod fetch;
pub mod http;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheGeneration, CacheKey, CacheStore, ResponseSnapshot};
pub use classify::{Classifier, VolatilityClass};
pub use config::{CacheConfig, PrecachePolicy};
pub use fetch::{Fetch, FetchError, HttpFetcher};
pub use gateway::{Gateway, Interception};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{CacheProxy, Server, ServerError};
pub use strategy::Strategy;
pub use worker::{CacheWorker, WorkerState};
