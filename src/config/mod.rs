//! Cache configuration — generation id, precache list, and classification rules.
//!
//! A deploy bumps `generation_id`; everything else usually stays fixed for the
//! lifetime of an application. Configuration is plain JSON:
//!
//! ```
//! use fetchcache::config::{CacheConfig, PrecachePolicy};
//!
//! let config = CacheConfig::from_json(r#"{
//!     "generation_id": "site-2024-06-01",
//!     "origin": "https://app.example",
//!     "precache": ["/", "/icons/app-192.png"],
//!     "precache_policy": "best_effort"
//! }"#).unwrap();
//!
//! assert_eq!(config.generation_id, "site-2024-06-01");
//! assert_eq!(config.precache_policy, PrecachePolicy::BestEffort);
//! assert_eq!(config.build_prefix, "/assets/");
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating a [`CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What `install` does when one of the precache fetches fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecachePolicy {
    /// Every URL must be fetched with a `2xx` status, or nothing is stored and
    /// installation fails.
    #[default]
    Atomic,
    /// Store what succeeded, report what failed, and keep installing.
    BestEffort,
}

/// Settings for one deployed cache generation. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Version identifier of the cache generation built by this deploy.
    pub generation_id: String,
    /// The serving origin. Requests to any other origin are never cached.
    pub origin: Url,
    /// Critical paths (or absolute same-origin URLs) stored at install time.
    pub precache: Vec<String>,
    pub precache_policy: PrecachePolicy,
    /// Path prefix of hashed build output.
    pub build_prefix: String,
    /// Media, font, model and video extensions served cache-first.
    pub static_extensions: Vec<String>,
    /// Script and style extensions served cache-first.
    pub bundle_extensions: Vec<String>,
    /// Paths that classify as static media but must never be stored.
    pub no_store_paths: Vec<String>,
    /// Upper bound on bytes stored across all generations. `None` is unlimited.
    pub quota_bytes: Option<usize>,
    pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            generation_id: "v1".to_owned(),
            origin: Url::parse("http://localhost").expect("static URL is valid"),
            precache: vec!["/".into(), "/index.html".into(), "/favicon.ico".into()],
            precache_policy: PrecachePolicy::Atomic,
            build_prefix: "/assets/".to_owned(),
            static_extensions: [
                "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "woff", "woff2", "ttf",
                "otf", "eot", "glb", "gltf", "bin", "stl", "hdr", "mp4", "webm",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            bundle_extensions: ["js", "mjs", "css"].into_iter().map(String::from).collect(),
            no_store_paths: vec!["/media/showreel.mp4".into()],
            quota_bytes: None,
            fetch_timeout_ms: 30_000,
        }
    }
}

impl CacheConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Returns the upstream fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Resolves the precache list against the origin.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if an entry is not a valid URL reference or
    /// points at a foreign origin.
    pub fn precache_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.precache
            .iter()
            .map(|entry| {
                let url = self.origin.join(entry).map_err(|e| {
                    ConfigError::Invalid(format!("precache entry {entry:?}: {e}"))
                })?;
                if url.origin() != self.origin.origin() {
                    return Err(ConfigError::Invalid(format!(
                        "precache entry {entry:?} is not on origin {}",
                        self.origin
                    )));
                }
                Ok(url)
            })
            .collect()
    }

    /// Checks the settings that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_id.trim().is_empty() {
            return Err(ConfigError::Invalid("generation_id must not be empty".into()));
        }
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(ConfigError::Invalid(format!(
                "origin {} must be an http(s) URL with a host",
                self.origin
            )));
        }
        if !self.build_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "build_prefix {:?} must start with '/'",
                self.build_prefix
            )));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_ms must be positive".into()));
        }
        self.precache_urls()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.precache_policy, PrecachePolicy::Atomic);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn precache_urls_resolve_against_origin() {
        let config = CacheConfig {
            origin: Url::parse("https://app.example/").unwrap(),
            precache: vec!["/".into(), "/icons/app.png".into()],
            ..CacheConfig::default()
        };
        let urls: Vec<String> = config
            .precache_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec!["https://app.example/", "https://app.example/icons/app.png"]
        );
    }

    #[test]
    fn foreign_precache_entry_is_rejected() {
        let err = CacheConfig::from_json(
            r#"{"origin": "https://app.example", "precache": ["https://cdn.other/x.js"]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn empty_generation_id_is_rejected() {
        let err = CacheConfig::from_json(r#"{"generation_id": "  "}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(
            CacheConfig::from_json("{ nope"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn missing_file() {
        let err = CacheConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
