//! Asset classification — maps a request to the volatility class that picks
//! its caching strategy.
//!
//! Rules are checked in order and the first match wins:
//!
//! | Rule                                              | Class              |
//! |---------------------------------------------------|--------------------|
//! | method is not `GET`, or origin differs            | `Ineligible`       |
//! | extension is media / font / model / video         | `ImmutableStatic`  |
//! | path under the build prefix, or script/style ext  | `StableBundle`     |
//! | anything else                                     | `Dynamic`          |

use std::collections::HashSet;
use std::fmt;

use url::{Origin, Url};

use crate::config::CacheConfig;
use crate::http::{Method, Request};

/// How volatile a resource is, and therefore how it may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolatilityClass {
    /// Content-addressed media, fonts, 3D models and video.
    ImmutableStatic,
    /// Hashed build output: script and style bundles.
    StableBundle,
    /// Pages, API responses, anything that can change under the same URL.
    Dynamic,
    /// Non-GET or cross-origin; bypasses the cache entirely.
    Ineligible,
}

impl VolatilityClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImmutableStatic => "immutable-static",
            Self::StableBundle => "stable-bundle",
            Self::Dynamic => "dynamic",
            Self::Ineligible => "ineligible",
        }
    }
}

impl fmt::Display for VolatilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies requests against a fixed serving origin and rule set.
///
/// # Examples
///
/// ```
/// use fetchcache::classify::{Classifier, VolatilityClass};
/// use fetchcache::config::CacheConfig;
/// use fetchcache::http::Request;
///
/// let config = CacheConfig::from_json(r#"{"origin": "https://app.example"}"#).unwrap();
/// let classifier = Classifier::from_config(&config);
///
/// let logo = Request::get("https://app.example/img/logo.webp").unwrap();
/// assert_eq!(classifier.classify(&logo), VolatilityClass::ImmutableStatic);
///
/// let page = Request::get("https://app.example/about").unwrap();
/// assert_eq!(classifier.classify(&page), VolatilityClass::Dynamic);
///
/// let cdn = Request::get("https://cdn.other/img/logo.webp").unwrap();
/// assert_eq!(classifier.classify(&cdn), VolatilityClass::Ineligible);
/// ```
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    build_prefix: String,
    static_extensions: HashSet<String>,
    bundle_extensions: HashSet<String>,
    no_store_paths: HashSet<String>,
}

impl Classifier {
    /// Builds a classifier from the origin, build prefix and extension lists
    /// in `config`. Extensions are matched case-insensitively.
    pub fn from_config(config: &CacheConfig) -> Self {
        let lower = |exts: &[String]| -> HashSet<String> {
            exts.iter().map(|e| e.to_ascii_lowercase()).collect()
        };
        Self {
            origin: config.origin.origin(),
            build_prefix: config.build_prefix.clone(),
            static_extensions: lower(&config.static_extensions),
            bundle_extensions: lower(&config.bundle_extensions),
            no_store_paths: config.no_store_paths.iter().cloned().collect(),
        }
    }

    /// Classifies a request. Total and side-effect free.
    pub fn classify(&self, request: &Request) -> VolatilityClass {
        if request.method() != &Method::Get || !self.is_same_origin(request.url()) {
            return VolatilityClass::Ineligible;
        }

        let path = request.path();
        let extension = extension_of(path);
        let extension = extension.as_deref();

        if extension.is_some_and(|ext| self.static_extensions.contains(ext)) {
            return VolatilityClass::ImmutableStatic;
        }

        if path.starts_with(&self.build_prefix)
            || extension.is_some_and(|ext| self.bundle_extensions.contains(ext))
        {
            return VolatilityClass::StableBundle;
        }

        VolatilityClass::Dynamic
    }

    /// Returns `true` if responses for this request must never be stored,
    /// even though it may classify as cacheable.
    pub fn is_no_store(&self, request: &Request) -> bool {
        self.no_store_paths.contains(request.path())
    }

    /// Returns `true` if `url` shares the serving origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }
}

/// Lower-cased extension of the last path segment, if it has one.
fn extension_of(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        let config = CacheConfig {
            origin: Url::parse("https://app.example").unwrap(),
            ..CacheConfig::default()
        };
        Classifier::from_config(&config)
    }

    fn class_of(url: &str) -> VolatilityClass {
        classifier().classify(&Request::get(url).unwrap())
    }

    #[test]
    fn media_fonts_and_models_are_immutable() {
        for path in [
            "/img/hero.PNG",
            "/fonts/inter.woff2",
            "/models/ship.glb",
            "/favicon.ico",
            "/media/showreel.mp4",
        ] {
            let url = format!("https://app.example{path}");
            assert_eq!(class_of(&url), VolatilityClass::ImmutableStatic, "{path}");
        }
    }

    #[test]
    fn static_extension_wins_over_build_prefix() {
        assert_eq!(
            class_of("https://app.example/assets/logo.3f9a.svg"),
            VolatilityClass::ImmutableStatic
        );
    }

    #[test]
    fn bundles() {
        assert_eq!(
            class_of("https://app.example/assets/chunk-7ab1"),
            VolatilityClass::StableBundle
        );
        assert_eq!(
            class_of("https://app.example/vendor.css"),
            VolatilityClass::StableBundle
        );
        assert_eq!(
            class_of("https://app.example/app.mjs?v=3"),
            VolatilityClass::StableBundle
        );
    }

    #[test]
    fn everything_else_is_dynamic() {
        for url in [
            "https://app.example/",
            "https://app.example/en/about",
            "https://app.example/api/projects?page=2",
            "https://app.example/.well-known",
            "https://app.example/img.png/details",
        ] {
            assert_eq!(class_of(url), VolatilityClass::Dynamic, "{url}");
        }
    }

    #[test]
    fn non_get_is_ineligible() {
        let url = Url::parse("https://app.example/img/hero.png").unwrap();
        for method in [Method::Post, Method::Head, Method::Custom("PURGE".into())] {
            let req = Request::new(method, url.clone());
            assert_eq!(classifier().classify(&req), VolatilityClass::Ineligible);
        }
    }

    #[test]
    fn cross_origin_is_ineligible() {
        assert_eq!(
            class_of("https://cdn.other/img/hero.png"),
            VolatilityClass::Ineligible
        );
        assert_eq!(
            class_of("http://app.example/img/hero.png"),
            VolatilityClass::Ineligible
        );
        assert_eq!(
            class_of("https://app.example:8443/img/hero.png"),
            VolatilityClass::Ineligible
        );
    }

    #[test]
    fn no_store_paths_still_classify_as_static() {
        let c = classifier();
        let req = Request::get("https://app.example/media/showreel.mp4").unwrap();
        assert_eq!(c.classify(&req), VolatilityClass::ImmutableStatic);
        assert!(c.is_no_store(&req));
        assert!(!c.is_no_store(&Request::get("https://app.example/media/other.mp4").unwrap()));
    }

    #[test]
    fn extension_parsing() {
        assert_eq!(extension_of("/a/b.tar.GZ"), Some("gz".into()));
        assert_eq!(extension_of("/a.b/c"), None);
        assert_eq!(extension_of("/.env"), None);
        assert_eq!(extension_of("/trailing."), None);
    }
}
