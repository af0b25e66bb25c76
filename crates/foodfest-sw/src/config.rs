//! Worker configuration and the asset manifest.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::identity::CacheIdentity;

/// Application prefix of the FoodFest deployment.
pub const APP_PREFIX: &str = "FoodFest-";

/// Version token of the FoodFest deployment.
pub const VERSION: &str = "version_01";

/// Pages, stylesheets and bundles the FoodFest site needs to work offline.
///
/// Images are left out to stay well under browser cache quotas.
pub const FOODFEST_MANIFEST: &[&str] = &[
    "./index.html",
    "./events.html",
    "./tickets.html",
    "./schedule.html",
    "./assets/css/style.css",
    "./assets/css/bootstrap.css",
    "./assets/css/tickets.css",
    "./dist/app.bundle.js",
    "./dist/events.bundle.js",
    "./dist/tickets.bundle.js",
    "./dist/schedule.bundle.js",
];

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot resolve manifest path {path:?}: {source}")]
    Resolve {
        path: String,
        #[source]
        source: url::ParseError,
    },
}

/// Ordered, immutable list of relative asset paths pre-cached at install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    /// The FoodFest site's manifest.
    pub fn foodfest() -> Self {
        Self::new(FOODFEST_MANIFEST.iter().copied())
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve every path against `scope`, keeping manifest order.
    ///
    /// Paths that resolve to the same URL are kept once, at their first
    /// position.
    pub fn resolve(&self, scope: &Url) -> Result<Vec<Url>, ConfigError> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.0.len());
        for path in &self.0 {
            let url = scope.join(path).map_err(|source| ConfigError::Resolve {
                path: path.clone(),
                source,
            })?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}

/// Everything a worker instance needs at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Constant application prefix shared by every version's cache.
    pub app_prefix: String,

    /// Version token; bump it to roll out a new cache generation.
    pub version: String,

    /// Base URL that manifest paths and relative requests resolve against.
    pub scope: Url,

    /// Assets pre-cached at install.
    pub manifest: AssetManifest,
}

impl WorkerConfig {
    pub fn new(
        app_prefix: impl Into<String>,
        version: impl Into<String>,
        scope: Url,
        manifest: AssetManifest,
    ) -> Self {
        Self {
            app_prefix: app_prefix.into(),
            version: version.into(),
            scope,
            manifest,
        }
    }

    /// The FoodFest deployment served from `scope`.
    pub fn foodfest(scope: Url) -> Self {
        Self::new(APP_PREFIX, VERSION, scope, AssetManifest::foodfest())
    }

    /// Parse a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the invariants the handlers rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_prefix.is_empty() {
            return Err(ConfigError::Invalid("app_prefix must not be empty".into()));
        }
        if self.version.is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".into()));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "scope {} cannot be used as a base URL",
                self.scope
            )));
        }
        self.manifest.resolve(&self.scope)?;
        Ok(())
    }

    pub fn identity(&self) -> CacheIdentity {
        CacheIdentity::new(&self.app_prefix, &self.version)
    }

    /// Resolve a request path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.scope.join(path).map_err(|source| ConfigError::Resolve {
            path: path.to_string(),
            source,
        })
    }
}
