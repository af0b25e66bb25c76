//! # FoodFest Offline Worker
//!
//! Offline support for the FoodFest site: a versioned cache pre-filled at
//! install, stale caches evicted at activation, and requests answered
//! cache-first with a network fallback.
//!
//! ## Features
//!
//! - **Cache identity**: `prefix + version` names one cache generation
//! - **Install**: all-or-nothing pre-caching of the asset manifest
//! - **Activate**: eviction of caches outside a replaceable retention policy
//! - **Fetch**: cache hit short-circuits the network; misses pass through
//! - **Lifecycle**: installing → installed → activating → activated → redundant
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     │
//!     └── ServiceWorkerRegistration
//!             ├── installing (ServiceWorker → OfflineWorker)
//!             ├── waiting
//!             └── active
//!
//! OfflineWorker
//!     ├── WorkerConfig (prefix, version, scope, manifest)
//!     ├── CacheStore (memory or disk)
//!     ├── Fetcher (network)
//!     └── RetentionPolicy
//! ```

use foodfest_common::OfflineError;
use foodfest_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod disk;
pub mod identity;
pub mod lifecycle;
pub mod policy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheError, CacheStore, MemoryCacheStore};
pub use config::{AssetManifest, ConfigError, WorkerConfig, APP_PREFIX, FOODFEST_MANIFEST, VERSION};
pub use disk::DiskCacheStore;
pub use identity::CacheIdentity;
pub use lifecycle::{
    InstallOutcome, RegistrationSnapshot, ServiceWorker, ServiceWorkerEvent, ServiceWorkerHost,
    ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState, WorkerInfo,
};
pub use policy::{ContainsPrefix, CurrentOnly, RetentionPolicy, SupersededVersions};
pub use worker::{ActivationReport, FetchEvent, FetchResponse, InstallReport, OfflineWorker};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Install superseded by a newer registration")]
    Superseded,

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    StateError(String),
}

impl From<ServiceWorkerError> for OfflineError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => OfflineError::network_with_source("fetch failed", e),
            ServiceWorkerError::Cache(e) => {
                OfflineError::cache_with_source("cache operation failed", e)
            }
            ServiceWorkerError::Config(e) => {
                OfflineError::config_with_source("invalid worker config", e)
            }
            other => OfflineError::lifecycle_with_source("worker lifecycle", other),
        }
    }
}
