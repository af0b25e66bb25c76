//! Install, activate and fetch handlers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use foodfest_net::{Fetcher, Request, Response};
use futures::future::{join_all, try_join_all};
use hashbrown::HashMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{cache_key, CacheEntry, CacheStore};
use crate::config::WorkerConfig;
use crate::identity::CacheIdentity;
use crate::policy::{ContainsPrefix, RetentionPolicy};
use crate::ServiceWorkerError;

// ==================== Fetch Event ====================

/// An intercepted request from a controlled page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The outgoing request. Only its URL is used for cache lookup.
    pub request: Request,

    /// Client ID.
    pub client_id: Option<String>,

    /// Is navigation request.
    pub is_navigation: bool,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            is_navigation: false,
        }
    }

    /// A top-level page load.
    pub fn navigation(request: Request) -> Self {
        Self {
            is_navigation: true,
            ..Self::new(request)
        }
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }
}

/// Response handed back to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Whether from cache.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            from_cache: true,
        }
    }

    /// Wrap a network response unchanged.
    pub fn from_network(response: Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            status: response.status.as_u16(),
            headers,
            body: response.bytes(),
            from_cache: false,
        }
    }
}

// ==================== Reports ====================

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Namespace that was populated.
    pub cache: String,

    /// Number of manifest URLs stored.
    pub cached: usize,
}

/// Outcome of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Caches kept, sorted.
    pub retained: Vec<String>,

    /// Caches deleted (or already gone), sorted.
    pub deleted: Vec<String>,

    /// Caches whose deletion failed, with the error.
    pub failed: Vec<(String, String)>,
}

// ==================== Offline Worker ====================

struct WorkerInner {
    config: WorkerConfig,
    identity: CacheIdentity,
    manifest_urls: Vec<Url>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    policy: Arc<dyn RetentionPolicy>,
}

/// One worker version: its configuration plus the collaborators it drives.
///
/// Cloning is cheap; every event task gets its own handle.
#[derive(Clone)]
pub struct OfflineWorker {
    inner: Arc<WorkerInner>,
}

impl fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("cache", &self.inner.identity.name())
            .field("scope", &self.inner.config.scope.as_str())
            .field("manifest", &self.inner.manifest_urls.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl OfflineWorker {
    /// Build a worker with the default [`ContainsPrefix`] retention policy.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Self::with_policy(config, store, network, Arc::new(ContainsPrefix))
    }

    pub fn with_policy(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
        policy: Arc<dyn RetentionPolicy>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let manifest_urls = config.manifest.resolve(&config.scope)?;
        let identity = config.identity();

        Ok(Self {
            inner: Arc::new(WorkerInner {
                config,
                identity,
                manifest_urls,
                store,
                network,
                policy,
            }),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &CacheIdentity {
        &self.inner.identity
    }

    /// Manifest URLs resolved against the scope.
    pub fn manifest_urls(&self) -> &[Url] {
        &self.inner.manifest_urls
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// Pre-cache the whole manifest into the current namespace.
    ///
    /// Every URL must come back with a 2xx status. The first failure aborts
    /// the remaining fetches and nothing is written.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let cache = self.inner.identity.name();
        self.inner.store.open(cache).await?;
        info!(cache = %cache, "installing cache");

        let fetches = self.inner.manifest_urls.iter().map(|url| {
            let network = Arc::clone(&self.inner.network);
            async move {
                let response = network
                    .fetch(Request::get(url.clone()))
                    .await
                    .map_err(|e| ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                if !response.ok() {
                    return Err(ServiceWorkerError::InstallFailed {
                        url: url.to_string(),
                        reason: format!("HTTP {}", response.status),
                    });
                }
                Ok::<_, ServiceWorkerError>(CacheEntry::from_response(url, &response))
            }
        });

        let entries = match try_join_all(fetches).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache = %cache, error = %e, "install failed");
                return Err(e);
            }
        };

        let cached = entries.len();
        self.inner.store.add_all(cache, entries).await?;
        debug!(cache = %cache, cached, "install complete");

        Ok(InstallReport {
            cache: cache.to_string(),
            cached,
        })
    }

    /// Delete every cache outside the retain-set.
    ///
    /// Deletions run independently; a failed one is logged and reported
    /// without stopping the others.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let identity = &self.inner.identity;
        let names = self.inner.store.keys().await?;

        let (mut retained, obsolete): (Vec<String>, Vec<String>) =
            names.into_iter().partition(|name| {
                identity.is_current(name) || self.inner.policy.retain(name, identity)
            });
        retained.sort();

        let deletions = obsolete.into_iter().map(|name| {
            let store = Arc::clone(&self.inner.store);
            async move {
                info!(cache = %name, "deleting cache");
                let result = store.delete(&name).await;
                (name, result)
            }
        });

        let mut report = ActivationReport {
            retained,
            ..Default::default()
        };
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    warn!(cache = %name, error = %e, "failed to delete cache");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report.deleted.sort();

        Ok(report)
    }

    /// Answer from cache if the URL is stored anywhere, else go to the
    /// network exactly once. Network responses are never cached.
    pub async fn handle_fetch(
        &self,
        event: FetchEvent,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let url = event.request.url.clone();
        info!(url = %url, navigation = event.is_navigation, "fetch request");

        let hit = self
            .inner
            .store
            .match_any(&cache_key(&url), Some(self.inner.identity.name()))
            .await?;

        if let Some(entry) = hit {
            info!(url = %url, "responding with cache");
            return Ok(FetchResponse::from_cache(&entry));
        }

        info!(url = %url, "file is not cached, fetching");
        let response = self.inner.network.fetch(event.request).await?;
        Ok(FetchResponse::from_network(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCacheStore};
    use crate::disk::DiskCacheStore;
    use crate::policy::CurrentOnly;
    use async_trait::async_trait;
    use foodfest_net::MockFetcher;
    use http::StatusCode;
    use std::io::{self, Write};
    use std::sync::Mutex;

    fn scope() -> Url {
        Url::parse("https://foodfest.test/").unwrap()
    }

    fn config(version: &str, manifest: &[&str]) -> WorkerConfig {
        WorkerConfig::new(
            "FoodFest-",
            version,
            scope(),
            crate::AssetManifest::new(manifest.iter().copied()),
        )
    }

    fn url(path: &str) -> Url {
        scope().join(path).unwrap()
    }

    /// Shared sink for formatted log lines.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    /// Install a thread-local INFO subscriber writing into a buffer.
    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    /// Memory store whose deletes fail for chosen names.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryCacheStore,
        fail_delete: Vec<String>,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn open(&self, name: &str) -> Result<(), CacheError> {
            self.inner.open(name).await
        }
        async fn add_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
            self.inner.add_all(name, entries).await
        }
        async fn match_in(&self, name: &str, url: &str) -> Result<Option<CacheEntry>, CacheError> {
            self.inner.match_in(name, url).await
        }
        async fn keys(&self) -> Result<Vec<String>, CacheError> {
            self.inner.keys().await
        }
        async fn delete(&self, name: &str) -> Result<bool, CacheError> {
            if self.fail_delete.iter().any(|n| n == name) {
                return Err(CacheError::Io(std::io::Error::other("disk busy")));
            }
            self.inner.delete(name).await
        }
        async fn entry_urls(&self, name: &str) -> Result<Vec<String>, CacheError> {
            self.inner.entry_urls(name).await
        }
    }

    #[tokio::test]
    async fn test_install_caches_every_manifest_entry() {
        let manifest = ["./index.html", "./assets/css/style.css", "./dist/app.bundle.js"];
        let mut network = MockFetcher::new();
        for path in manifest {
            network = network.with_ok(&url(path), path.as_bytes().to_vec());
        }
        let network = Arc::new(network);
        let store = Arc::new(MemoryCacheStore::new());
        let worker =
            OfflineWorker::new(config("version_01", &manifest), store.clone(), network.clone())
                .unwrap();

        let report = worker.install().await.unwrap();

        assert_eq!(report.cache, "FoodFest-version_01");
        assert_eq!(report.cached, 3);
        assert_eq!(network.call_count(), 3);
        let mut expected: Vec<String> = manifest.iter().map(|p| url(p).to_string()).collect();
        expected.sort();
        assert_eq!(store.entry_urls("FoodFest-version_01").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_install_fails_on_one_not_found() {
        let network = Arc::new(
            MockFetcher::new()
                .with_ok(&url("./index.html"), "index")
                .with_response(&url("./events.html"), StatusCode::NOT_FOUND, "")
                .with_ok(&url("./tickets.html"), "tickets"),
        );
        let store = Arc::new(MemoryCacheStore::new());
        let worker = OfflineWorker::new(
            config("version_01", &["./index.html", "./events.html", "./tickets.html"]),
            store.clone(),
            network,
        )
        .unwrap();

        let err = worker.install().await.unwrap_err();

        match err {
            ServiceWorkerError::InstallFailed { url: failed, reason } => {
                assert_eq!(failed, url("./events.html").to_string());
                assert!(reason.contains("404"));
            }
            other => panic!("expected install failure, got {other:?}"),
        }
        assert!(store
            .entry_urls("FoodFest-version_01")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_install_fails_on_transport_error() {
        let network = Arc::new(
            MockFetcher::new()
                .with_ok(&url("./index.html"), "index")
                .with_failure(&url("./dist/app.bundle.js"), "connection reset"),
        );
        let worker = OfflineWorker::new(
            config("version_01", &["./index.html", "./dist/app.bundle.js"]),
            Arc::new(MemoryCacheStore::new()),
            network,
        )
        .unwrap();

        assert!(matches!(
            worker.install().await,
            Err(ServiceWorkerError::InstallFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_activate_keeps_prefix_family() {
        let store = Arc::new(MemoryCacheStore::new());
        for name in ["FoodFest-version_01", "FoodFest-version_02", "OtherApp-v1"] {
            store.open(name).await.unwrap();
        }
        let worker = OfflineWorker::new(
            config("version_02", &[]),
            store.clone(),
            Arc::new(MockFetcher::new()),
        )
        .unwrap();

        let report = worker.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["OtherApp-v1"]);
        assert_eq!(report.retained, vec!["FoodFest-version_01", "FoodFest-version_02"]);
        assert!(report.failed.is_empty());
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["FoodFest-version_01", "FoodFest-version_02"]
        );
    }

    #[tokio::test]
    async fn test_activate_with_replacement_policy() {
        let store = Arc::new(MemoryCacheStore::new());
        for name in ["FoodFest-version_01", "FoodFest-version_02", "OtherApp-v1"] {
            store.open(name).await.unwrap();
        }
        let worker = OfflineWorker::with_policy(
            config("version_02", &[]),
            store.clone(),
            Arc::new(MockFetcher::new()),
            Arc::new(CurrentOnly),
        )
        .unwrap();

        let report = worker.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["FoodFest-version_01", "OtherApp-v1"]);
        assert_eq!(store.keys().await.unwrap(), vec!["FoodFest-version_02"]);
    }

    #[tokio::test]
    async fn test_activate_isolates_failed_deletion() {
        let store = Arc::new(FlakyStore {
            fail_delete: vec!["Broken-v1".to_string()],
            ..Default::default()
        });
        for name in ["Broken-v1", "OtherApp-v1", "ThirdApp-v9", "FoodFest-version_01"] {
            store.open(name).await.unwrap();
        }
        let worker = OfflineWorker::new(
            config("version_01", &[]),
            store.clone(),
            Arc::new(MockFetcher::new()),
        )
        .unwrap();

        let report = worker.activate().await.unwrap();

        assert_eq!(report.deleted, vec!["OtherApp-v1", "ThirdApp-v9"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Broken-v1");
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["Broken-v1", "FoodFest-version_01"]
        );
    }

    #[tokio::test]
    async fn test_activate_with_nothing_to_delete() {
        let store = Arc::new(MemoryCacheStore::new());
        let worker = OfflineWorker::new(
            config("version_01", &[]),
            store,
            Arc::new(MockFetcher::new()),
        )
        .unwrap();

        let report = worker.activate().await.unwrap();
        assert_eq!(report, ActivationReport::default());
    }

    #[tokio::test]
    async fn test_fetch_hit_skips_network() {
        let index = url("./index.html");
        let store = Arc::new(MemoryCacheStore::new());
        store.open("FoodFest-version_01").await.unwrap();
        let stored = CacheEntry {
            url: index.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/html".to_string())]),
            body: b"<h1>cached</h1>".to_vec(),
            cached_at: 0,
        };
        store
            .add_all("FoodFest-version_01", vec![stored.clone()])
            .await
            .unwrap();
        let network = Arc::new(MockFetcher::new().with_ok(&index, "<h1>live</h1>"));
        let worker = OfflineWorker::new(config("version_01", &[]), store, network.clone()).unwrap();

        let response = worker
            .handle_fetch(FetchEvent::navigation(Request::get(index)))
            .await
            .unwrap();

        assert_eq!(response, FetchResponse::from_cache(&stored));
        assert!(response.from_cache);
        assert_eq!(network.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_miss_passes_network_result_through() {
        let missing = url("./missing.png");
        let network = Arc::new(MockFetcher::new().with_response(
            &missing,
            StatusCode::NOT_FOUND,
            "not here",
        ));
        let store = Arc::new(MemoryCacheStore::new());
        let worker =
            OfflineWorker::new(config("version_01", &[]), store.clone(), network.clone())
                .unwrap();

        let response = worker
            .handle_fetch(FetchEvent::new(Request::get(missing.clone())))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.body, Bytes::from_static(b"not here"));
        assert!(!response.from_cache);
        assert_eq!(network.calls(), vec![missing.clone()]);

        // Not filled on the way through.
        assert!(store.match_any(missing.as_str(), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_miss_propagates_network_failure() {
        let offline = url("./schedule.html");
        let network = Arc::new(MockFetcher::new().with_failure(&offline, "offline"));
        let worker = OfflineWorker::new(
            config("version_01", &[]),
            Arc::new(MemoryCacheStore::new()),
            network.clone(),
        )
        .unwrap();

        let err = worker
            .handle_fetch(FetchEvent::new(Request::get(offline)))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceWorkerError::Network(_)));
        assert_eq!(network.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fragment_does_not_defeat_cache() {
        let schedule = url("./schedule.html");
        let network = Arc::new(MockFetcher::new().with_ok(&schedule, "<h1>schedule</h1>"));
        let worker = OfflineWorker::new(
            config("version_01", &["./schedule.html"]),
            Arc::new(MemoryCacheStore::new()),
            network.clone(),
        )
        .unwrap();
        worker.install().await.unwrap();

        let response = worker
            .handle_fetch(FetchEvent::navigation(Request::get(url(
                "./schedule.html#day2",
            ))))
            .await
            .unwrap();

        assert!(response.from_cache);
        assert_eq!(response.body, Bytes::from_static(b"<h1>schedule</h1>"));
        assert_eq!(network.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_miss_survives_unreadable_foreign_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskCacheStore::open_dir(dir.path()).await.unwrap());
        std::fs::write(dir.path().join("OtherApp-v1.json"), br#"{"not":"a cache"}"#).unwrap();
        let missing = url("./missing.png");
        let network = Arc::new(MockFetcher::new().with_response(
            &missing,
            StatusCode::NOT_FOUND,
            "",
        ));
        let worker =
            OfflineWorker::new(config("version_01", &[]), store, network.clone()).unwrap();

        let response = worker
            .handle_fetch(FetchEvent::new(Request::get(missing)))
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.from_cache);
        assert_eq!(network.call_count(), 1);
    }

    #[tokio::test]
    async fn test_handlers_log_at_info() {
        let (logs, _guard) = capture_logs();
        let index = url("./index.html");
        let missing = url("./missing.png");
        let network = Arc::new(
            MockFetcher::new()
                .with_ok(&index, "index")
                .with_response(&missing, StatusCode::NOT_FOUND, ""),
        );
        let store = Arc::new(MemoryCacheStore::new());
        store.open("OtherApp-v1").await.unwrap();
        let worker =
            OfflineWorker::new(config("version_01", &["./index.html"]), store, network).unwrap();

        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        worker
            .handle_fetch(FetchEvent::new(Request::get(index)))
            .await
            .unwrap();
        worker
            .handle_fetch(FetchEvent::new(Request::get(missing)))
            .await
            .unwrap();

        let output = logs.contents();
        for line in [
            "installing cache",
            "deleting cache",
            "fetch request",
            "responding with cache",
            "file is not cached, fetching",
        ] {
            assert!(output.contains(line), "missing {line:?} in:\n{output}");
        }
        assert!(output.contains("FoodFest-version_01"));
        assert!(output.contains("OtherApp-v1"));
    }
}
