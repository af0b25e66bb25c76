//! Named cache stores.
//!
//! ```text
//! CacheStore (caches)
//!     └── Cache (one per namespace)
//!             └── request URL → CacheEntry
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use foodfest_net::Response;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use url::Url;

/// Errors raised by a cache store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache not found: {0}")]
    NotFound(String),

    #[error("invalid cache name: {0:?}")]
    InvalidName(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Lookup key for a request URL. Fragments never reach the server, so
/// `page.html#day2` and `page.html` share one entry.
pub fn cache_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.into()
}

/// A captured response, keyed by its request URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a network response under the URL it was requested with.
    pub fn from_response(url: &Url, response: &Response) -> Self {
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
            url: cache_key(url),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// One named store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request URL.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Add entry.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// All keys (URLs), sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persistent keyed collection of named caches.
///
/// The worker only opens, populates, queries and deletes stores by name; it
/// never holds a cache across lifecycle events.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Store every entry in an opened cache, or none of them.
    async fn add_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError>;

    /// Look up a URL in one cache.
    async fn match_in(&self, name: &str, url: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Look up a URL across every cache, trying `preferred` first.
    ///
    /// Errors from the preferred cache or from listing caches propagate. A
    /// cache among the others that cannot be read is skipped.
    async fn match_any(
        &self,
        url: &str,
        preferred: Option<&str>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(name) = preferred {
            if self.has(name).await? {
                if let Some(entry) = self.match_in(name, url).await? {
                    return Ok(Some(entry));
                }
            }
        }
        for name in self.keys().await? {
            if Some(name.as_str()) == preferred {
                continue;
            }
            match self.match_in(&name, url).await {
                Ok(Some(entry)) => return Ok(Some(entry)),
                Ok(None) => {}
                Err(e) => warn!(cache = %name, error = %e, "skipping unreadable cache"),
            }
        }
        Ok(None)
    }

    /// Names of all caches, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Whether a cache exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.keys().await?.iter().any(|k| k == name))
    }

    /// Delete a cache. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// URLs stored in one cache, sorted.
    async fn entry_urls(&self, name: &str) -> Result<Vec<String>, CacheError>;
}

/// In-process [`CacheStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStore {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        debug!(cache = %name, "Opened cache");
        Ok(())
    }

    async fn add_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .get_mut(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        trace!(cache = %name, count = entries.len(), "Storing entries");
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn match_in(&self, name: &str, url: &str) -> Result<Option<CacheEntry>, CacheError> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_request(url))
            .cloned())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn entry_urls(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().await;
        caches
            .get(name)
            .map(Cache::keys)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: HashMap::new(),
            body: body.to_vec(),
            cached_at: 0,
        }
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("FoodFest-version_01");
        cache.put(entry("https://foodfest.test/style.css", b"body {}"));

        assert!(cache.match_request("https://foodfest.test/style.css").is_some());
        assert!(cache.match_request("https://foodfest.test/other.css").is_none());
        assert!(cache.delete("https://foodfest.test/style.css"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_drops_fragment() {
        let url = Url::parse("https://foodfest.test/schedule.html?day=2#evening").unwrap();
        assert_eq!(cache_key(&url), "https://foodfest.test/schedule.html?day=2");
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let json = serde_json::to_value(entry("https://foodfest.test/a.js", b"hi")).unwrap();
        assert_eq!(json["body"], "aGk=");
        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, b"hi");
    }

    #[tokio::test]
    async fn test_memory_store_open_and_keys() {
        let store = MemoryCacheStore::new();
        assert!(!store.has("v1").await.unwrap());

        store.open("v2").await.unwrap();
        store.open("v1").await.unwrap();
        store.open("v1").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["v1", "v2"]);
        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_all_requires_open_cache() {
        let store = MemoryCacheStore::new();
        let result = store
            .add_all("v1", vec![entry("https://foodfest.test/", b"")])
            .await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_match_any_prefers_named_cache() {
        let store = MemoryCacheStore::new();
        let url = "https://foodfest.test/index.html";
        for (name, body) in [("A-old", b"old".as_slice()), ("B-new", b"new".as_slice())] {
            store.open(name).await.unwrap();
            store.add_all(name, vec![entry(url, body)]).await.unwrap();
        }

        let hit = store.match_any(url, Some("B-new")).await.unwrap().unwrap();
        assert_eq!(hit.body, b"new");

        let hit = store.match_any(url, None).await.unwrap().unwrap();
        assert_eq!(hit.body, b"old");

        assert!(store
            .match_any("https://foodfest.test/missing.png", Some("B-new"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_match_any_falls_back_to_other_caches() {
        let store = MemoryCacheStore::new();
        let url = "https://foodfest.test/events.html";
        store.open("FoodFest-version_01").await.unwrap();
        store
            .add_all("FoodFest-version_01", vec![entry(url, b"events")])
            .await
            .unwrap();

        let hit = store
            .match_any(url, Some("FoodFest-version_02"))
            .await
            .unwrap();
        assert_eq!(hit.map(|e| e.body), Some(b"events".to_vec()));
    }
}
