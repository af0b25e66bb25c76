//! [`CacheStore`] persisted as one JSON file per named cache.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::{Cache, CacheEntry, CacheError, CacheStore};

const EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "json.tmp";

/// Directory-backed cache store that survives restarts.
///
/// File names are the URL-encoded cache names, so any cache name maps to a
/// single file inside the root directory.
#[derive(Debug)]
pub struct DiskCacheStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskCacheStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Temporary files left by an interrupted save are removed.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut swept = 0usize;
        let mut dir = fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&format!(".{TMP_EXTENSION}")));
            if is_tmp {
                fs::remove_file(&path).await?;
                swept += 1;
            }
        }

        debug!(root = %root.display(), swept, "Disk cache store ready");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CacheError> {
        if name.is_empty() {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        let file = format!("{}.{}", urlencoding::encode(name), EXTENSION);
        Ok(self.root.join(file))
    }

    async fn load(&self, name: &str) -> Result<Option<Cache>, CacheError> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves half a cache.
    async fn save(&self, cache: &Cache) -> Result<(), CacheError> {
        let path = self.path_for(&cache.name)?;
        let tmp = path.with_extension(TMP_EXTENSION);
        fs::write(&tmp, serde_json::to_vec(cache)?).await?;
        fs::rename(&tmp, &path).await?;
        trace!(cache = %cache.name, entries = cache.len(), "Cache saved");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        if self.load(name).await?.is_none() {
            self.save(&Cache::new(name)).await?;
            debug!(cache = %name, "Created cache");
        }
        Ok(())
    }

    async fn add_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut cache = self
            .load(name)
            .await?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        for entry in entries {
            cache.put(entry);
        }
        self.save(&cache).await
    }

    async fn match_in(&self, name: &str, url: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .load(name)
            .await?
            .and_then(|cache| cache.match_request(url).cloned()))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(name) = urlencoding::decode(stem) {
                names.push(name.into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(fs::try_exists(self.path_for(name)?).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn entry_urls(&self, name: &str) -> Result<Vec<String>, CacheError> {
        self.load(name)
            .await?
            .map(|cache| cache.keys())
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }
}
