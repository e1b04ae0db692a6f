//! Directory-backed cache storage.
//!
//! Each cache is one JSON file named after the percent-encoded cache name.
//! All caches are loaded when the storage is opened; every mutation rewrites
//! the affected file through a temporary file and a rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hashbrown::HashMap;
use rustkit_net::Request;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry};
use crate::storage::CacheStorage;
use crate::Result;

const CACHE_FILE_EXT: &str = "json";
const TMP_FILE_EXT: &str = "tmp";

/// Cache storage persisted under a directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    caches: RwLock<HashMap<String, Cache>>,
}

impl DiskCacheStorage {
    /// Open (and create if needed) the storage directory, loading every cache in it.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let mut caches = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(CACHE_FILE_EXT) => {}
                Some(TMP_FILE_EXT) => {
                    // Left behind by a write interrupted before its rename.
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Cannot remove stale temp file");
                    }
                    continue;
                }
                _ => continue,
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            match serde_json::from_slice::<Cache>(&bytes) {
                Ok(cache) => {
                    debug!(cache = %cache.name, entries = cache.len(), "Loaded cache");
                    caches.insert(cache.name.clone(), cache);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt cache file");
                }
            }
        }

        info!(root = %root.display(), caches = caches.len(), "Disk cache storage opened");

        Ok(Self {
            root,
            caches: RwLock::new(caches),
        })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", urlencoding::encode(name), CACHE_FILE_EXT))
    }

    async fn persist(&self, cache: &Cache) -> Result<()> {
        let path = self.path_for(&cache.name);
        let tmp = path.with_extension(TMP_FILE_EXT);
        let bytes = serde_json::to_vec(cache)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<()> {
        let mut caches = self.caches.write().await;
        if caches.contains_key(name) {
            return Ok(());
        }
        let cache = Cache::new(name);
        self.persist(&cache).await?;
        caches.insert(name.to_string(), cache);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut caches = self.caches.write().await;
        if caches.remove(name).is_none() {
            return Ok(false);
        }
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_request(request))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        self.put_all(name, vec![entry]).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut caches = self.caches.write().await;
        let mut updated = caches.get(name).cloned().unwrap_or_else(|| Cache::new(name));
        for entry in entries {
            updated.put(entry);
        }
        // Memory only changes once the file is written.
        self.persist(&updated).await?;
        caches.insert(name.to_string(), updated);
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<usize> {
        Ok(self.caches.read().await.get(name).map_or(0, Cache::len))
    }
}
