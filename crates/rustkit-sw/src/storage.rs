//! Cache storage capability (`caches` global).

use async_trait::async_trait;
use hashbrown::HashMap;
use rustkit_net::Request;
use tokio::sync::RwLock;

use crate::cache::{Cache, CacheEntry};
use crate::Result;

/// Persistent key/value capability the cache manager consumes.
///
/// Implementations are shared between concurrent fetch handlers; a write to
/// an existing key replaces the previous entry.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Names of all caches, sorted.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Look up a request in one cache. A missing cache is a miss.
    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>>;

    /// Store an entry, creating the cache if needed.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()>;

    /// Store a batch of entries as one write.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        for entry in entries {
            self.put(name, entry).await?;
        }
        Ok(())
    }

    /// Number of entries in a cache (0 if absent).
    async fn len(&self, name: &str) -> Result<usize>;
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
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
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_request(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>> {
        let caches = self.caches.read().await;
        Ok(caches
            .get(name)
            .and_then(|cache| cache.match_request(request))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<usize> {
        Ok(self.caches.read().await.get(name).map_or(0, Cache::len))
    }
}
