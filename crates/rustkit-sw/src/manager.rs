//! Versioned cache manager.
//!
//! Owns the name of the authoritative cache and the worker origin; all other
//! components reach the cache storage through it.

use std::sync::Arc;

use futures::future::try_join_all;
use rustkit_net::{Fetcher, Origin, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheEntry;
use crate::clients::Clients;
use crate::storage::CacheStorage;
use crate::worker::ServiceWorkerId;
use crate::{Result, ServiceWorkerError};

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale caches that were deleted.
    pub deleted_caches: Vec<String>,
    /// Clients that were claimed.
    pub claimed_clients: Vec<String>,
}

/// Manages the single versioned cache of a worker.
pub struct CacheManager {
    version: String,
    origin: Origin,
    storage: Arc<dyn CacheStorage>,
}

impl CacheManager {
    /// Create a manager for cache `version`, storing only `origin` responses.
    pub fn new(version: impl Into<String>, origin: Origin, storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            version: version.into(),
            origin,
            storage,
        }
    }

    /// Name of the authoritative cache.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Worker origin.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Whether `response` to `request` may be stored.
    ///
    /// Both the request URL and the final response URL must be same-origin:
    /// a followed redirect can land anywhere.
    pub fn is_storable_origin(&self, request: &Request, response: &Response) -> bool {
        self.origin.contains(&request.url)
            && response
                .url
                .as_ref()
                .map_or(true, |url| self.origin.contains(url))
    }

    /// Open the cache and pre-populate it with `resources`.
    ///
    /// All resources are fetched concurrently. If any fetch fails or returns
    /// a non-ok status, nothing is written and the error is returned.
    pub async fn initialize(&self, resources: &[Url], fetcher: &dyn Fetcher) -> Result<usize> {
        self.storage.open(&self.version).await?;

        let fetches = resources.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = fetcher.fetch(request.clone()).await?;
            if !response.ok() {
                return Err(ServiceWorkerError::CacheError(format!(
                    "precache of {} returned status {}",
                    url, response.status
                )));
            }
            CacheEntry::from_response(&request, response)
        });

        let entries = try_join_all(fetches).await?;
        let count = entries.len();
        self.storage.put_all(&self.version, entries).await?;

        info!(cache = %self.version, resources = count, "Cache pre-populated");
        Ok(count)
    }

    /// Delete every cache but the current one and claim the clients in `scope`.
    ///
    /// Both run concurrently and both settle before this returns. A cleanup
    /// failure is logged and leaves the stale caches for the next activation;
    /// the claim is reported either way. Running it again with the same
    /// version deletes nothing.
    pub async fn activate(
        &self,
        clients: &RwLock<Clients>,
        worker: ServiceWorkerId,
        scope: &Url,
    ) -> ActivationReport {
        let claim = async {
            let claimed = clients.write().await.claim(worker, scope);
            debug!(claimed = claimed.len(), "Clients claimed");
            claimed
        };

        let (deleted, claimed) = tokio::join!(self.delete_stale(), claim);

        let deleted_caches = deleted.unwrap_or_else(|e| {
            warn!(cache = %self.version, error = %e, "Cache cleanup failed");
            Vec::new()
        });

        ActivationReport {
            deleted_caches,
            claimed_clients: claimed,
        }
    }

    async fn delete_stale(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| *name != self.version)
            .collect();

        let deletions = stale.iter().map(|name| async move {
            info!(cache = %name, "Removing old cache");
            self.storage.delete(name).await
        });
        try_join_all(deletions).await?;

        Ok(stale)
    }

    /// Look up a request in the current cache.
    ///
    /// A storage failure is logged and treated as a miss.
    pub async fn lookup(&self, request: &Request) -> Option<CacheEntry> {
        match self.storage.match_request(&self.version, request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Store a response for a request in the current cache.
    ///
    /// Cross-origin requests are skipped. Failures are logged and swallowed;
    /// the return value only reports whether an entry was written.
    pub async fn store(&self, request: &Request, response: Response) -> bool {
        if !self.is_storable_origin(request, &response) {
            debug!(url = %request.url, "Skipping cross-origin response");
            return false;
        }

        let result = match CacheEntry::from_response(request, response) {
            Ok(entry) => self.storage.put(&self.version, entry).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(url = %request.url, cache = %self.version, "Response cached");
                true
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache error");
                false
            }
        }
    }

    /// Number of entries in the current cache.
    pub async fn entry_count(&self) -> Result<usize> {
        self.storage.len(&self.version).await
    }
}
