//! # RustKit Service Workers
//!
//! Offline-caching service worker for the RustKit browser engine.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch events driven by the host
//! - **Versioned cache**: one authoritative cache per version, stale
//!   generations purged on activation
//! - **Fetch interception**: network-first or cache-first, chosen by config
//! - **Clients API**: activation claims already-open pages
//! - **Storage**: in-memory or directory-backed cache storage
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker (install / activate / handle_fetch)
//!     │
//!     ├── FetchStrategy ── NetworkFirst | CacheFirst
//!     │
//!     ├── CacheManager (version, origin)
//!     │       └── CacheStorage (caches)
//!     │               └── Cache
//!     │                       └── Request → CacheEntry
//!     │
//!     ├── Fetcher (network, rustkit-net)
//!     └── Clients
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod disk;
pub mod manager;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheKey};
pub use clients::{Client, Clients};
pub use config::{WorkerConfig, DEFAULT_OFFLINE_TEXT};
pub use disk::DiskCacheStorage;
pub use manager::{ActivationReport, CacheManager};
pub use storage::{CacheStorage, MemoryCacheStorage};
pub use strategy::{
    CacheFirst, FetchContext, FetchResponse, FetchStrategy, NetworkFirst, ResponseSource,
    StrategyKind,
};
pub use worker::{OfflineWorker, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};

use rustkit_common::RustKitError;
use rustkit_net::NetError;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

impl From<ServiceWorkerError> for RustKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => RustKitError::network_with_source("fetch failed", e),
            ServiceWorkerError::Io(e) => RustKitError::Io(e),
            ServiceWorkerError::Serialization(e) => {
                RustKitError::storage_with_source("cache file is not valid JSON", e)
            }
            ServiceWorkerError::CacheError(msg) => RustKitError::storage(msg),
            ServiceWorkerError::Config(msg) => RustKitError::config(msg),
            other @ ServiceWorkerError::StateError(_) => {
                RustKitError::worker_with_source("invalid worker state", other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_categories() {
        let err: RustKitError = ServiceWorkerError::Config("empty cache_version".into()).into();
        assert_eq!(err.category(), "config");

        let err: RustKitError = ServiceWorkerError::CacheError("206".into()).into();
        assert_eq!(err.category(), "storage");

        let err: RustKitError = ServiceWorkerError::StateError("redundant".into()).into();
        assert_eq!(err.category(), "worker");

        let err: RustKitError =
            ServiceWorkerError::Network(NetError::RequestFailed("offline".into())).into();
        assert_eq!(err.category(), "network");
    }
}
