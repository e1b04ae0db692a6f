//! Worker configuration.

use std::path::Path;

use rustkit_net::{LoaderConfig, Origin};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::strategy::StrategyKind;
use crate::{Result, ServiceWorkerError};

/// Body and status text of the placeholder served when offline and uncached.
pub const DEFAULT_OFFLINE_TEXT: &str = "Offline and not cached";

/// Offline worker configuration.
///
/// ```json
/// {
///   "cache_version": "luckydraw-timer-cache-v2",
///   "scope": "https://example.com/timer/",
///   "strategy": "cache-first",
///   "precache": ["./", "./index.html", "./manifest.json", "./icons/icon-192.png"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the authoritative cache. Every other cache is purged on activation.
    pub cache_version: String,

    /// Worker scope; its origin is the origin whose responses may be stored.
    pub scope: Url,

    /// Fetch strategy.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Resources stored at install time (cache-first only). Relative entries
    /// resolve against `scope`.
    #[serde(default)]
    pub precache: Vec<String>,

    /// Placeholder text for network-first misses.
    #[serde(default = "default_offline_text")]
    pub offline_text: String,

    /// Network client settings.
    #[serde(default)]
    pub loader: LoaderConfig,
}

fn default_offline_text() -> String {
    DEFAULT_OFFLINE_TEXT.to_string()
}

impl WorkerConfig {
    /// Create a configuration with defaults for everything but version and scope.
    pub fn new(cache_version: impl Into<String>, scope: Url) -> Self {
        Self {
            cache_version: cache_version.into(),
            scope,
            strategy: StrategyKind::default(),
            precache: Vec::new(),
            offline_text: default_offline_text(),
            loader: LoaderConfig::default(),
        }
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the pre-cache list.
    pub fn with_precache<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_version must not be empty".to_string(),
            ));
        }

        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::Config(format!(
                "scope must be an http(s) URL, got '{}'",
                self.scope
            )));
        }

        self.precache_urls().map(|_| ())
    }

    /// Origin of the worker.
    pub fn origin(&self) -> Origin {
        Origin::from_url(&self.scope)
    }

    /// Resolve the pre-cache list against the scope.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.precache
            .iter()
            .map(|resource| {
                self.scope.join(resource).map_err(|e| {
                    ServiceWorkerError::Config(format!("invalid precache entry '{resource}': {e}"))
                })
            })
            .collect()
    }
}
