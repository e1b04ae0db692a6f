//! Fetch interception strategies.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rustkit_net::{Fetcher, Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheEntry;
use crate::config::WorkerConfig;
use crate::manager::CacheManager;
use crate::Result;

// ==================== Fetch Response ====================

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Live network response.
    Network,
    /// Stored cache entry.
    Cache,
    /// Locally constructed placeholder.
    Fallback,
}

/// Response handed back to the page for an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Wrap a live network response.
    pub fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            response: entry.to_response(),
            source: ResponseSource::Cache,
        }
    }

    /// Create the offline placeholder response.
    pub fn offline_placeholder(text: &str) -> Self {
        Self {
            response: Response::text_body(text).with_status_text(text),
            source: ResponseSource::Fallback,
        }
    }

    /// Whether from cache.
    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

// ==================== Background Tasks ====================

/// Fire-and-forget work started by fetch handlers (the `waitUntil` set).
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task on the current runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set does not grow with traffic.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Wait for every task spawned so far. Returns how many were awaited.
    pub async fn settle(&self) -> usize {
        let mut pending = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };

        let mut settled = 0;
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Background task panicked");
            }
            settled += 1;
        }
        settled
    }
}

// ==================== Strategy ====================

/// Capabilities shared by every fetch handler invocation.
#[derive(Clone)]
pub struct FetchContext {
    pub manager: Arc<CacheManager>,
    pub fetcher: Arc<dyn Fetcher>,
    pub tasks: Arc<BackgroundTasks>,
}

impl FetchContext {
    pub fn new(manager: Arc<CacheManager>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            manager,
            fetcher,
            tasks: Arc::new(BackgroundTasks::new()),
        }
    }

    /// Store a response without blocking the caller.
    pub fn store_in_background(&self, request: Request, response: Response) {
        let manager = Arc::clone(&self.manager);
        self.tasks.spawn(async move {
            manager.store(&request, response).await;
        });
    }
}

/// Which strategy a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Network, then cache, then placeholder.
    NetworkFirst,
    /// Cache, then network.
    #[default]
    CacheFirst,
}

impl StrategyKind {
    /// Build the strategy from a worker configuration.
    pub fn build(self, config: &WorkerConfig) -> Result<Box<dyn FetchStrategy>> {
        Ok(match self {
            StrategyKind::NetworkFirst => Box::new(NetworkFirst::new(config.offline_text.clone())),
            StrategyKind::CacheFirst => Box::new(CacheFirst::new(config.precache_urls()?)),
        })
    }
}

/// Per-request response policy, plus its install-time work.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Install hook. Failures are logged, never returned.
    async fn install(&self, ctx: &FetchContext);

    /// Decide the response for an intercepted request.
    async fn handle(&self, ctx: &FetchContext, request: Request) -> Result<FetchResponse>;
}

/// Network first, falling back to the cache, then to a placeholder.
///
/// Every response the network returns for a same-origin request is stored.
#[derive(Debug, Clone)]
pub struct NetworkFirst {
    offline_text: String,
}

impl NetworkFirst {
    pub fn new(offline_text: impl Into<String>) -> Self {
        Self {
            offline_text: offline_text.into(),
        }
    }
}

#[async_trait]
impl FetchStrategy for NetworkFirst {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NetworkFirst
    }

    async fn install(&self, _ctx: &FetchContext) {
        debug!("Network-first install: cache is populated lazily");
    }

    async fn handle(&self, ctx: &FetchContext, request: Request) -> Result<FetchResponse> {
        match ctx.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                ctx.store_in_background(request, response.clone());
                Ok(FetchResponse::network(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match ctx.manager.lookup(&request).await {
                    Some(entry) => {
                        info!(url = %request.url, "Serving from cache");
                        Ok(FetchResponse::from_cache(&entry))
                    }
                    None => {
                        info!(url = %request.url, "No cache for request");
                        Ok(FetchResponse::offline_placeholder(&self.offline_text))
                    }
                }
            }
        }
    }
}

/// Cache first, falling back to the network.
///
/// Only `basic` same-origin 200 responses are stored. Network failure on a
/// miss is returned to the caller.
#[derive(Debug, Clone, Default)]
pub struct CacheFirst {
    precache: Vec<Url>,
}

impl CacheFirst {
    pub fn new(precache: Vec<Url>) -> Self {
        Self { precache }
    }

    fn is_cacheable(ctx: &FetchContext, request: &Request, response: &Response) -> bool {
        response.status == 200
            && response.response_type == ResponseType::Basic
            && ctx.manager.is_storable_origin(request, response)
    }
}

#[async_trait]
impl FetchStrategy for CacheFirst {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CacheFirst
    }

    async fn install(&self, ctx: &FetchContext) {
        if let Err(e) = ctx
            .manager
            .initialize(&self.precache, ctx.fetcher.as_ref())
            .await
        {
            error!(cache = %ctx.manager.version(), error = %e, "Failed to pre-populate cache");
        }
    }

    async fn handle(&self, ctx: &FetchContext, request: Request) -> Result<FetchResponse> {
        if let Some(entry) = ctx.manager.lookup(&request).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(FetchResponse::from_cache(&entry));
        }

        let response = ctx.fetcher.fetch(request.clone()).await.map_err(|e| {
            warn!(url = %request.url, error = %e, "Cache miss and network failed");
            e
        })?;

        if Self::is_cacheable(ctx, &request, &response) {
            ctx.store_in_background(request, response.clone());
        } else {
            debug!(
                url = %request.url,
                status = response.status,
                response_type = ?response.response_type,
                "Response not cacheable"
            );
        }

        Ok(FetchResponse::network(response))
    }
}
