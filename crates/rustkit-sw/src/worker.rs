//! The offline worker: lifecycle state plus the install, activate and fetch handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustkit_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::manager::{ActivationReport, CacheManager};
use crate::storage::CacheStorage;
use crate::strategy::{FetchContext, FetchResponse, FetchStrategy, StrategyKind};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script being parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (terminated or replaced).
    Redundant,
}

/// Service worker events.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Stale caches were deleted during activation.
    CachesDeleted { names: Vec<String> },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

#[derive(Debug)]
struct Lifecycle {
    state: ServiceWorkerState,
    changed_at: Instant,
}

// ==================== Offline Worker ====================

/// An offline-caching service worker instance.
///
/// The host drives it: `install` once, `activate` once (it may be repeated
/// harmlessly), then `handle_fetch` for every intercepted request, possibly
/// concurrently.
pub struct OfflineWorker {
    id: ServiceWorkerId,
    scope: Url,
    lifecycle: RwLock<Lifecycle>,
    strategy: Box<dyn FetchStrategy>,
    ctx: FetchContext,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl OfflineWorker {
    /// Create a worker from a configuration and its two capabilities.
    pub fn new(
        config: &WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        config.validate()?;

        let strategy = config.strategy.build(config)?;
        let manager = Arc::new(CacheManager::new(
            config.cache_version.clone(),
            config.origin(),
            storage,
        ));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = Self {
            id: ServiceWorkerId::new(),
            scope: config.scope.clone(),
            lifecycle: RwLock::new(Lifecycle {
                state: ServiceWorkerState::Parsed,
                changed_at: Instant::now(),
            }),
            strategy,
            ctx: FetchContext::new(manager, fetcher),
            clients: Arc::new(RwLock::new(Clients::new())),
            event_tx,
        };

        info!(
            worker = ?worker.id,
            cache = %config.cache_version,
            strategy = ?config.strategy,
            scope = %config.scope,
            "Service worker created"
        );

        Ok((worker, event_rx))
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.ctx.manager
    }

    /// Clients known to this worker. Hosts register open pages here.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.read().await.state
    }

    /// Time of last state change.
    pub async fn state_changed_at(&self) -> Instant {
        self.lifecycle.read().await.changed_at
    }

    async fn set_state(&self, state: ServiceWorkerState) {
        {
            let mut lifecycle = self.lifecycle.write().await;
            lifecycle.state = state;
            lifecycle.changed_at = Instant::now();
        }
        debug!(worker = ?self.id, state = ?state, "State changed");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state: state,
        });
    }

    async fn expect_state(&self, allowed: &[ServiceWorkerState], action: &str) -> Result<()> {
        let state = self.state().await;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(ServiceWorkerError::StateError(format!(
                "cannot {action} a worker in state {state:?}"
            )))
        }
    }

    /// Handle the install event.
    ///
    /// Pre-population failures are logged by the strategy and do not fail
    /// installation. The worker skips the waiting phase.
    pub async fn install(&self) -> Result<()> {
        self.expect_state(&[ServiceWorkerState::Parsed], "install").await?;

        info!(worker = ?self.id, "Installing");
        self.set_state(ServiceWorkerState::Installing).await;
        self.strategy.install(&self.ctx).await;
        self.set_state(ServiceWorkerState::Installed).await;
        Ok(())
    }

    /// Handle the activate event: purge stale caches and claim clients.
    pub async fn activate(&self) -> Result<ActivationReport> {
        self.expect_state(
            &[ServiceWorkerState::Installed, ServiceWorkerState::Activated],
            "activate",
        )
        .await?;

        info!(worker = ?self.id, "Activating");
        self.set_state(ServiceWorkerState::Activating).await;

        // Claimed clients are reported even when cleanup fails.
        let report = self
            .ctx
            .manager
            .activate(&self.clients, self.id, &self.scope)
            .await;

        if !report.deleted_caches.is_empty() {
            let _ = self.event_tx.send(ServiceWorkerEvent::CachesDeleted {
                names: report.deleted_caches.clone(),
            });
        }
        for client_id in &report.claimed_clients {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.id,
            });
        }

        self.set_state(ServiceWorkerState::Activated).await;
        Ok(report)
    }

    /// Handle a fetch event.
    ///
    /// Navigations outside the scope are not the worker's to answer: they go
    /// straight to the network and a network failure is returned as-is, under
    /// either strategy.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse> {
        if self.state().await == ServiceWorkerState::Redundant {
            return Err(ServiceWorkerError::StateError(
                "redundant worker cannot handle fetches".to_string(),
            ));
        }

        if request.is_navigation() && !request.url.as_str().starts_with(self.scope.as_str()) {
            debug!(url = %request.url, "Navigation outside scope, not intercepted");
            let response = self.ctx.fetcher.fetch(request).await?;
            return Ok(FetchResponse::network(response));
        }

        self.strategy.handle(&self.ctx, request).await
    }

    /// Wait for background cache writes started by earlier fetches.
    pub async fn settle(&self) -> usize {
        self.ctx.tasks.settle().await
    }

    /// Mark the worker redundant. Pending cache writes are still awaited.
    pub async fn terminate(&self) {
        self.settle().await;
        self.set_state(ServiceWorkerState::Redundant).await;
        info!(worker = ?self.id, "Terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Client;
    use crate::storage::MemoryCacheStorage;
    use crate::strategy::ResponseSource;
    use async_trait::async_trait;
    use rustkit_net::{NetError, Response, ResponseType};

    struct EchoNetwork;

    #[async_trait]
    impl Fetcher for EchoNetwork {
        async fn fetch(&self, request: Request) -> std::result::Result<Response, NetError> {
            Ok(Response::new(200, request.url.path().to_string())
                .with_url(request.url)
                .with_type(ResponseType::Basic))
        }
    }

    fn config(strategy: StrategyKind) -> WorkerConfig {
        WorkerConfig::new("v1", Url::parse("https://example.com/app/").unwrap())
            .with_strategy(strategy)
            .with_precache(["./index.html"])
    }

    fn worker(strategy: StrategyKind) -> (OfflineWorker, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        OfflineWorker::new(
            &config(strategy),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(EchoNetwork),
        )
        .unwrap()
    }

    #[test]
    fn test_worker_id_uniqueness() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (worker, mut events) = worker(StrategyKind::CacheFirst);
        assert_eq!(worker.state().await, ServiceWorkerState::Parsed);

        worker.install().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Installed);

        worker.activate().await.unwrap();
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            [
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_before_install_fails() {
        let (worker, _events) = worker(StrategyKind::NetworkFirst);
        let err = worker.activate().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
    }

    #[tokio::test]
    async fn test_install_twice_fails() {
        let (worker, _events) = worker(StrategyKind::NetworkFirst);
        worker.install().await.unwrap();
        assert!(worker.install().await.is_err());
    }

    #[tokio::test]
    async fn test_activate_claims_open_pages() {
        let (worker, mut events) = worker(StrategyKind::NetworkFirst);
        let page = Client::window(Url::parse("https://example.com/app/timer").unwrap());
        let page_id = page.id.clone();
        worker.clients().write().await.add(page);

        worker.install().await.unwrap();
        let report = worker.activate().await.unwrap();
        assert_eq!(report.claimed_clients, vec![page_id.clone()]);

        let controller_changed = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(e, ServiceWorkerEvent::ControllerChange { ref client_id, .. } if *client_id == page_id)
        });
        assert!(controller_changed);
    }

    #[tokio::test]
    async fn test_cache_first_install_precaches() {
        let (worker, _events) = worker(StrategyKind::CacheFirst);
        worker.install().await.unwrap();
        assert_eq!(worker.manager().entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_network_first_install_is_lazy() {
        let (worker, _events) = worker(StrategyKind::NetworkFirst);
        worker.install().await.unwrap();
        assert_eq!(worker.manager().entry_count().await.unwrap(), 0);
        assert!(!worker.manager().storage().has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_scope_navigation_passes_through() {
        let (worker, _events) = worker(StrategyKind::CacheFirst);
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let nav = Request::navigate(Url::parse("https://example.com/blog/").unwrap());
        let result = worker.handle_fetch(nav).await.unwrap();
        assert_eq!(result.source, ResponseSource::Network);

        worker.settle().await;
        assert_eq!(worker.manager().entry_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_terminated_worker_rejects_fetches() {
        let (worker, _events) = worker(StrategyKind::NetworkFirst);
        worker.terminate().await;

        let err = worker
            .handle_fetch(Request::parse("https://example.com/app/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
    }

    /// Storage whose cache listing always fails.
    struct UnlistableStorage;

    #[async_trait]
    impl CacheStorage for UnlistableStorage {
        async fn open(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn has(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }

        async fn keys(&self) -> Result<Vec<String>> {
            Err(ServiceWorkerError::CacheError("listing failed".into()))
        }

        async fn delete(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }

        async fn match_request(
            &self,
            _name: &str,
            _request: &Request,
        ) -> Result<Option<crate::CacheEntry>> {
            Ok(None)
        }

        async fn put(&self, _name: &str, _entry: crate::CacheEntry) -> Result<()> {
            Ok(())
        }

        async fn len(&self, _name: &str) -> Result<usize> {
            Ok(0)
        }
    }

    struct DownNetwork;

    #[async_trait]
    impl Fetcher for DownNetwork {
        async fn fetch(&self, _request: Request) -> std::result::Result<Response, NetError> {
            Err(NetError::RequestFailed("network unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_activate_reports_claims_when_cleanup_fails() {
        let (worker, mut events) = OfflineWorker::new(
            &config(StrategyKind::NetworkFirst),
            Arc::new(UnlistableStorage),
            Arc::new(EchoNetwork),
        )
        .unwrap();
        let page = Client::window(Url::parse("https://example.com/app/timer").unwrap());
        let page_id = page.id.clone();
        worker.clients().write().await.add(page);

        worker.install().await.unwrap();
        let report = worker.activate().await.unwrap();

        assert!(report.deleted_caches.is_empty());
        assert_eq!(report.claimed_clients, vec![page_id.clone()]);
        assert_eq!(worker.state().await, ServiceWorkerState::Activated);
        assert_eq!(
            worker.clients().read().await.get(&page_id).unwrap().controller,
            Some(worker.id())
        );

        let changed: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                ServiceWorkerEvent::ControllerChange { client_id, .. } => Some(client_id),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![page_id]);
    }

    #[tokio::test]
    async fn test_out_of_scope_navigation_failure_is_returned() {
        let (worker, _events) = OfflineWorker::new(
            &config(StrategyKind::NetworkFirst),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(DownNetwork),
        )
        .unwrap();
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let outside = Request::navigate(Url::parse("https://example.com/blog/").unwrap());
        let err = worker.handle_fetch(outside).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Network(_)));

        // Inside the scope the same failure is masked by the placeholder.
        let inside = Request::navigate(Url::parse("https://example.com/app/").unwrap());
        let result = worker.handle_fetch(inside).await.unwrap();
        assert_eq!(result.source, ResponseSource::Fallback);
    }
}
