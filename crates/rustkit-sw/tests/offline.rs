//! End-to-end scenarios for the offline worker

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustkit_net::{
    Fetcher, LoaderConfig, NetError, Request, ResourceLoader, Response, ResponseType,
};
use rustkit_sw::{
    CacheStorage, DiskCacheStorage, MemoryCacheStorage, OfflineWorker, ResponseSource,
    ServiceWorkerError, StrategyKind, WorkerConfig,
};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rustkit_sw=debug")
        .with_test_writer()
        .try_init();
}

/// A site served from memory. Counts every request it sees.
struct Site {
    online: AtomicBool,
    calls: AtomicUsize,
}

impl Site {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        })
    }

    fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for Site {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("offline".into()));
        }

        let response_type = if request.url.host_str() == Some("timer.example.com") {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };
        Ok(Response::new(200, format!("content of {}", request.url.path()))
            .with_url(request.url.clone())
            .with_type(response_type))
    }
}

fn config(version: &str, strategy: StrategyKind) -> WorkerConfig {
    WorkerConfig::new(version, Url::parse("https://timer.example.com/").unwrap())
        .with_strategy(strategy)
        .with_precache(["./", "./index.html", "./manifest.json"])
}

fn get(url: &str) -> Request {
    Request::parse(url).unwrap()
}

async fn started(
    config: &WorkerConfig,
    storage: Arc<dyn CacheStorage>,
    site: Arc<Site>,
) -> OfflineWorker {
    let (worker, _events) = OfflineWorker::new(config, storage, site).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}

#[tokio::test]
async fn test_precached_page_served_without_network() {
    init_tracing();
    let site = Site::new();
    let worker = started(
        &config("v1", StrategyKind::CacheFirst),
        Arc::new(MemoryCacheStorage::new()),
        site.clone(),
    )
    .await;
    assert_eq!(site.calls(), 3);
    site.reset_calls();

    let result = worker
        .handle_fetch(get("https://timer.example.com/index.html"))
        .await
        .unwrap();

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.text().unwrap(), "content of /index.html");
    assert_eq!(site.calls(), 0);
}

#[tokio::test]
async fn test_fetched_responses_retrievable_after_settle() {
    init_tracing();
    let site = Site::new();
    let worker = started(
        &config("v1", StrategyKind::NetworkFirst),
        Arc::new(MemoryCacheStorage::new()),
        site.clone(),
    )
    .await;

    worker
        .handle_fetch(get("https://timer.example.com/app.js"))
        .await
        .unwrap();
    worker
        .handle_fetch(get("https://fonts.example.net/font.woff2"))
        .await
        .unwrap();
    worker.settle().await;

    let manager = worker.manager();
    assert!(manager
        .lookup(&get("https://timer.example.com/app.js"))
        .await
        .is_some());
    assert!(manager
        .lookup(&get("https://fonts.example.net/font.woff2"))
        .await
        .is_none());
    assert_eq!(manager.entry_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_network_first_goes_offline() {
    init_tracing();
    let site = Site::new();
    let worker = started(
        &config("v1", StrategyKind::NetworkFirst),
        Arc::new(MemoryCacheStorage::new()),
        site.clone(),
    )
    .await;

    worker
        .handle_fetch(get("https://timer.example.com/index.html"))
        .await
        .unwrap();
    worker.settle().await;
    site.go_offline();

    let cached = worker
        .handle_fetch(get("https://timer.example.com/index.html"))
        .await
        .unwrap();
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.response.text().unwrap(), "content of /index.html");

    let missing = worker
        .handle_fetch(get("https://timer.example.com/never-seen.css"))
        .await
        .unwrap();
    assert_eq!(missing.source, ResponseSource::Fallback);
    assert_eq!(missing.response.text().unwrap(), "Offline and not cached");

    worker.settle().await;
    assert_eq!(worker.manager().entry_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cache_first_offline_miss_is_an_error() {
    init_tracing();
    let site = Site::new();
    let worker = started(
        &config("v1", StrategyKind::CacheFirst),
        Arc::new(MemoryCacheStorage::new()),
        site.clone(),
    )
    .await;
    site.go_offline();

    let err = worker
        .handle_fetch(get("https://timer.example.com/uncached.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceWorkerError::Network(_)));
}

#[tokio::test]
async fn test_new_version_purges_old_caches() {
    init_tracing();
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
    let site = Site::new();

    let old = started(
        &config("luckydraw-timer-cache-v1", StrategyKind::CacheFirst),
        storage.clone(),
        site.clone(),
    )
    .await;
    old.terminate().await;

    let (new, _events) = OfflineWorker::new(
        &config("luckydraw-timer-cache-v2", StrategyKind::CacheFirst),
        storage.clone(),
        site.clone(),
    )
    .unwrap();
    new.install().await.unwrap();
    assert_eq!(storage.keys().await.unwrap().len(), 2);

    let report = new.activate().await.unwrap();
    assert_eq!(report.deleted_caches, vec!["luckydraw-timer-cache-v1"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["luckydraw-timer-cache-v2"]);
    assert_eq!(new.manager().entry_count().await.unwrap(), 3);

    let again = new.activate().await.unwrap();
    assert!(again.deleted_caches.is_empty());
    assert_eq!(new.manager().entry_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_non_get_requests_never_stored() {
    init_tracing();
    let site = Site::new();
    let worker = started(
        &config("v1", StrategyKind::NetworkFirst),
        Arc::new(MemoryCacheStorage::new()),
        site,
    )
    .await;

    let post = Request::post(
        Url::parse("https://timer.example.com/api/draw").unwrap(),
        bytes::Bytes::from_static(b"{}"),
    );
    let result = worker.handle_fetch(post).await.unwrap();
    assert_eq!(result.source, ResponseSource::Network);

    worker.settle().await;
    assert_eq!(worker.manager().entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_disk_cache_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let site = Site::new();
    let config = config("v1", StrategyKind::CacheFirst);

    {
        let storage = Arc::new(DiskCacheStorage::open(dir.path()).await.unwrap());
        started(&config, storage, site.clone()).await;
    }

    site.go_offline();
    site.reset_calls();

    let storage = Arc::new(DiskCacheStorage::open(dir.path()).await.unwrap());
    let (worker, _events) = OfflineWorker::new(&config, storage, site.clone()).unwrap();
    // Install fails to pre-populate while offline but the old entries remain.
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let result = worker
        .handle_fetch(get("https://timer.example.com/manifest.json"))
        .await
        .unwrap();
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.text().unwrap(), "content of /manifest.json");
}

#[tokio::test]
async fn test_cache_first_never_stores_redirect_to_other_origin() {
    init_tracing();
    let app = MockServer::start().await;
    let sso = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("{}/landing", sso.uri())),
        )
        .mount(&app)
        .await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>sign in</h1>"))
        .mount(&sso)
        .await;

    let scope = Url::parse(&format!("{}/", app.uri())).unwrap();
    let config = WorkerConfig::new("v1", scope.clone()).with_strategy(StrategyKind::CacheFirst);
    let loader = ResourceLoader::new(LoaderConfig::default(), Some(config.origin())).unwrap();
    let (worker, _events) =
        OfflineWorker::new(&config, Arc::new(MemoryCacheStorage::new()), Arc::new(loader))
            .unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let start = scope.join("start").unwrap();
    let result = worker.handle_fetch(Request::navigate(start.clone())).await.unwrap();
    worker.settle().await;

    assert_eq!(result.source, ResponseSource::Network);
    assert!(result.response.redirected);
    let landed = result.response.url.clone().unwrap();
    let sso_url = Url::parse(&sso.uri()).unwrap();
    assert_eq!(landed.port(), sso_url.port());

    let manager = worker.manager();
    assert_eq!(manager.entry_count().await.unwrap(), 0);
    assert!(manager.lookup(&Request::navigate(start)).await.is_none());
}
