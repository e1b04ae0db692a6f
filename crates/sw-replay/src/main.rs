//! sw-replay - drive the RustKit offline worker from the command line
//!
//! Loads a worker config, opens a directory-backed cache store, runs install
//! and activate, then replays each URL through the worker and prints where the
//! response came from. Running it twice with `--offline` shows what a page
//! would get with the network gone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rustkit_common::{init_logging, LogConfig, LogFormat, RustKitError};
use rustkit_net::{Fetcher, NetError, Request, ResourceLoader, Response};
use rustkit_sw::{DiskCacheStorage, OfflineWorker, ServiceWorkerEvent, WorkerConfig};
use serde_json::json;
use tracing::{error, info};
use url::Url;

const USAGE: &str = "\
usage: sw-replay --config <sw.json> [options] <url>...

options:
  --config <path>       worker configuration (JSON)
  --cache-dir <dir>     cache storage directory (default: .sw-cache)
  --offline             fail every network request
  --json                print one JSON object per URL
  --log-format <fmt>    pretty | compact | json
  -v, -vv               more logging
";

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    cache_dir: PathBuf,
    offline: bool,
    json: bool,
    log_format: LogFormat,
    verbosity: u8,
    urls: Vec<String>,
}

impl Args {
    fn parse() -> Result<Self, RustKitError> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            cache_dir: PathBuf::from(".sw-cache"),
            offline: false,
            json: false,
            log_format: LogFormat::Compact,
            verbosity: 0,
            urls: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--cache-dir" => {
                    if let Some(dir) = args.next() {
                        parsed.cache_dir = PathBuf::from(dir);
                    }
                }
                "--offline" => parsed.offline = true,
                "--json" => parsed.json = true,
                "--log-format" => {
                    let value = args.next().ok_or_else(|| {
                        RustKitError::InvalidArgument("--log-format needs a value".into())
                    })?;
                    parsed.log_format = value.parse()?;
                }
                "-v" => parsed.verbosity = parsed.verbosity.saturating_add(1),
                "-vv" => parsed.verbosity = parsed.verbosity.saturating_add(2),
                "-h" | "--help" => {
                    print!("{USAGE}");
                    std::process::exit(0);
                }
                flag if flag.starts_with('-') => {
                    return Err(RustKitError::InvalidArgument(format!(
                        "unknown option '{flag}'"
                    )));
                }
                url => parsed.urls.push(url.to_string()),
            }
        }

        Ok(parsed)
    }
}

/// Network that is always down.
struct OfflineNetwork;

#[async_trait]
impl Fetcher for OfflineNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        Err(NetError::RequestFailed(format!("offline: {}", request.url)))
    }
}

#[tokio::main]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("sw-replay: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let log_config = LogConfig::verbosity(args.verbosity).with_format(args.log_format);
    if let Err(e) = init_logging(log_config) {
        eprintln!("sw-replay: {e}");
    }

    if let Err(e) = run(args).await {
        error!(category = e.category(), error = %e, "Replay failed");
        eprintln!("sw-replay: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), RustKitError> {
    let config_path = args
        .config
        .as_ref()
        .ok_or_else(|| RustKitError::InvalidArgument("--config is required".into()))?;
    let config = WorkerConfig::load(config_path)?;

    let storage = Arc::new(DiskCacheStorage::open(&args.cache_dir).await?);
    let fetcher: Arc<dyn Fetcher> = if args.offline {
        Arc::new(OfflineNetwork)
    } else {
        let loader = ResourceLoader::new(config.loader.clone(), Some(config.origin()))
            .map_err(|e| RustKitError::network_with_source("cannot build HTTP client", e))?;
        Arc::new(loader)
    };

    let (worker, mut events) = OfflineWorker::new(&config, storage, fetcher)?;
    worker.install().await?;
    let report = worker.activate().await?;
    info!(
        deleted = report.deleted_caches.len(),
        cache = %config.cache_version,
        "Worker active"
    );

    while let Ok(event) = events.try_recv() {
        if let ServiceWorkerEvent::CachesDeleted { names } = event {
            for name in names {
                println!("deleted cache {name}");
            }
        }
    }

    for raw in &args.urls {
        let url = resolve(&config.scope, raw)?;
        let started = Instant::now();
        let outcome = worker.handle_fetch(Request::get(url.clone())).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                let source = format!("{:?}", result.source).to_lowercase();
                if args.json {
                    println!(
                        "{}",
                        json!({
                            "url": url.as_str(),
                            "status": result.response.status,
                            "source": source,
                            "bytes": result.response.body_len(),
                            "ms": (elapsed_ms * 100.0).round() / 100.0,
                        })
                    );
                } else {
                    println!(
                        "{:>3} {:<8} {} ({} bytes)",
                        result.response.status,
                        source,
                        url,
                        result.response.body_len()
                    );
                }
            }
            Err(e) => {
                if args.json {
                    println!("{}", json!({ "url": url.as_str(), "error": e.to_string() }));
                } else {
                    println!("ERR {:<8} {} ({})", "-", url, e);
                }
            }
        }
    }

    let settled = worker.settle().await;
    info!(writes = settled, "Background cache writes settled");
    Ok(())
}

/// Resolve a command-line URL, relative ones against the worker scope.
fn resolve(scope: &Url, raw: &str) -> Result<Url, RustKitError> {
    scope
        .join(raw)
        .map_err(|e| RustKitError::InvalidArgument(format!("invalid URL '{raw}': {e}")))
}
