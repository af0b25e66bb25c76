//! FoodFest Smoke Harness
//!
//! Runs one worker version against a live origin: install, activate, then a
//! list of probe fetches. Prints a JSON summary of what came from cache, what
//! went to the network, and how long each phase took.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use foodfest_common::{init_logging, LogConfig, LogFormat, OfflineError, ResultExt};
use foodfest_net::{HttpFetcher, LoaderConfig, Request, Url};
use foodfest_sw::{
    CacheStore, DiskCacheStore, MemoryCacheStore, OfflineWorker, ServiceWorkerHost, WorkerConfig,
};
use serde_json::json;
use tracing::{error, info};

const DEFAULT_SCOPE: &str = "http://localhost:8080/";

/// Performance timing collector for tracking operation durations.
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn new() -> Self {
        Self {
            timings: HashMap::new(),
        }
    }

    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in self.timings.iter() {
            if durations.is_empty() {
                continue;
            }

            let count = durations.len();
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            let max_ms = durations
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": (total_ms * 100.0).round() / 100.0,
                    "avg_ms": (total_ms / count as f64 * 100.0).round() / 100.0,
                    "max_ms": (max_ms * 100.0).round() / 100.0,
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    scope: String,
    cache_dir: Option<PathBuf>,
    probes: Vec<String>,
    json_logs: bool,
    verbosity: u8,
    log_format: Option<String>,
    log_filter: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;
        let mut scope = DEFAULT_SCOPE.to_string();
        let mut cache_dir = None;
        let mut probes = Vec::new();
        let mut json_logs = false;
        let mut verbosity = 0u8;
        let mut log_format = None;
        let mut log_filter = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => config = args.next().map(PathBuf::from),
                "--scope" => {
                    if let Some(val) = args.next() {
                        scope = val;
                    }
                }
                "--cache-dir" => cache_dir = args.next().map(PathBuf::from),
                "--probe" => probes.extend(args.next()),
                "--json-logs" => json_logs = true,
                "-v" | "--verbose" => verbosity = verbosity.saturating_add(1),
                "-vv" => verbosity = verbosity.saturating_add(2),
                "--log-format" => log_format = args.next(),
                "--log-filter" => log_filter = args.next(),
                _ => {}
            }
        }

        Self {
            config,
            scope,
            cache_dir,
            probes,
            json_logs,
            verbosity,
            log_format,
            log_filter,
        }
    }

    fn log_config(&self) -> foodfest_common::Result<LogConfig> {
        let mut config = if self.json_logs {
            LogConfig::production()
        } else {
            LogConfig::from_verbosity(self.verbosity)
        };
        if let Some(ref name) = self.log_format {
            let format = name.parse::<LogFormat>().context("parsing --log-format")?;
            config = config.with_format(format);
        }
        if let Some(ref directives) = self.log_filter {
            config = config.with_filter(directives.clone());
        }
        Ok(config)
    }

    fn worker_config(&self) -> foodfest_common::Result<WorkerConfig> {
        match self.config {
            Some(ref path) => WorkerConfig::from_json_file(path).map_err(|e| {
                OfflineError::config_with_source(format!("loading {}", path.display()), e)
            }),
            None => {
                let scope = self.scope.parse::<Url>().context("parsing --scope")?;
                Ok(WorkerConfig::foodfest(scope))
            }
        }
    }
}

async fn run(args: Args) -> foodfest_common::Result<serde_json::Value> {
    let config = args.worker_config()?;
    let scope = config.scope.clone();
    let mut probes = args.probes.clone();
    if probes.is_empty() {
        probes = config.manifest.paths().to_vec();
        probes.push("./missing.png".to_string());
    }

    let store: Arc<dyn CacheStore> = match args.cache_dir {
        Some(ref dir) => Arc::new(
            DiskCacheStore::open_dir(dir)
                .await
                .map_err(|e| OfflineError::cache_with_source("opening cache dir", e))?,
        ),
        None => Arc::new(MemoryCacheStore::new()),
    };
    let network = Arc::new(
        HttpFetcher::new(LoaderConfig::default())
            .map_err(|e| OfflineError::network_with_source("building HTTP client", e))?,
    );

    let (host, _events) = ServiceWorkerHost::new(scope, network.clone());
    let worker = OfflineWorker::new(config, store, network)?;
    let mut perf = PerfTiming::new();

    let start = Instant::now();
    let outcome = host.register(worker).await?;
    perf.record("install", start.elapsed());
    info!(cache = %outcome.report.cache, cached = outcome.report.cached, "Installed");

    let start = Instant::now();
    let activation = host.try_activate().await?.unwrap_or_default();
    perf.record("activate", start.elapsed());

    let mut fetches = Vec::new();
    for probe in &probes {
        let url = host.resolve(probe).await?;
        let start = Instant::now();
        let result = host.fetch(Request::get(url.clone())).await;
        perf.record("fetch", start.elapsed());

        fetches.push(match result {
            Ok(response) => json!({
                "url": url.as_str(),
                "status": response.status,
                "from_cache": response.from_cache,
                "bytes": response.body.len(),
            }),
            Err(e) => json!({ "url": url.as_str(), "error": e.to_string() }),
        });
    }

    Ok(json!({
        "cache": outcome.report.cache,
        "cached": outcome.report.cached,
        "activation": {
            "retained": activation.retained,
            "deleted": activation.deleted,
            "failed": activation.failed,
        },
        "fetches": fetches,
        "timings": perf.summary(),
    }))
}

#[tokio::main]
async fn main() -> foodfest_common::Result<()> {
    let args = Args::parse();
    init_logging(args.log_config()?);

    match run(args).await {
        Ok(summary) => {
            let rendered =
                serde_json::to_string_pretty(&summary).context("rendering summary")?;
            println!("{rendered}");
            Ok(())
        }
        Err(e) => {
            error!(category = e.category(), error = %e, "Smoke run failed");
            Err(e)
        }
    }
}
