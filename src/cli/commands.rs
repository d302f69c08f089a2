use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{BrowserFetcher, BrowserScriptProbe, HttpFetcher, PageFetcher};
use crate::bypass::{ChallengeBypass, HttpSolver};
use crate::cache::{ContentCache, DiskCache, MemoryCache};
use crate::cli::config::AppConfig;
use crate::cli::CloneArgs;
use crate::crawler::job::JobRecord;
use crate::crawler::options::{CrawlMode, JobOptions};
use crate::crawler::{Orchestrator, OrchestratorSettings, Worker};
use crate::proxy::ProxyPool;
use crate::storage::{JobStore, JobStoreFactory, RedisBroker, TaskBroker};

/// Default page for proxy probes
const PROXY_CHECK_URL: &str = "https://httpbin.org/ip";

/// Page fetcher and the resources it holds
struct Fetchers {
    fetcher: Arc<dyn PageFetcher>,

    browser: Option<Arc<BrowserFetcher>>,

    proxies: Arc<ProxyPool>,
}

impl Fetchers {
    fn build(config: &AppConfig) -> Result<Self> {
        let proxies = Arc::new(ProxyPool::new(&config.proxy));

        let mut bypass = ChallengeBypass::new(
            config.bypass.enabled,
            config.bypass.max_attempts,
            Duration::from_secs(config.bypass.challenge_wait_secs),
        );
        if let Some(solver) = &config.bypass.solver {
            let solver = HttpSolver::new(&solver.url, solver.api_key.clone(), Duration::from_secs(solver.timeout_secs))
                .context("Failed to set up the challenge solver")?;
            bypass = bypass.with_solver(Arc::new(solver));
        }

        let http = HttpFetcher::new(&config.crawler.user_agent, Duration::from_secs(config.crawler.request_timeout_secs))
            .with_proxies(proxies.clone())
            .with_bypass(bypass.clone());

        match config.crawler.fetcher.as_str() {
            "http" => Ok(Self { fetcher: Arc::new(http), browser: None, proxies }),
            "browser" => {
                let browser = Arc::new(
                    BrowserFetcher::new(config.browser.clone(), http)
                        .with_proxies(proxies.clone())
                        .with_bypass(bypass),
                );
                Ok(Self { fetcher: browser.clone(), browser: Some(browser), proxies })
            }
            other => bail!("Unknown fetcher '{}', expected 'http' or 'browser'", other),
        }
    }

    async fn shutdown(&self) {
        if let Some(browser) = &self.browser {
            browser.shutdown().await;
        }
    }
}

/// Everything a command needs to run jobs
struct Engine {
    orchestrator: Arc<Orchestrator>,

    fetchers: Fetchers,

    probe: Arc<BrowserScriptProbe>,
}

impl Engine {
    async fn build(config: &AppConfig, store: Arc<dyn JobStore>, distributed: bool) -> Result<Self> {
        let fetchers = Fetchers::build(config)?;
        let cache = open_cache(config).await?;

        let mut orchestrator = Orchestrator::new(
            OrchestratorSettings::from_config(config),
            store,
            cache,
            fetchers.fetcher.clone(),
        )
        .with_proxies(fetchers.proxies.clone());

        if distributed {
            orchestrator = orchestrator.with_broker(connect_broker(config).await?);
        }

        let probe = Arc::new(BrowserScriptProbe::new(
            config.browser.clone(),
            Duration::from_millis(config.verification.javascript_wait_ms),
        ));
        orchestrator = orchestrator.with_probe(probe.clone());

        Ok(Self { orchestrator: Arc::new(orchestrator), fetchers, probe })
    }

    /// Run a job in the foreground, pausing it on Ctrl-C
    async fn run(&self, job_id: &str, resume: bool) -> Result<JobRecord> {
        let mut progress = self.orchestrator.subscribe();
        let watched = job_id.to_string();
        let reporter = tokio::spawn(async move {
            while let Some(event) = progress.next().await {
                if event.job_id == watched {
                    info!("[{}] {}/{} {}", event.status, event.current_page, event.total_pages, event.message);
                }
            }
        });

        let interrupt = {
            let orchestrator = self.orchestrator.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, pausing job {}", job_id);
                    if let Err(e) = orchestrator.pause(&job_id).await {
                        warn!("Failed to pause job {}: {:#}", job_id, e);
                    }
                }
            })
        };

        let result = if resume {
            self.orchestrator.resume(job_id).await
        } else {
            self.orchestrator.run(job_id).await
        };

        interrupt.abort();
        reporter.abort();
        self.shutdown().await;
        result
    }

    async fn shutdown(&self) {
        self.fetchers.shutdown().await;
        self.probe.shutdown().await;
    }
}

async fn open_cache(config: &AppConfig) -> Result<Arc<dyn ContentCache>> {
    match config.cache.backend.as_str() {
        "disk" => Ok(Arc::new(DiskCache::open(&config.cache.path).await?)),
        "memory" => Ok(Arc::new(MemoryCache::new())),
        other => bail!("Unknown cache backend '{}', expected 'disk' or 'memory'", other),
    }
}

async fn connect_broker(config: &AppConfig) -> Result<Arc<dyn TaskBroker>> {
    let broker = RedisBroker::connect(&config.storage.queue)
        .await
        .context(format!("Failed to connect to the task queue at {}", config.storage.queue.redis_url))?;
    Ok(Arc::new(broker))
}

fn load_config(profile: Option<&str>) -> Result<AppConfig> {
    AppConfig::load(profile).context(format!("Failed to load configuration {}", profile.unwrap_or("default")))
}

/// Job options from the configuration, an options file and flags, in that order
fn job_options(config: &AppConfig, args: &CloneArgs) -> Result<JobOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .context(format!("Failed to read job options from {}", path.display()))?;
            let (options, _) = JobOptions::from_json(&json)
                .context(format!("Invalid job options in {}", path.display()))?;
            options
        }
        None => config.job_defaults(),
    };

    if let Some(depth) = args.depth {
        options.max_depth = depth;
    }
    if let Some(limit) = args.limit {
        options.max_pages = limit;
    }
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency;
    }
    if args.output.is_some() {
        options.output_dir = args.output.clone();
    }
    if args.incremental {
        options.incremental = true;
    }
    if args.distributed {
        options.mode = CrawlMode::Distributed;
    }
    if args.proxy {
        options.proxy.enabled = true;
    }
    if args.no_optimize {
        options.optimize_assets = false;
    }
    if args.javascript_check {
        options.javascript_check = true;
    }

    Ok(options)
}

fn print_record(record: &JobRecord) {
    println!("Job ID: {}", record.id);
    println!("URL: {}", record.url);
    println!("Status: {}", record.status);
    println!("Pages cloned: {}", record.pages_cloned);
    println!("Assets captured: {}", record.assets_captured);
    println!("Output: {}", record.output_dir);

    if let Some(report) = &record.verification {
        println!(
            "Verification score: {:.2} (links {}/{}, assets {}/{})",
            report.score, report.links.valid, report.links.total, report.assets.found, report.assets.expected
        );
    }

    if !record.errors.is_empty() {
        println!("Errors ({}):", record.errors.len());
        for error in record.errors.iter().rev().take(10) {
            match &error.url {
                Some(url) => println!("  - {:?} {} ({} attempts): {}", error.kind, url, error.attempts, error.message),
                None => println!("  - {:?}: {}", error.kind, error.message),
            }
        }
    }
}

/// Submit a clone job and, unless detached, run it to the end
pub async fn clone(profile: Option<&str>, url: String, args: CloneArgs) -> Result<()> {
    let config = load_config(profile)?;
    let options = job_options(&config, &args)?;
    let distributed = options.mode == CrawlMode::Distributed;

    let store = JobStoreFactory::create(&config.storage.jobs).await?;
    let engine = Engine::build(&config, store, distributed).await?;

    let job_id = engine.orchestrator.submit(&url, options).await?;
    println!("Job ID: {}", job_id);

    if args.detach {
        info!("Use `cloner resume {}` to run the job", job_id);
        return Ok(());
    }

    let record = engine.run(&job_id, false).await?;
    print_record(&record);
    Ok(())
}

/// Continue a job from its last checkpoint
pub async fn resume(profile: Option<&str>, job_id: String) -> Result<()> {
    let config = load_config(profile)?;
    let store = JobStoreFactory::create(&config.storage.jobs).await?;

    let job = store.load(&job_id).await?.context(format!("Job {} not found", job_id))?;
    let distributed = job.options.mode == CrawlMode::Distributed;

    let engine = Engine::build(&config, store, distributed).await?;
    let record = engine.run(&job_id, true).await?;
    print_record(&record);
    Ok(())
}

/// Show one job or list every job
pub async fn status(profile: Option<&str>, job_id: Option<String>) -> Result<()> {
    let config = load_config(profile)?;
    let store = JobStoreFactory::create(&config.storage.jobs).await?;

    match job_id {
        Some(job_id) => {
            let job = store.load(&job_id).await?.context(format!("Job {} not found", job_id))?;
            print_record(&job.record());

            if let Some(checkpoint) = &job.checkpoint {
                println!(
                    "Checkpoint: {} pages accepted, {} URLs pending",
                    checkpoint.pages.len(),
                    checkpoint.frontier.pending.len()
                );
            }
        }
        None => {
            let mut jobs = store.list().await?;
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in jobs {
                println!(
                    "{}  {:<11} {:>5} pages  {}  {}",
                    job.id,
                    job.status.to_string(),
                    job.counters.pages_cloned,
                    job.created_at.format("%Y-%m-%d %H:%M"),
                    job.target_url
                );
            }
        }
    }

    Ok(())
}

/// Cancel a job running anywhere
pub async fn cancel(profile: Option<&str>, job_id: String) -> Result<()> {
    let config = load_config(profile)?;
    let store = JobStoreFactory::create(&config.storage.jobs).await?;

    let job = store.load(&job_id).await?.context(format!("Job {} not found", job_id))?;
    let distributed = job.options.mode == CrawlMode::Distributed;

    let engine = Engine::build(&config, store, distributed).await?;
    engine.orchestrator.cancel(&job_id).await?;
    engine.shutdown().await;

    println!("Job {} cancelled", job_id);
    Ok(())
}

/// Serve page fetches of distributed jobs until Ctrl-C
pub async fn worker(profile: Option<&str>, id: Option<String>, concurrency: usize) -> Result<()> {
    let config = load_config(profile)?;
    let broker = connect_broker(&config).await?;
    let fetchers = Fetchers::build(&config)?;

    let id = id.unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]));
    let worker = Worker::new(broker, fetchers.fetcher.clone(), &id)
        .with_retry(config.retry.clone())
        .with_lease(Duration::from_secs(config.storage.queue.lease_secs))
        .with_concurrency(concurrency);

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopping worker");
                stop.cancel();
            }
        });
    }

    let result = worker.run(stop).await;
    fetchers.shutdown().await;
    result
}

/// Print proxy health
pub async fn proxies(profile: Option<&str>, check: bool) -> Result<()> {
    let config = load_config(profile)?;
    let pool = ProxyPool::new(&config.proxy);

    if pool.is_empty().await {
        println!("No proxies configured");
        return Ok(());
    }

    if check {
        let url = config.proxy.check_url.as_deref().unwrap_or(PROXY_CHECK_URL);
        info!("Probing proxies against {}", url);
        pool.probe_all(url).await?;
    }

    for status in pool.status().await {
        println!(
            "{:<20} {:<4} {:<10} uses {:>5}  failures {:>4} ({} in a row)  latency {}",
            status.name,
            status.country.as_deref().unwrap_or("-"),
            status.state,
            status.total_uses,
            status.total_failures,
            status.consecutive_failures,
            status.latency_ms.map(|ms| format!("{:.0} ms", ms)).unwrap_or_else(|| "-".to_string())
        );
    }

    Ok(())
}

/// Remove expired cache entries
pub async fn purge_cache(profile: Option<&str>) -> Result<()> {
    let config = load_config(profile)?;
    let cache = open_cache(&config).await?;

    let removed = cache.purge_expired().await?;
    println!("Removed {} expired cache entries", removed);
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = AppConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults if it does not exist
pub fn manage_profile(name: &str) -> Result<()> {
    match AppConfig::load_profile(name) {
        Ok(config) => {
            println!("Profile: {}", name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", name);
            let path = AppConfig::default().save_as_profile(name)?;
            println!("Created default profile {} at {}", name, path.display());
        }
    }

    Ok(())
}

/// Show the configuration in effect
pub fn show_config(profile: Option<&str>) -> Result<()> {
    let config = load_config(profile)?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
