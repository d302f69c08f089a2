use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::assets::{asset_key, AssetPipeline, AssetTable, PageAssets};
use crate::browser::{FetchProfile, FetchedPage, PageFetcher};
use crate::cache::{CacheKey, ContentCache, UrlRecord};
use crate::cli::config::AppConfig;
use crate::crawler::dispatch::{BrokerAssetFetcher, BrokerDispatcher, Dispatcher, LocalDispatcher};
use crate::crawler::extract::extract_references;
use crate::crawler::frontier::{dedup_key, Frontier, FrontierEntry};
use crate::crawler::job::{Checkpoint, CloneJob, JobRecord, JobStatus};
use crate::crawler::options::{CrawlMode, JobOptions, OptionsError};
use crate::crawler::progress::{ProgressChannel, ProgressEvent, ProgressStream};
use crate::crawler::retry::RetryPolicy;
use crate::crawler::target::{validate_target, TargetError};
use crate::crawler::task::{CrawlTask, PageRecord, TaskOutcome};
use crate::error::CrawlError;
use crate::mirror::{mirror_file, rewrite_html, MirrorIndex, MirrorLayout, MirrorManifest};
use crate::proxy::ProxyPool;
use crate::storage::{JobStore, TaskBroker};
use crate::utils::{content_hash, write_atomic, FetchMetrics};
use crate::verify::{ScoreWeights, ScriptProbe, Verifier};

/// Engine-wide settings of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Mirrors go under `<output_root>/<host>` unless a job names a directory
    pub output_root: PathBuf,

    pub retry: RetryPolicy,

    /// Persist a checkpoint every N finished page fetches
    pub checkpoint_interval: u32,

    /// Accept targets and assets on loopback or private networks
    pub allow_private_networks: bool,

    /// Cache lifetime for jobs that do not set one
    pub default_cache_ttl: Option<Duration>,

    pub weights: ScoreWeights,

    /// How long one poll for remote outcomes blocks
    pub outcome_poll: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./mirrors"),
            retry: RetryPolicy::default(),
            checkpoint_interval: 10,
            allow_private_networks: false,
            default_cache_ttl: None,
            weights: ScoreWeights::default(),
            outcome_poll: Duration::from_secs(1),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_root: PathBuf::from(&config.crawler.output_root),
            retry: config.retry.clone(),
            checkpoint_interval: config.crawler.checkpoint_interval,
            allow_private_networks: config.crawler.allow_private_networks,
            default_cache_ttl: config.cache.default_ttl_secs.map(Duration::from_secs),
            weights: config.verification.weights.clone(),
            ..Self::default()
        }
    }
}

/// Rejected job submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("distributed mode needs a task broker, none is configured")]
    NoBroker,

    #[error("failed to persist job: {0:#}")]
    Store(anyhow::Error),
}

/// Stop switches of a running job
#[derive(Clone, Default)]
struct RunControl {
    cancel: CancellationToken,

    /// Set together with `cancel` when the stop is a pause
    pause: Arc<AtomicBool>,
}

/// How a phase ended
#[derive(Debug)]
enum Flow {
    Continue,
    /// The run was stopped by a pause or cancel
    Interrupted,
    Failed(String),
}

/// Owns clone jobs from submission to their final record.
///
/// Page and asset fetches run through the local fetcher or, for distributed
/// jobs, through the task broker. Storing assets, link rewriting and
/// verification always run in this process.
pub struct Orchestrator {
    settings: OrchestratorSettings,

    store: Arc<dyn JobStore>,

    cache: Arc<dyn ContentCache>,

    fetcher: Arc<dyn PageFetcher>,

    broker: Option<Arc<dyn TaskBroker>>,

    proxies: Option<Arc<ProxyPool>>,

    probe: Option<Arc<dyn ScriptProbe>>,

    progress: ProgressChannel,

    /// Jobs running in this process
    running: Mutex<HashMap<String, RunControl>>,

    /// Name reported as the executor of local fetches
    worker_id: String,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn ContentCache>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            settings,
            store,
            cache,
            fetcher,
            broker: None,
            proxies: None,
            probe: None,
            progress: ProgressChannel::default(),
            running: Mutex::new(HashMap::new()),
            worker_id: format!("local-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn TaskBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Proxy pool whose per-job stickiness is released when a job ends
    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ScriptProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn subscribe(&self) -> ProgressStream {
        self.progress.subscribe()
    }

    /// Validate a submission and create the job in `pending`
    pub async fn submit(&self, url: &str, options: JobOptions) -> Result<String, SubmitError> {
        for warning in options.validate()? {
            warn!("{}", warning);
        }

        if options.mode == CrawlMode::Distributed && self.broker.is_none() {
            return Err(SubmitError::NoBroker);
        }

        let target = validate_target(url, self.settings.allow_private_networks).await?;

        let output_dir = match &options.output_dir {
            Some(dir) => dir.clone(),
            None => default_output_dir(&self.settings.output_root, &target).to_string_lossy().into_owned(),
        };

        let job = CloneJob::new(&target, options, output_dir);
        self.store.save(&job).await.map_err(SubmitError::Store)?;

        info!("Submitted job {} for {} into {}", job.id, job.target_url, job.output_dir);
        self.progress.emit(ProgressEvent {
            job_id: job.id.clone(),
            current_page: 0,
            total_pages: 0,
            status: job.status,
            message: format!("Job submitted for {}", job.target_url),
        });

        Ok(job.id)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.store.load(job_id).await?.map(|job| job.record()))
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        Ok(self.store.list().await?.iter().map(CloneJob::record).collect())
    }

    /// Stop a running job at the next safe point and checkpoint it
    pub async fn pause(&self, job_id: &str) -> Result<()> {
        let running = self.running.lock().await;
        let control = running.get(job_id)
            .ok_or_else(|| anyhow!("Job {} is not running in this process", job_id))?;

        info!("Pausing job {}", job_id);
        control.pause.store(true, Ordering::SeqCst);
        control.cancel.cancel();
        Ok(())
    }

    /// Cancel a job.
    ///
    /// A job running here stops at the next safe point. Otherwise the stored
    /// job is marked cancelled, which a run in another process notices at
    /// its next checkpoint.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        if let Some(control) = self.running.lock().await.get(job_id) {
            info!("Cancelling job {}", job_id);
            control.cancel.cancel();
            return Ok(());
        }

        let mut job = self.store.load(job_id).await?
            .ok_or_else(|| anyhow!("Job {} not found", job_id))?;
        if job.status.is_terminal() {
            bail!("Job {} is already {}", job_id, job.status);
        }

        job.transition(JobStatus::Cancelled)?;
        job.checkpoint = None;
        self.store.save(&job).await?;

        if let Some(broker) = &self.broker {
            broker.cancel_job(job_id).await?;
        }

        info!("Cancelled job {}", job_id);
        self.progress.emit(ProgressEvent {
            job_id: job.id.clone(),
            current_page: job.counters.pages_cloned,
            total_pages: job.counters.pages_cloned,
            status: job.status,
            message: "Job cancelled".to_string(),
        });
        Ok(())
    }

    /// Continue a paused or interrupted job from its last checkpoint
    pub async fn resume(&self, job_id: &str) -> Result<JobRecord> {
        let job = self.store.load(job_id).await?
            .ok_or_else(|| anyhow!("Job {} not found", job_id))?;

        match job.status {
            JobStatus::Paused | JobStatus::Crawling | JobStatus::Downloading | JobStatus::Verifying => {}
            status => bail!("Job {} is {} and cannot be resumed", job_id, status),
        }

        info!("Resuming job {} from {}", job_id, job.status);
        self.run(job_id).await
    }

    /// Run a job until it completes, fails, pauses or is cancelled
    pub async fn run(&self, job_id: &str) -> Result<JobRecord> {
        let job = self.store.load(job_id).await?
            .ok_or_else(|| anyhow!("Job {} not found", job_id))?;
        if job.status.is_terminal() {
            bail!("Job {} is already {}", job_id, job.status);
        }

        let control = RunControl::default();
        {
            let mut running = self.running.lock().await;
            if running.contains_key(job_id) {
                bail!("Job {} is already running", job_id);
            }
            running.insert(job_id.to_string(), control.clone());
        }

        let result = match JobRun::new(self, job.clone(), control) {
            Ok(mut state) => {
                let result = state.drive().await;
                Ok((state.job, state.metrics, result))
            }
            Err(e) => Err(e),
        };
        self.running.lock().await.remove(job_id);

        let (mut job, metrics, result) = match result {
            Ok(parts) => parts,
            Err(e) => (job, FetchMetrics::new(), Err(e)),
        };

        if let Err(e) = &result {
            error!("Job {} aborted: {:#}", job.id, e);
            job.record_error(None, &CrawlError::Infrastructure(format!("{:#}", e)), 1);
            if let Err(transition) = job.fail(format!("{:#}", e)) {
                debug!("Job {} left as is: {}", job.id, transition);
            }
        }

        self.finish(&mut job, &metrics).await;

        let saved = self.store.save(&job).await
            .context(format!("Failed to persist job {}", job.id));
        result?;
        saved?;

        Ok(job.record())
    }

    /// Release per-job resources and report the outcome
    async fn finish(&self, job: &mut CloneJob, metrics: &FetchMetrics) {
        if job.status.is_terminal() {
            job.checkpoint = None;

            if let (Some(broker), CrawlMode::Distributed) = (&self.broker, job.options.mode) {
                let result = match job.status {
                    JobStatus::Completed => broker.clear_job(&job.id).await,
                    _ => broker.cancel_job(&job.id).await,
                };
                if let Err(e) = result {
                    warn!("Failed to clean up broker state of job {}: {:#}", job.id, e);
                }
            }

            if let Some(proxies) = &self.proxies {
                proxies.release_job(&job.id).await;
            }
        }

        let stats = metrics.snapshot().await;
        let counters = &job.counters;
        info!(
            "Job {} is {}: {} pages ({} fetched, {} cached, {} failed), {} assets, {} requests ({:.1} ms mean, {:.2}/s), {} retries, {} errors",
            job.id,
            job.status,
            counters.pages_cloned,
            counters.pages_fetched,
            counters.pages_cached,
            counters.pages_failed,
            counters.assets_captured,
            stats.total_requests,
            stats.mean_duration_ms(),
            stats.requests_per_second(),
            counters.retries,
            job.errors.len()
        );

        self.progress.emit(ProgressEvent {
            job_id: job.id.clone(),
            current_page: job.counters.pages_cloned,
            total_pages: job.counters.pages_cloned,
            status: job.status,
            message: match &job.failure {
                Some(reason) => format!("Job {}: {}", job.status, reason),
                None => format!("Job {}", job.status),
            },
        });
    }
}

/// `<root>/<host>[_<port>]` with characters that are unsafe in paths replaced
fn default_output_dir(root: &Path, target: &Url) -> PathBuf {
    let host = target.host_str().unwrap_or("site");
    let name = match target.port() {
        Some(port) => format!("{}_{}", host, port),
        None => host.to_string(),
    };
    root.join(name.replace(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'), "_"))
}

fn error_status(error: &CrawlError) -> Option<u16> {
    match error {
        CrawlError::Http(status) | CrawlError::RateLimited { status, .. } => Some(*status),
        _ => None,
    }
}

/// Working state of one run of a job
struct JobRun<'a> {
    orchestrator: &'a Orchestrator,

    job: CloneJob,

    control: RunControl,

    frontier: Frontier,

    /// Dispatched entries by task id
    in_flight: HashMap<String, FrontierEntry>,

    pages: Vec<PageRecord>,

    /// Dedup keys of pages already written into the mirror
    pages_written: HashSet<String>,

    table: Arc<AssetTable>,

    layout: MirrorLayout,

    profile: FetchProfile,

    output_dir: PathBuf,

    cache_ttl: Option<Duration>,

    metrics: FetchMetrics,
}

impl<'a> JobRun<'a> {
    fn new(orchestrator: &'a Orchestrator, job: CloneJob, control: RunControl) -> Result<Self> {
        let root = Url::parse(&job.target_url)
            .context(format!("Job {} has an invalid target URL", job.id))?;

        let mut frontier = Frontier::new(&root, &job.options);
        let mut layout = MirrorLayout::new(&root, job.options.query_significant);
        let table = Arc::new(AssetTable::new());
        let mut pages = Vec::new();
        let mut pages_written = HashSet::new();

        match job.checkpoint.clone() {
            Some(checkpoint) => {
                frontier.restore(checkpoint.frontier);
                pages = checkpoint.pages;
                for page in &pages {
                    layout.reserve(&page.local_path, &page.canonical);
                }
                table.restore(checkpoint.assets);
                pages_written = checkpoint.pages_written.into_iter().collect();
                info!(
                    "Restored checkpoint of job {}: {} pages accepted, {} pending",
                    job.id,
                    pages.len(),
                    frontier.pending()
                );
            }
            None => {
                frontier.offer(&root, 0, None);
            }
        }

        let cache_ttl = job.options.cache.ttl_secs
            .map(Duration::from_secs)
            .or(orchestrator.settings.default_cache_ttl);

        Ok(Self {
            orchestrator,
            layout,
            profile: FetchProfile::from_options(&job.options),
            output_dir: PathBuf::from(&job.output_dir),
            job,
            control,
            frontier,
            in_flight: HashMap::new(),
            pages,
            pages_written,
            table,
            cache_ttl,
            metrics: FetchMetrics::new(),
        })
    }

    fn cache(&self) -> &dyn ContentCache {
        self.orchestrator.cache.as_ref()
    }

    fn uses_cache(&self) -> bool {
        self.job.options.incremental && self.job.options.cache.enabled
    }

    async fn drive(&mut self) -> Result<()> {
        if matches!(self.job.status, JobStatus::Pending | JobStatus::Paused) {
            self.job.transition(JobStatus::Crawling)?;
        }
        self.save().await?;

        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            let error = CrawlError::Infrastructure(format!("output directory {} is not writable: {}", self.output_dir.display(), e));
            self.job.record_error(None, &error, 1);
            return self.stop(Flow::Failed(error.to_string())).await;
        }

        if self.job.status == JobStatus::Crawling {
            self.emit(format!("Crawling {}", self.job.target_url));
            match self.crawl().await? {
                Flow::Continue => {
                    self.job.transition(JobStatus::Downloading)?;
                    self.checkpoint().await?;
                }
                flow => return self.stop(flow).await,
            }
        }

        if self.job.status == JobStatus::Downloading {
            self.emit("Capturing assets");
            match self.download().await? {
                Flow::Continue => {
                    self.job.transition(JobStatus::Verifying)?;
                    self.checkpoint().await?;
                }
                flow => return self.stop(flow).await,
            }
        }

        if self.job.status == JobStatus::Verifying {
            self.emit("Verifying mirror");
            self.verify().await;
            self.job.transition(JobStatus::Completed)?;
        }

        Ok(())
    }

    async fn stop(&mut self, flow: Flow) -> Result<()> {
        match flow {
            Flow::Continue => {}
            Flow::Failed(reason) => {
                warn!("Job {} failed: {}", self.job.id, reason);
                self.job.fail(reason)?;
            }
            Flow::Interrupted if self.control.pause.load(Ordering::SeqCst) => {
                self.snapshot();
                self.job.transition(JobStatus::Paused)?;
                info!("Job {} paused with {} pages accepted", self.job.id, self.pages.len());
            }
            Flow::Interrupted => {
                self.job.transition(JobStatus::Cancelled)?;
                info!("Job {} cancelled", self.job.id);
            }
        }
        Ok(())
    }

    /// Pop, dispatch and accept pages until the frontier is exhausted,
    /// `max_pages` is reached or the run is stopped
    async fn crawl(&mut self) -> Result<Flow> {
        let orchestrator = self.orchestrator;
        let mut dispatcher: Box<dyn Dispatcher> = match self.job.options.mode {
            CrawlMode::Local => Box::new(LocalDispatcher::new(
                orchestrator.fetcher.clone(),
                orchestrator.settings.retry.clone(),
                self.control.cancel.clone(),
                &orchestrator.worker_id,
            )),
            CrawlMode::Distributed => {
                let broker = orchestrator.broker.clone()
                    .ok_or_else(|| anyhow!("Job {} runs in distributed mode but no task broker is configured", self.job.id))?;
                // Flags left by an earlier pause would make workers drop our tasks
                broker.clear_job(&self.job.id).await?;
                Box::new(BrokerDispatcher::new(broker, &self.job.id, self.control.cancel.clone(), orchestrator.settings.outcome_poll))
            }
        };

        let max_pages = self.job.options.max_pages as usize;
        let concurrency = self.job.options.concurrency.max(1) as usize;
        let interval = orchestrator.settings.checkpoint_interval.max(1);
        let mut since_checkpoint = 0;
        let mut failure = None;

        while !self.control.cancel.is_cancelled() {
            while dispatcher.in_flight() < concurrency && self.processed() + dispatcher.in_flight() < max_pages {
                let entry = match self.frontier.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                if self.frontier.is_visited(&entry.dedup_key) {
                    continue;
                }

                let etag = self.conditional_etag(&entry).await;
                let task = CrawlTask::from_entry(&self.job.id, &entry, etag, self.profile.clone());
                debug!("Dispatching {} at depth {}", entry.url, entry.depth);

                self.in_flight.insert(task.task_id.clone(), entry);
                dispatcher.dispatch(task).await?;
            }

            if dispatcher.in_flight() == 0 {
                break;
            }

            let outcome = match dispatcher.next_outcome().await? {
                Some(outcome) => outcome,
                None => continue,
            };

            if let Some(reason) = self.accept(outcome).await? {
                failure = Some(reason);
                self.control.cancel.cancel();
                break;
            }

            since_checkpoint += 1;
            if since_checkpoint >= interval {
                since_checkpoint = 0;
                self.checkpoint().await?;
            }
        }

        if !self.control.cancel.is_cancelled() {
            info!("Frontier of job {} exhausted after {} pages", self.job.id, self.pages.len());
            return Ok(Flow::Continue);
        }

        // Fetches that finished while stopping still count
        for outcome in dispatcher.drain().await? {
            if let Some(reason) = self.accept(outcome).await? {
                failure.get_or_insert(reason);
            }
        }
        for (_, entry) in self.in_flight.drain() {
            self.frontier.requeue(entry);
        }

        Ok(match failure {
            Some(reason) => Flow::Failed(reason),
            None => Flow::Interrupted,
        })
    }

    /// Pages accepted or given up on
    fn processed(&self) -> usize {
        self.pages.len() + self.job.counters.pages_failed as usize
    }

    /// ETag to revalidate with, when an incremental run still holds the body
    async fn conditional_etag(&self, entry: &FrontierEntry) -> Option<String> {
        if !self.uses_cache() {
            return None;
        }

        let record = self.cache().get_url(&entry.canonical).await.ok().flatten()?;
        let etag = record.etag?;
        match self.cache().get(CacheKey::Hash(&record.content_hash)).await {
            Ok(Some(_)) => Some(etag),
            _ => None,
        }
    }

    async fn cached_body(&self, record: Option<&UrlRecord>) -> Option<String> {
        let record = record?;
        match self.cache().get(CacheKey::Hash(&record.content_hash)).await {
            Ok(Some(entry)) => String::from_utf8(entry.payload).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Cache lookup for {} failed: {:#}", record.url, e);
                None
            }
        }
    }

    /// Fold one fetch outcome into the job; returns a reason when the job must fail
    async fn accept(&mut self, outcome: TaskOutcome) -> Result<Option<String>> {
        let TaskOutcome { task, result, attempts, duration_ms, worker } = outcome;

        let entry = match self.in_flight.remove(&task.task_id) {
            Some(entry) => entry,
            None => {
                debug!("Ignoring outcome of unknown task {} from {}", task.task_id, worker);
                return Ok(None);
            }
        };
        if self.frontier.is_visited(&entry.dedup_key) {
            return Ok(None);
        }

        match result {
            Err(CrawlError::Cancelled) => {
                self.frontier.requeue(entry);
                Ok(None)
            }
            Err(error) => {
                let retries = attempts.saturating_sub(1);
                self.job.counters.retries += retries;
                self.job.counters.pages_failed += 1;
                self.metrics.record_retries(retries).await;
                self.metrics.record_request(false, duration_ms, error_status(&error), 0).await;

                self.frontier.mark_visited(&entry.dedup_key);
                warn!("Failed to fetch {} after {} attempts: {}", entry.url, attempts, error);
                self.job.record_error(Some(entry.url.as_str()), &error, attempts);

                if entry.depth == 0 && entry.parent_url.is_none() {
                    return Ok(Some(format!("root page {} could not be fetched: {}", entry.url, error)));
                }
                Ok(None)
            }
            Ok(page) => {
                let retries = attempts.saturating_sub(1);
                self.job.counters.retries += retries;
                self.metrics.record_retries(retries).await;

                self.accept_page(entry, page, duration_ms).await?;
                Ok(None)
            }
        }
    }

    async fn accept_page(&mut self, entry: FrontierEntry, page: FetchedPage, duration_ms: u64) -> Result<()> {
        let FetchedPage { final_url, status, html, etag, not_modified, bypass, .. } = page;

        let requested = Url::parse(&entry.url).context(format!("Invalid frontier URL: {}", entry.url))?;
        let final_url = Url::parse(&final_url).unwrap_or_else(|_| requested.clone());

        self.frontier.mark_visited(&entry.dedup_key);
        // A redirect target is the same page; do not fetch it again
        let final_key = dedup_key(&self.frontier.canonical(&final_url));
        self.frontier.mark_visited(&final_key);

        let previous = if self.job.options.cache.enabled {
            self.cache().get_url(&entry.canonical).await.unwrap_or_else(|e| {
                warn!("Cache lookup for {} failed: {:#}", entry.canonical, e);
                None
            })
        } else {
            None
        };

        let downloaded = if not_modified { 0 } else { html.len() as u64 };
        let (html, unchanged) = if not_modified {
            match self.cached_body(previous.as_ref()).await {
                Some(body) => (body, true),
                None => {
                    let error = CrawlError::Parse("server reported the page unchanged but no cached copy exists".to_string());
                    warn!("Dropping {}: {}", entry.url, error);
                    self.job.counters.pages_failed += 1;
                    self.job.record_error(Some(entry.url.as_str()), &error, 1);
                    return Ok(());
                }
            }
        } else {
            let hash = content_hash(html.as_bytes());
            let unchanged = self.uses_cache() && previous.as_ref().map_or(false, |record| record.content_hash == hash);
            (html, unchanged)
        };
        let hash = content_hash(html.as_bytes());

        let (links, assets) = match previous.as_ref().filter(|_| unchanged) {
            Some(record) => (record.links.clone(), record.assets.clone()),
            None => {
                let references = extract_references(&html, &final_url);
                let links = references.links
                    .into_iter()
                    .filter(|url| self.frontier.in_scope(url))
                    .map(|url| url.to_string())
                    .collect();
                let assets = references.assets.into_iter().map(|url| url.to_string()).collect();
                (links, assets)
            }
        };

        let depth = entry.depth + 1;
        for link in &links {
            if let Ok(url) = Url::parse(link) {
                self.frontier.offer(&url, depth, Some(entry.url.as_str()));
            }
        }

        // The downloading phase reads page bodies back from the cache
        self.cache().put(&hash, html.as_bytes(), self.cache_ttl).await
            .context(format!("Failed to cache the body of {}", entry.url))?;

        if self.job.options.cache.enabled {
            let record = UrlRecord {
                url: entry.canonical.clone(),
                content_hash: hash.clone(),
                etag: etag.or_else(|| previous.and_then(|record| record.etag)),
                links: links.clone(),
                assets: assets.clone(),
                stored_at: Utc::now(),
                ttl_secs: self.cache_ttl.map(|ttl| ttl.as_secs()),
            };
            if let Err(e) = self.cache().put_url(record).await {
                warn!("Failed to record {} in the cache: {:#}", entry.canonical, e);
            }
        }

        let counters = &mut self.job.counters;
        counters.pages_cloned += 1;
        counters.bytes_downloaded += downloaded;
        if unchanged {
            counters.pages_cached += 1;
            self.metrics.record_cache_hit().await;
        } else {
            counters.pages_fetched += 1;
        }
        self.metrics.record_request(true, duration_ms, Some(status), downloaded).await;

        debug!("Accepted {} ({} links, {} assets{})", entry.url, links.len(), assets.len(), if unchanged { ", unchanged" } else { "" });

        let local_path = self.layout.claim_page_path(&requested, &entry.canonical);
        self.pages.push(PageRecord {
            url: entry.url.clone(),
            final_url: final_url.to_string(),
            canonical: entry.canonical.clone(),
            dedup_key: entry.dedup_key.clone(),
            depth: entry.depth,
            status,
            content_hash: hash,
            links,
            assets,
            fetch_duration_ms: duration_ms,
            bypass,
            cached: unchanged,
            local_path,
            fetched_at: Utc::now(),
        });

        self.emit(format!("Captured {}", entry.url));
        Ok(())
    }

    /// Capture assets and write every accepted page into the mirror
    async fn download(&mut self) -> Result<Flow> {
        let orchestrator = self.orchestrator;
        let options = self.job.options.clone();

        if options.incremental {
            match MirrorManifest::load(&self.output_dir).await {
                Ok(Some(manifest)) => {
                    debug!("Reusing {} assets of the previous mirror", manifest.assets.len());
                    self.table.rehydrate(manifest.assets);
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring the manifest of the previous mirror: {:#}", e),
            }
        }

        let (fetcher, retry): (Arc<dyn PageFetcher>, RetryPolicy) = match options.mode {
            CrawlMode::Local => (orchestrator.fetcher.clone(), orchestrator.settings.retry.clone()),
            CrawlMode::Distributed => {
                let broker = orchestrator.broker.clone()
                    .ok_or_else(|| anyhow!("Job {} runs in distributed mode but no task broker is configured", self.job.id))?;
                let remote = BrokerAssetFetcher::new(broker, &self.job.id, self.control.cancel.clone(), orchestrator.settings.outcome_poll);
                (Arc::new(remote) as Arc<dyn PageFetcher>, orchestrator.settings.retry.remote())
            }
        };

        let concurrency = options.asset_concurrency.unwrap_or(options.concurrency).max(1) as usize;
        let pipeline = AssetPipeline::new(fetcher, self.table.clone(), self.output_dir.clone(), &self.job.id)
            .with_concurrency(concurrency)
            .with_retry(retry)
            .with_cancellation(self.control.cancel.clone())
            .with_profile(self.profile.clone())
            .with_metrics(self.metrics.clone())
            .optimize(options.optimize_assets)
            .allow_private(orchestrator.settings.allow_private_networks);

        let mut index = MirrorIndex::new(options.query_significant);
        for page in &self.pages {
            index.add_page(&page.canonical, &page.local_path);
        }
        for page in &self.pages {
            if let Ok(final_url) = Url::parse(&page.final_url) {
                index.add_page(&self.frontier.canonical(&final_url), &page.local_path);
            }
        }

        let pending: Vec<PageRecord> = self.pages
            .iter()
            .filter(|page| !self.pages_written.contains(&page.dedup_key))
            .cloned()
            .collect();
        info!("Writing {} pages of job {} into {}", pending.len(), self.job.id, self.output_dir.display());

        let writer = PageWriter {
            pipeline,
            index,
            cache: orchestrator.cache.as_ref(),
            output_dir: self.output_dir.clone(),
            cancel: self.control.cancel.clone(),
        };
        let writer = &writer;

        let mut writes = stream::iter(pending)
            .map(|page| async move {
                let result = writer.write(&page).await;
                (page, result)
            })
            .buffer_unordered(concurrency);

        let interval = orchestrator.settings.checkpoint_interval.max(1) as usize;
        let mut failure = None;
        let mut written = 0;

        while let Some((page, result)) = writes.next().await {
            match result {
                Ok(Some(write)) => {
                    self.absorb(write.assets);
                    if let Some(error) = write.error {
                        warn!("Page {} written with problems: {}", page.local_path, error);
                        self.job.record_error(Some(page.url.as_str()), &error, 1);
                    }
                    self.pages_written.insert(page.dedup_key.clone());
                    self.emit(format!("Wrote {}", page.local_path));

                    written += 1;
                    if written % interval == 0 {
                        self.poll_external_cancel().await?;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    error!("Failed to write {} into the mirror: {}", page.local_path, error);
                    self.job.record_error(Some(page.url.as_str()), &error, 1);
                    failure.get_or_insert_with(|| format!("mirror could not be written: {}", error));
                    self.control.cancel.cancel();
                }
            }
        }
        drop(writes);

        if let Some(reason) = failure {
            return Ok(Flow::Failed(reason));
        }
        if self.control.cancel.is_cancelled() {
            if let (Some(broker), CrawlMode::Distributed) = (&orchestrator.broker, options.mode) {
                // Workers drop the asset tasks still queued
                if let Err(e) = broker.cancel_job(&self.job.id).await {
                    warn!("Failed to flag job {} as cancelled on the broker: {:#}", self.job.id, e);
                }
            }
            return Ok(Flow::Interrupted);
        }

        let assets = self.table.records();
        self.job.counters.assets_captured = assets.len() as u32;

        let manifest = MirrorManifest::new(&self.job.id, &self.job.target_url, self.pages.clone(), assets);
        if let Err(e) = manifest.save(&self.output_dir).await {
            let error = CrawlError::Infrastructure(format!("{:#}", e));
            self.job.record_error(None, &error, 1);
            return Ok(Flow::Failed(format!("mirror manifest could not be written: {}", error)));
        }

        Ok(Flow::Continue)
    }

    fn absorb(&mut self, report: PageAssets) {
        let counters = &mut self.job.counters;
        counters.assets_downloaded += report.downloaded;
        counters.bytes_downloaded += report.bytes;
        counters.retries += report.retries;

        for failure in report.failures {
            if !matches!(failure.error, CrawlError::Cancelled) {
                self.job.record_error(Some(failure.url.as_str()), &failure.error, failure.attempts);
            }
        }
    }

    async fn verify(&mut self) {
        let orchestrator = self.orchestrator;
        let mut verifier = Verifier::new(orchestrator.settings.weights.clone())
            .with_query_significant(self.job.options.query_significant);

        if self.job.options.javascript_check {
            match &orchestrator.probe {
                Some(probe) => verifier = verifier.with_probe(probe.clone()),
                None => warn!("Job {} asks for a script check but no browser probe is configured", self.job.id),
            }
        }

        let assets = self.table.records();
        match verifier.verify(&self.output_dir, &self.pages, &assets).await {
            Ok(report) => {
                info!("Job {} scored {:.2} with {} issues", self.job.id, report.score, report.issues.len());
                self.job.verification = Some(report);
            }
            Err(error) => {
                warn!("Verification of job {} did not complete: {}", self.job.id, error);
                self.job.record_error(None, &error, 1);
            }
        }
    }

    /// Stop this run if the stored job was cancelled from elsewhere
    async fn poll_external_cancel(&mut self) -> Result<()> {
        if let Some(stored) = self.orchestrator.store.load(&self.job.id).await? {
            if stored.status == JobStatus::Cancelled && !self.control.cancel.is_cancelled() {
                info!("Job {} was cancelled from another process", self.job.id);
                self.control.pause.store(false, Ordering::SeqCst);
                self.control.cancel.cancel();
            }
        }
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.poll_external_cancel().await?;
        if self.control.cancel.is_cancelled() {
            return Ok(());
        }

        self.snapshot();
        self.save().await
    }

    fn snapshot(&mut self) {
        let assets = self.table.records();
        self.job.counters.assets_captured = assets.len() as u32;
        self.job.checkpoint = Some(Checkpoint {
            frontier: self.frontier.snapshot(self.in_flight.values().cloned()),
            pages: self.pages.clone(),
            assets,
            pages_written: self.pages_written.iter().cloned().collect(),
            saved_at: Some(Utc::now()),
        });
    }

    async fn save(&self) -> Result<()> {
        self.orchestrator.store.save(&self.job).await
            .context(format!("Failed to persist job {}", self.job.id))
    }

    fn emit(&self, message: impl Into<String>) {
        let current = self.job.counters.pages_cloned;
        let total = (self.frontier.seen_count() as u32).min(self.job.options.max_pages).max(current);

        self.orchestrator.progress.emit(ProgressEvent {
            job_id: self.job.id.clone(),
            current_page: current,
            total_pages: total,
            status: self.job.status,
            message: message.into(),
        });
    }
}

/// Result of writing one page
struct PageWrite {
    assets: PageAssets,

    /// Non-fatal problem with the page itself
    error: Option<CrawlError>,
}

/// Captures a page's assets, then rewrites and stores the page
struct PageWriter<'a> {
    pipeline: AssetPipeline,

    index: MirrorIndex,

    cache: &'a dyn ContentCache,

    output_dir: PathBuf,

    cancel: CancellationToken,
}

impl PageWriter<'_> {
    /// `Ok(None)` when the run was stopped before the page was written;
    /// `Err` only when the mirror itself cannot be written.
    async fn write(&self, page: &PageRecord) -> Result<Option<PageWrite>, CrawlError> {
        let page_url = match Url::parse(&page.final_url) {
            Ok(url) => url,
            Err(e) => {
                let error = CrawlError::Parse(format!("invalid page URL {}: {}", page.final_url, e));
                return Ok(Some(PageWrite { assets: PageAssets::default(), error: Some(error) }));
            }
        };

        let assets = self.pipeline.process_page(&page_url, &page.assets).await;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let html = match self.cache.get(CacheKey::Hash(&page.content_hash)).await {
            Ok(Some(entry)) => String::from_utf8_lossy(&entry.payload).into_owned(),
            Ok(None) => {
                let error = CrawlError::Infrastructure(format!("cached body of {} is gone", page.url));
                return Ok(Some(PageWrite { assets, error: Some(error) }));
            }
            Err(e) => {
                let error = CrawlError::Infrastructure(format!("cached body of {} is unreadable: {:#}", page.url, e));
                return Ok(Some(PageWrite { assets, error: Some(error) }));
            }
        };

        let table = self.pipeline.table();
        let resolve = |url: &Url| table.local_path(&asset_key(url)).or_else(|| self.index.resolve(url));

        let (html, error) = match rewrite_html(&html, &page_url, &page.local_path, &resolve) {
            Ok((rewritten, count)) => {
                debug!("Rewrote {} references in {}", count, page.local_path);
                (rewritten, None)
            }
            Err(e) => (html, Some(CrawlError::Parse(format!("{:#}", e)))),
        };

        let path = mirror_file(&self.output_dir, &page.local_path)
            .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;
        write_atomic(&path, html.as_bytes()).await
            .map_err(|e| CrawlError::Infrastructure(format!("{:#}", e)))?;

        Ok(Some(PageWrite { assets, error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::browser::{FetchRequest, FetchedAsset};
    use crate::cache::MemoryCache;
    use crate::crawler::worker::Worker;
    use crate::storage::{MemoryBroker, MemoryJobStore};
    use crate::testing::FakeFetcher;
    use crate::verify::IssueCategory;

    const ROOT: &str = "http://127.0.0.1/";

    fn site() -> FakeFetcher {
        FakeFetcher::new()
            .page(
                "http://127.0.0.1/",
                r#"<html><head><link rel="stylesheet" href="/css/site.css"></head>
                <body><a href="/about">About</a> <a href="/blog/">Blog</a> <img src="/img/logo.gif"></body></html>"#,
            )
            .page(
                "http://127.0.0.1/about",
                r#"<html><body><a href="/">Home</a> <img src="/img/logo-copy.gif"></body></html>"#,
            )
            .page(
                "http://127.0.0.1/blog/",
                r#"<html><body><a href="/about#team">About</a> <img src="photo.gif"></body></html>"#,
            )
            .asset("http://127.0.0.1/css/site.css", "text/css", b"body { background: url(../img/bg.gif) }")
            .asset("http://127.0.0.1/img/logo.gif", "image/gif", b"GIF89a-logo")
            .asset("http://127.0.0.1/img/logo-copy.gif", "image/gif", b"GIF89a-logo")
            .asset("http://127.0.0.1/blog/photo.gif", "image/gif", b"GIF89a-photo")
            .asset("http://127.0.0.1/img/bg.gif", "image/gif", b"GIF89a-bg")
    }

    fn settings(root: &Path) -> OrchestratorSettings {
        OrchestratorSettings {
            output_root: root.to_path_buf(),
            retry: RetryPolicy { initial_backoff_ms: 1, jitter: 0.0, ..RetryPolicy::default() },
            allow_private_networks: true,
            outcome_poll: Duration::from_millis(20),
            ..OrchestratorSettings::default()
        }
    }

    struct Harness {
        store: Arc<MemoryJobStore>,
        cache: Arc<MemoryCache>,
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                store: Arc::new(MemoryJobStore::default()),
                cache: Arc::new(MemoryCache::new()),
                root: dir.path().to_path_buf(),
                _dir: dir,
            }
        }

        fn orchestrator(&self, fetcher: Arc<dyn PageFetcher>) -> Orchestrator {
            Orchestrator::new(settings(&self.root), self.store.clone(), self.cache.clone(), fetcher)
        }
    }

    /// Serves the first `allowed` pages, then hangs and signals
    struct GatedFetcher {
        inner: FakeFetcher,
        allowed: usize,
        served: AtomicUsize,
        blocked: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl PageFetcher for GatedFetcher {
        async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
            if self.served.fetch_add(1, Ordering::SeqCst) < self.allowed {
                return self.inner.fetch_page(request).await;
            }
            let signal = self.blocked.lock().unwrap().take();
            if let Some(signal) = signal {
                let _ = signal.send(());
            }
            std::future::pending().await
        }

        async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError> {
            self.inner.fetch_asset(request).await
        }
    }

    #[tokio::test]
    async fn test_clones_site_into_verified_mirror() {
        let harness = Harness::new();
        let fetcher = Arc::new(site());
        let orchestrator = harness.orchestrator(fetcher.clone());
        let mut progress = orchestrator.subscribe();

        let id = orchestrator.submit(ROOT, JobOptions::default()).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.pages_cloned, 3);
        // logo.gif and logo-copy.gif share one file
        assert_eq!(record.assets_captured, 4);
        assert!(record.errors.is_empty(), "{:?}", record.errors);
        assert_eq!(record.verification.as_ref().unwrap().score, 100.0);

        let out = PathBuf::from(&record.output_dir);
        assert!(out.join("index.html").exists());
        assert!(out.join("about/index.html").exists());
        assert!(out.join("blog/index.html").exists());
        assert!(MirrorManifest::path(&out).exists());

        let about = std::fs::read_to_string(out.join("about/index.html")).unwrap();
        let home = std::fs::read_to_string(out.join("index.html")).unwrap();
        assert!(about.contains(r#"href="../index.html""#));
        let logo = about.split("src=\"../").nth(1).unwrap().split('"').next().unwrap();
        assert!(home.contains(&format!("src=\"{}\"", logo)));

        let job = harness.store.load(&id).await.unwrap().unwrap();
        assert!(job.checkpoint.is_none());
        assert_eq!(job.counters.assets_downloaded, 5);
        assert_eq!(fetcher.page_requests().len(), 3);

        let mut last = None;
        while let Some(event) = progress.try_next() {
            last = Some(event);
        }
        assert_eq!(last.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_unreachable_root_fails_job() {
        let harness = Harness::new();
        let fetcher = FakeFetcher::new()
            .failing(ROOT, vec![CrawlError::Network("connection refused".to_string()); 4]);
        let orchestrator = harness.orchestrator(Arc::new(fetcher));

        let id = orchestrator.submit(ROOT, JobOptions::default()).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].attempts, 4);
        let job = harness.store.load(&id).await.unwrap().unwrap();
        assert!(job.failure.unwrap().contains("root page"));
    }

    #[tokio::test]
    async fn test_page_errors_do_not_fail_job() {
        let harness = Harness::new();
        let fetcher = site().failing("http://127.0.0.1/blog/", vec![CrawlError::Blocked("captcha".to_string()); 2]);
        let orchestrator = harness.orchestrator(Arc::new(fetcher));

        let id = orchestrator.submit(ROOT, JobOptions::default()).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.pages_cloned, 2);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].url.as_deref(), Some("http://127.0.0.1/blog/"));
        // The home page still links to the blog, which the mirror lacks
        let report = record.verification.unwrap();
        assert_eq!(report.links.broken, 1);
        assert!(report.score < 100.0);
        assert!(report.issues.iter().any(|issue| {
            issue.category == IssueCategory::BrokenLink && issue.target == "http://127.0.0.1/blog/"
        }));
    }

    #[tokio::test]
    async fn test_limits_bound_the_crawl() {
        let harness = Harness::new();
        let fetcher = Arc::new(site());
        let orchestrator = harness.orchestrator(fetcher.clone());

        let options = JobOptions { max_depth: 0, ..JobOptions::default() };
        let id = orchestrator.submit(ROOT, options).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();
        assert_eq!(record.pages_cloned, 1);

        let options = JobOptions { max_pages: 2, concurrency: 1, ..JobOptions::default() };
        let id = orchestrator.submit(ROOT, options).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();
        assert_eq!(record.pages_cloned, 2);
        assert_eq!(fetcher.page_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_pause_then_resume_fetches_only_remaining_pages() {
        let harness = Harness::new();
        let (signal, blocked) = oneshot::channel();
        let gated = Arc::new(GatedFetcher {
            inner: site(),
            allowed: 2,
            served: AtomicUsize::new(0),
            blocked: std::sync::Mutex::new(Some(signal)),
        });
        let first = Arc::new(harness.orchestrator(gated));

        let options = JobOptions { concurrency: 1, ..JobOptions::default() };
        let id = first.submit(ROOT, options).await.unwrap();

        let pauser = {
            let first = first.clone();
            let id = id.clone();
            tokio::spawn(async move {
                blocked.await.unwrap();
                first.pause(&id).await.unwrap();
            })
        };

        let record = first.run(&id).await.unwrap();
        pauser.await.unwrap();
        assert_eq!(record.status, JobStatus::Paused);
        assert_eq!(record.pages_cloned, 2);

        let job = harness.store.load(&id).await.unwrap().unwrap();
        assert_eq!(job.checkpoint.as_ref().unwrap().pages.len(), 2);

        let fetcher = Arc::new(site());
        let second = harness.orchestrator(fetcher.clone());
        let record = second.resume(&id).await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.pages_cloned, 3);
        assert_eq!(fetcher.page_requests(), vec!["http://127.0.0.1/blog/".to_string()]);
        assert_eq!(record.verification.unwrap().score, 100.0);
    }

    #[tokio::test]
    async fn test_cancel_idle_job() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator(Arc::new(site()));

        let id = orchestrator.submit(ROOT, JobOptions::default()).await.unwrap();
        orchestrator.cancel(&id).await.unwrap();

        let record = orchestrator.job(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(orchestrator.run(&id).await.is_err());
        assert!(orchestrator.cancel(&id).await.is_err());
        assert!(orchestrator.resume(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator(Arc::new(site()));

        let bad = JobOptions { concurrency: 0, ..JobOptions::default() };
        assert!(matches!(orchestrator.submit(ROOT, bad).await, Err(SubmitError::Options(_))));

        assert!(matches!(
            orchestrator.submit("ftp://127.0.0.1/", JobOptions::default()).await,
            Err(SubmitError::Target(TargetError::UnsupportedScheme(_)))
        ));

        let distributed = JobOptions { mode: CrawlMode::Distributed, ..JobOptions::default() };
        assert!(matches!(orchestrator.submit(ROOT, distributed).await, Err(SubmitError::NoBroker)));

        let strict = Orchestrator::new(
            OrchestratorSettings { allow_private_networks: false, ..settings(&harness.root) },
            harness.store.clone(),
            harness.cache.clone(),
            Arc::new(site()),
        );
        assert!(matches!(
            strict.submit(ROOT, JobOptions::default()).await,
            Err(SubmitError::Target(TargetError::PrivateNetwork { .. }))
        ));
    }

    #[tokio::test]
    async fn test_incremental_rerun_skips_unchanged_pages() {
        let harness = Harness::new();
        let fetcher = Arc::new(site());
        let orchestrator = harness.orchestrator(fetcher.clone());

        let options = JobOptions { incremental: true, ..JobOptions::default() };
        let first = orchestrator.submit(ROOT, options.clone()).await.unwrap();
        orchestrator.run(&first).await.unwrap();
        let downloads = fetcher.asset_requests().len();

        let second = orchestrator.submit(ROOT, options).await.unwrap();
        let record = orchestrator.run(&second).await.unwrap();
        let job = harness.store.load(&second).await.unwrap().unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(job.counters.pages_cached, 3);
        assert_eq!(job.counters.pages_fetched, 0);
        assert_eq!(job.counters.assets_downloaded, 0);
        assert_eq!(fetcher.asset_requests().len(), downloads);
        assert_eq!(record.assets_captured, 4);
        assert_eq!(record.verification.unwrap().score, 100.0);
    }

    #[tokio::test]
    async fn test_distributed_job_runs_on_workers() {
        let harness = Harness::new();
        let broker = Arc::new(MemoryBroker::new());

        let worker_fetcher = Arc::new(site());
        let worker = Worker::new(broker.clone(), worker_fetcher.clone(), "remote-1").with_concurrency(2);
        let stop = CancellationToken::new();
        let handle = {
            let stop = stop.clone();
            tokio::spawn(async move { worker.run(stop).await })
        };

        let local = Arc::new(site());
        let orchestrator = harness.orchestrator(local.clone()).with_broker(broker.clone());
        let options = JobOptions { mode: CrawlMode::Distributed, ..JobOptions::default() };
        let id = orchestrator.submit(ROOT, options).await.unwrap();
        let record = orchestrator.run(&id).await.unwrap();

        stop.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.pages_cloned, 3);
        assert_eq!(worker_fetcher.page_requests().len(), 3);
        assert!(local.page_requests().is_empty());
        assert!(local.asset_requests().is_empty());
        assert!(!worker_fetcher.asset_requests().is_empty());
        assert_eq!(record.assets_captured, 4);
        assert_eq!(record.verification.unwrap().score, 100.0);
        assert_eq!(broker.pending_count().await.unwrap(), 0);
    }

    #[test]
    fn test_default_output_dir() {
        let root = Path::new("/data/mirrors");
        let url = Url::parse("http://127.0.0.1:8080/docs").unwrap();
        assert_eq!(default_output_dir(root, &url), root.join("127.0.0.1_8080"));
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(default_output_dir(root, &url), root.join("example.com"));
    }
}
