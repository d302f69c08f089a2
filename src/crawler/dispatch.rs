use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::browser::{FetchRequest, FetchedAsset, FetchedPage, PageFetcher};
use crate::crawler::retry::{with_retry, RetryPolicy};
use crate::crawler::task::{AssetOutcome, CrawlTask, TaskOutcome};
use crate::error::CrawlError;
use crate::storage::TaskBroker;

/// Fetch one task's page under the retry policy
pub async fn execute_task(
    fetcher: &dyn PageFetcher,
    task: CrawlTask,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    worker: &str,
) -> TaskOutcome {
    let started = Instant::now();

    let (result, attempts) = match Url::parse(&task.url) {
        Ok(url) => {
            let request = FetchRequest::new(url, &task.job_id, task.profile.clone()).with_etag(task.etag.clone());
            let outcome = with_retry(retry, cancel, &task.url, |_| fetcher.fetch_page(&request)).await;
            (outcome.result, outcome.attempts)
        }
        Err(e) => (Err(CrawlError::Parse(format!("invalid task URL {}: {}", task.url, e))), 1),
    };

    TaskOutcome {
        task,
        result,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
        worker: worker.to_string(),
    }
}

/// Download one asset task's bytes under the retry policy
pub async fn execute_asset_task(
    fetcher: &dyn PageFetcher,
    task: CrawlTask,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    worker: &str,
) -> AssetOutcome {
    let started = Instant::now();

    let (result, attempts) = match Url::parse(&task.url) {
        Ok(url) => {
            let request = FetchRequest::new(url, &task.job_id, task.profile.clone());
            let outcome = with_retry(retry, cancel, &task.url, |_| fetcher.fetch_asset(&request)).await;
            (outcome.result, outcome.attempts)
        }
        Err(e) => (Err(CrawlError::Parse(format!("invalid asset URL {}: {}", task.url, e))), 1),
    };

    AssetOutcome {
        task,
        result,
        attempts,
        duration_ms: started.elapsed().as_millis() as u64,
        worker: worker.to_string(),
    }
}

/// Where the orchestrator sends page fetches
#[async_trait]
pub trait Dispatcher: Send {
    async fn dispatch(&mut self, task: CrawlTask) -> Result<()>;

    /// Next finished task; `None` when nothing is in flight or waiting was cancelled
    async fn next_outcome(&mut self) -> Result<Option<TaskOutcome>>;

    fn in_flight(&self) -> usize;

    /// Stop after cancellation, returning outcomes that still completed.
    ///
    /// Tasks without an outcome are abandoned; the caller requeues them.
    async fn drain(&mut self) -> Result<Vec<TaskOutcome>>;
}

/// Fetches pages in-process on the runtime's worker threads
pub struct LocalDispatcher {
    fetcher: Arc<dyn PageFetcher>,

    retry: RetryPolicy,

    cancel: CancellationToken,

    tasks: JoinSet<TaskOutcome>,

    worker: String,
}

impl LocalDispatcher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, retry: RetryPolicy, cancel: CancellationToken, worker: &str) -> Self {
        Self { fetcher, retry, cancel, tasks: JoinSet::new(), worker: worker.to_string() }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&mut self, task: CrawlTask) -> Result<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let worker = self.worker.clone();

        self.tasks.spawn(async move { execute_task(fetcher.as_ref(), task, &retry, &cancel, &worker).await });
        Ok(())
    }

    async fn next_outcome(&mut self) -> Result<Option<TaskOutcome>> {
        match self.tasks.join_next().await {
            Some(joined) => Ok(Some(joined.context("Fetch task panicked")?)),
            None => Ok(None),
        }
    }

    fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    async fn drain(&mut self) -> Result<Vec<TaskOutcome>> {
        // In-process fetches observe the same cancellation token and end quickly
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next_outcome().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Fans page fetches out to remote workers through the task broker
pub struct BrokerDispatcher {
    broker: Arc<dyn TaskBroker>,

    job_id: String,

    cancel: CancellationToken,

    /// How long a single outcome poll blocks
    poll: Duration,

    /// Task ids awaiting an outcome
    pending: HashSet<String>,
}

impl BrokerDispatcher {
    pub fn new(broker: Arc<dyn TaskBroker>, job_id: &str, cancel: CancellationToken, poll: Duration) -> Self {
        Self { broker, job_id: job_id.to_string(), cancel, poll, pending: HashSet::new() }
    }
}

#[async_trait]
impl Dispatcher for BrokerDispatcher {
    async fn dispatch(&mut self, task: CrawlTask) -> Result<()> {
        self.broker.push_task(&task).await?;
        self.pending.insert(task.task_id.clone());
        Ok(())
    }

    async fn next_outcome(&mut self) -> Result<Option<TaskOutcome>> {
        while !self.pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            // Leases of crashed workers run out here and the task is redelivered
            let reclaimed = self.broker.reclaim_expired().await?;
            if reclaimed > 0 {
                debug!("Reclaimed {} expired task leases", reclaimed);
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                outcome = self.broker.pull_outcome(&self.job_id, self.poll) => outcome?,
            };

            if let Some(outcome) = outcome {
                // Redelivered tasks can report twice
                if self.pending.remove(&outcome.task.task_id) {
                    return Ok(Some(outcome));
                }
                debug!("Ignoring duplicate outcome for {}", outcome.task.url);
            }
        }
        Ok(None)
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn drain(&mut self) -> Result<Vec<TaskOutcome>> {
        if let Err(e) = self.broker.cancel_job(&self.job_id).await {
            warn!("Failed to flag job {} as cancelled on the broker: {:#}", self.job_id, e);
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = self.broker.pull_outcome(&self.job_id, Duration::ZERO).await? {
            if self.pending.remove(&outcome.task.task_id) {
                outcomes.push(outcome);
            }
        }
        self.pending.clear();
        Ok(outcomes)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn broker_error(e: anyhow::Error) -> CrawlError {
    CrawlError::Infrastructure(format!("{:#}", e))
}

/// Asset downloads of a distributed job, run by remote workers.
///
/// Each download becomes an asset task on the broker. Concurrent downloads
/// take turns pulling the job's asset outcomes and hand each one to the
/// download that waits for it. Workers apply the retry policy themselves.
pub struct BrokerAssetFetcher {
    broker: Arc<dyn TaskBroker>,

    job_id: String,

    cancel: CancellationToken,

    poll: Duration,

    /// Task ids of downloads still waiting
    waiting: StdMutex<HashSet<String>>,

    /// Outcomes pulled on behalf of another download
    arrived: StdMutex<HashMap<String, AssetOutcome>>,

    /// Held by the download currently pulling outcomes
    puller: Mutex<()>,
}

impl BrokerAssetFetcher {
    pub fn new(broker: Arc<dyn TaskBroker>, job_id: &str, cancel: CancellationToken, poll: Duration) -> Self {
        Self {
            broker,
            job_id: job_id.to_string(),
            cancel,
            poll,
            waiting: StdMutex::new(HashSet::new()),
            arrived: StdMutex::new(HashMap::new()),
            puller: Mutex::new(()),
        }
    }

    async fn await_outcome(&self, task_id: &str) -> Result<AssetOutcome, CrawlError> {
        loop {
            if let Some(outcome) = lock(&self.arrived).remove(task_id) {
                return Ok(outcome);
            }

            let _turn = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CrawlError::Cancelled),
                turn = self.puller.lock() => turn,
            };

            // The previous puller may have fetched ours
            if let Some(outcome) = lock(&self.arrived).remove(task_id) {
                return Ok(outcome);
            }

            let reclaimed = self.broker.reclaim_expired().await.map_err(broker_error)?;
            if reclaimed > 0 {
                debug!("Reclaimed {} expired task leases", reclaimed);
            }

            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CrawlError::Cancelled),
                pulled = self.broker.pull_asset_outcome(&self.job_id, self.poll) => pulled.map_err(broker_error)?,
            };

            if let Some(outcome) = pulled {
                if lock(&self.waiting).contains(&outcome.task.task_id) {
                    lock(&self.arrived).insert(outcome.task.task_id.clone(), outcome);
                } else {
                    debug!("Ignoring duplicate asset outcome for {}", outcome.task.url);
                }
            }
        }
    }
}

#[async_trait]
impl PageFetcher for BrokerAssetFetcher {
    async fn fetch_page(&self, request: &FetchRequest) -> Result<FetchedPage, CrawlError> {
        Err(CrawlError::Infrastructure(format!(
            "page {} must be dispatched as a crawl task, not fetched as an asset",
            request.url
        )))
    }

    async fn fetch_asset(&self, request: &FetchRequest) -> Result<FetchedAsset, CrawlError> {
        let task = CrawlTask::asset(&self.job_id, request.url.as_str(), request.profile.clone());
        let task_id = task.task_id.clone();

        lock(&self.waiting).insert(task_id.clone());
        let outcome = match self.broker.push_task(&task).await {
            Ok(()) => self.await_outcome(&task_id).await,
            Err(e) => Err(broker_error(e)),
        };
        lock(&self.waiting).remove(&task_id);

        let outcome = outcome?;
        debug!("Asset {} downloaded by {} in {} attempts", outcome.task.url, outcome.worker, outcome.attempts);
        outcome.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::frontier::FrontierEntry;
    use crate::crawler::task::TaskKind;
    use crate::storage::MemoryBroker;
    use crate::testing::FakeFetcher;

    fn task(url: &str) -> CrawlTask {
        let entry = FrontierEntry {
            url: url.to_string(),
            canonical: url.to_string(),
            depth: 0,
            parent_url: None,
            dedup_key: url.to_string(),
        };
        CrawlTask::from_entry("job-1", &entry, None, Default::default())
    }

    fn retry() -> RetryPolicy {
        RetryPolicy { initial_backoff_ms: 1, jitter: 0.0, ..RetryPolicy::default() }
    }

    #[tokio::test]
    async fn test_local_dispatch_runs_tasks_concurrently() {
        let fetcher = FakeFetcher::new()
            .page("https://example.com/", "<html>root</html>")
            .page("https://example.com/a", "<html>a</html>")
            .failing("https://example.com/a", vec![CrawlError::Timeout(10)]);
        let mut dispatcher = LocalDispatcher::new(Arc::new(fetcher), retry(), CancellationToken::new(), "local");

        dispatcher.dispatch(task("https://example.com/")).await.unwrap();
        dispatcher.dispatch(task("https://example.com/a")).await.unwrap();
        assert_eq!(dispatcher.in_flight(), 2);

        let mut outcomes = Vec::new();
        while let Some(outcome) = dispatcher.next_outcome().await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.task.url.cmp(&b.task.url));

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(outcomes[1].attempts, 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[tokio::test]
    async fn test_broker_dispatch_ignores_duplicate_outcomes() {
        let broker = Arc::new(MemoryBroker::new());
        let mut dispatcher = BrokerDispatcher::new(broker.clone(), "job-1", CancellationToken::new(), Duration::from_millis(20));

        dispatcher.dispatch(task("https://example.com/")).await.unwrap();
        let pulled = broker.pull_task(Duration::from_secs(60)).await.unwrap().unwrap();

        let fetcher = FakeFetcher::new().page("https://example.com/", "<html></html>");
        let outcome = execute_task(&fetcher, pulled, &retry(), &CancellationToken::new(), "remote-1").await;
        broker.push_outcome(&outcome).await.unwrap();
        broker.push_outcome(&outcome).await.unwrap();

        let received = dispatcher.next_outcome().await.unwrap().unwrap();
        assert_eq!(received.worker, "remote-1");
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.next_outcome().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_asset_downloads_get_their_own_bytes() {
        let broker = Arc::new(MemoryBroker::new());
        let remote = Arc::new(BrokerAssetFetcher::new(broker.clone(), "job-1", CancellationToken::new(), Duration::from_millis(20)));

        let download = |url: &str| {
            let remote = remote.clone();
            let request = FetchRequest::new(Url::parse(url).unwrap(), "job-1", Default::default());
            tokio::spawn(async move { remote.fetch_asset(&request).await })
        };
        let logo = download("https://example.com/logo.png");
        let style = download("https://example.com/site.css");

        let mut tasks = Vec::new();
        while tasks.len() < 2 {
            match broker.pull_task(Duration::from_secs(60)).await.unwrap() {
                Some(task) => tasks.push(task),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        assert!(tasks.iter().all(|task| task.kind == TaskKind::Asset));

        // Answer in reverse order, once twice
        let fetcher = FakeFetcher::new()
            .asset("https://example.com/logo.png", "image/png", b"png")
            .asset("https://example.com/site.css", "text/css", b"body{}");
        for task in tasks.into_iter().rev() {
            let outcome = execute_asset_task(&fetcher, task, &retry(), &CancellationToken::new(), "remote-1").await;
            broker.push_asset_outcome(&outcome).await.unwrap();
            broker.push_asset_outcome(&outcome).await.unwrap();
        }

        assert_eq!(logo.await.unwrap().unwrap().bytes, b"png".to_vec());
        assert_eq!(style.await.unwrap().unwrap().bytes, b"body{}".to_vec());
        assert_eq!(fetcher.asset_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_asset_download_stops_on_cancel() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let remote = BrokerAssetFetcher::new(broker.clone(), "job-1", cancel.clone(), Duration::from_millis(20));
        cancel.cancel();

        let request = FetchRequest::new(Url::parse("https://example.com/a.js").unwrap(), "job-1", Default::default());
        assert!(matches!(remote.fetch_asset(&request).await, Err(CrawlError::Cancelled)));
        assert_eq!(broker.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broker_drain_flags_job_cancelled() {
        let broker = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let mut dispatcher = BrokerDispatcher::new(broker.clone(), "job-1", cancel.clone(), Duration::from_millis(20));

        dispatcher.dispatch(task("https://example.com/")).await.unwrap();
        cancel.cancel();

        assert!(dispatcher.next_outcome().await.unwrap().is_none());
        assert!(dispatcher.drain().await.unwrap().is_empty());
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(broker.is_cancelled("job-1").await.unwrap());
    }
}
