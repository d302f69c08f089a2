use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::browser::PageFetcher;
use crate::crawler::dispatch::{execute_asset_task, execute_task};
use crate::crawler::retry::RetryPolicy;
use crate::crawler::task::TaskKind;
use crate::storage::TaskBroker;

/// Delay between polls of an empty queue
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Remote fetch worker: pulls tasks from the broker and pushes back outcomes
pub struct Worker {
    broker: Arc<dyn TaskBroker>,

    fetcher: Arc<dyn PageFetcher>,

    retry: RetryPolicy,

    /// Lease taken on every pulled task
    lease: Duration,

    /// Name reported in outcomes
    id: String,

    /// Concurrent fetch loops
    concurrency: usize,
}

impl Worker {
    pub fn new(broker: Arc<dyn TaskBroker>, fetcher: Arc<dyn PageFetcher>, id: &str) -> Self {
        Self {
            broker,
            fetcher,
            retry: RetryPolicy::default(),
            lease: Duration::from_secs(120),
            id: id.to_string(),
            concurrency: 4,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process tasks until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Worker {} started with {} fetch loops", self.id, self.concurrency);

        let loops = (0..self.concurrency).map(|i| {
            let cancel = cancel.clone();
            async move {
                while !cancel.is_cancelled() {
                    match self.run_once(&cancel).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(IDLE_POLL) => {}
                            }
                        }
                        Err(e) => {
                            error!("Worker {} loop {} failed: {:#}", self.id, i, e);
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(IDLE_POLL) => {}
                            }
                        }
                    }
                }
            }
        });
        join_all(loops).await;

        info!("Worker {} stopped", self.id);
        Ok(())
    }

    /// Pull and handle a single task; `false` when the queue was empty
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<bool> {
        let task = match self.broker.pull_task(self.lease).await? {
            Some(task) => task,
            None => return Ok(false),
        };

        if self.broker.is_cancelled(&task.job_id).await? {
            debug!("Dropping task {} of cancelled job {}", task.url, task.job_id);
            self.broker.ack_task(&task.task_id).await?;
            return Ok(true);
        }

        debug!("Worker {} fetching {} {:?}", self.id, task.url, task.kind);
        let task_id = task.task_id.clone();
        match task.kind {
            TaskKind::Page => {
                let outcome = execute_task(self.fetcher.as_ref(), task, &self.retry, cancel, &self.id).await;
                // A shutdown mid-fetch leaves the lease to expire so another worker picks it up
                if cancel.is_cancelled() {
                    return Ok(true);
                }
                self.broker.push_outcome(&outcome).await?;
            }
            TaskKind::Asset => {
                let outcome = execute_asset_task(self.fetcher.as_ref(), task, &self.retry, cancel, &self.id).await;
                if cancel.is_cancelled() {
                    return Ok(true);
                }
                self.broker.push_asset_outcome(&outcome).await?;
            }
        }

        self.broker.ack_task(&task_id).await?;
        Ok(true)
    }
}
