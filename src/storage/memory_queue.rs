use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::crawler::task::{AssetOutcome, CrawlTask, TaskOutcome};
use crate::storage::queue::TaskBroker;

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<CrawlTask>,

    /// task id -> (task, lease deadline)
    leased: HashMap<String, (CrawlTask, Instant)>,

    outcomes: HashMap<String, VecDeque<TaskOutcome>>,

    asset_outcomes: HashMap<String, VecDeque<AssetOutcome>>,

    cancelled: HashSet<String>,
}

/// In-process broker with the same lease semantics as the Redis one
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    outcome_ready: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn leased_count(&self) -> usize {
        self.state.lock().await.leased.len()
    }

    /// Poll `take` until it yields or `wait` runs out
    async fn wait_for<T>(&self, wait: Duration, mut take: impl FnMut(&mut BrokerState) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.outcome_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = take(&mut *self.state.lock().await) {
                return Some(found);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn push_task(&self, task: &CrawlTask) -> Result<()> {
        self.state.lock().await.pending.push_back(task.clone());
        Ok(())
    }

    async fn pull_task(&self, lease: Duration) -> Result<Option<CrawlTask>> {
        let mut state = self.state.lock().await;
        let task = match state.pending.pop_front() {
            Some(task) => task,
            None => return Ok(None),
        };

        state.leased.insert(task.task_id.clone(), (task.clone(), Instant::now() + lease));
        debug!("Leased task {}", task.url);
        Ok(Some(task))
    }

    async fn ack_task(&self, task_id: &str) -> Result<()> {
        self.state.lock().await.leased.remove(task_id);
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<String> = state.leased.iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some((task, _)) = state.leased.remove(id) {
                state.pending.push_front(task);
            }
        }

        if !expired.is_empty() {
            info!("Redelivering {} tasks with expired leases", expired.len());
        }
        Ok(expired.len())
    }

    async fn push_outcome(&self, outcome: &TaskOutcome) -> Result<()> {
        self.state.lock().await
            .outcomes
            .entry(outcome.task.job_id.clone())
            .or_default()
            .push_back(outcome.clone());
        self.outcome_ready.notify_waiters();
        Ok(())
    }

    async fn pull_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<TaskOutcome>> {
        Ok(self.wait_for(wait, |state| state.outcomes.get_mut(job_id).and_then(VecDeque::pop_front)).await)
    }

    async fn push_asset_outcome(&self, outcome: &AssetOutcome) -> Result<()> {
        self.state.lock().await
            .asset_outcomes
            .entry(outcome.task.job_id.clone())
            .or_default()
            .push_back(outcome.clone());
        self.outcome_ready.notify_waiters();
        Ok(())
    }

    async fn pull_asset_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<AssetOutcome>> {
        Ok(self.wait_for(wait, |state| state.asset_outcomes.get_mut(job_id).and_then(VecDeque::pop_front)).await)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cancelled.insert(job_id.to_string());
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        Ok(self.state.lock().await.cancelled.contains(job_id))
    }

    async fn clear_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.outcomes.remove(job_id);
        state.asset_outcomes.remove(job_id);
        state.cancelled.remove(job_id);
        state.pending.retain(|task| task.job_id != job_id);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }
}
