use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::MultiplexedConnection, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cli::config::QueueSettings;
use crate::crawler::task::{AssetOutcome, CrawlTask, TaskOutcome};

/// Work queue between the orchestrator and remote workers.
///
/// Delivery is at-least-once: a leased task that is not acknowledged before
/// its lease runs out goes back to the queue.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn push_task(&self, task: &CrawlTask) -> Result<()>;

    /// Lease the next task, if any
    async fn pull_task(&self, lease: Duration) -> Result<Option<CrawlTask>>;

    async fn ack_task(&self, task_id: &str) -> Result<()>;

    /// Return expired leases to the queue, returning how many were redelivered
    async fn reclaim_expired(&self) -> Result<usize>;

    async fn push_outcome(&self, outcome: &TaskOutcome) -> Result<()>;

    /// Wait up to `wait` for the next outcome of a job
    async fn pull_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<TaskOutcome>>;

    /// Outcomes of asset tasks travel apart from page outcomes
    async fn push_asset_outcome(&self, outcome: &AssetOutcome) -> Result<()>;

    async fn pull_asset_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<AssetOutcome>>;

    /// Flag a job so workers drop its remaining tasks
    async fn cancel_job(&self, job_id: &str) -> Result<()>;

    async fn is_cancelled(&self, job_id: &str) -> Result<bool>;

    /// Remove per-job state once a job is finished
    async fn clear_job(&self, job_id: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;
}

/// Pop a task and lease it atomically
const LEASE_SCRIPT: &str = r#"
local task = redis.call('RPOP', KEYS[1])
if not task then
  return false
end
local id = cjson.decode(task)['task_id']
redis.call('HSET', KEYS[2], id, task)
redis.call('ZADD', KEYS[3], ARGV[1], id)
return task
"#;

/// Move tasks with expired leases back to the consuming end of the queue
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  local task = redis.call('HGET', KEYS[2], id)
  if task then
    redis.call('RPUSH', KEYS[1], task)
  end
  redis.call('HDEL', KEYS[2], id)
  redis.call('ZREM', KEYS[3], id)
end
return #expired
"#;

/// Redis-backed broker
pub struct RedisBroker {
    /// Key prefix shared by orchestrator and workers
    prefix: String,

    /// Lifetime of per-job keys in seconds
    job_ttl: u64,

    /// Shared connection for non-blocking commands
    conn: Mutex<MultiplexedConnection>,

    /// Separate connection for blocking pops
    blocking: Mutex<MultiplexedConnection>,

    lease_script: Script,

    reclaim_script: Script,
}

impl RedisBroker {
    /// Connect to the broker
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;
        let blocking = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        info!("Connected to task broker at {}", config.redis_url);

        Ok(Self {
            prefix: config.key_prefix.clone(),
            job_ttl: config.task_ttl,
            conn: Mutex::new(conn),
            blocking: Mutex::new(blocking),
            lease_script: Script::new(LEASE_SCRIPT),
            reclaim_script: Script::new(RECLAIM_SCRIPT),
        })
    }

    fn pending_key(&self) -> String {
        format!("{}:queue:pending", self.prefix)
    }

    fn leased_key(&self) -> String {
        format!("{}:queue:leased", self.prefix)
    }

    fn leases_key(&self) -> String {
        format!("{}:queue:leases", self.prefix)
    }

    fn outcomes_key(&self, job_id: &str) -> String {
        format!("{}:outcomes:{}", self.prefix, job_id)
    }

    fn asset_outcomes_key(&self, job_id: &str) -> String {
        format!("{}:asset-outcomes:{}", self.prefix, job_id)
    }

    fn cancelled_key(&self) -> String {
        format!("{}:cancelled", self.prefix)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn push_task(&self, task: &CrawlTask) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("LPUSH")
            .arg(self.pending_key())
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task to Redis queue")?;

        debug!("Pushed task to queue: {}", task.url);
        Ok(())
    }

    async fn pull_task(&self, lease: Duration) -> Result<Option<CrawlTask>> {
        let deadline = Self::now_ms() + lease.as_millis() as i64;

        let mut conn = self.conn.lock().await;
        let task_json: Option<String> = self.lease_script
            .key(self.pending_key())
            .key(self.leased_key())
            .key(self.leases_key())
            .arg(deadline)
            .invoke_async(&mut *conn)
            .await
            .context("Failed to lease task from Redis queue")?;

        match task_json {
            Some(task_json) => {
                let task: CrawlTask = serde_json::from_str(&task_json)
                    .context("Failed to deserialize task")?;
                debug!("Leased task from queue: {}", task.url);
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn ack_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::pipe()
            .atomic()
            .cmd("HDEL").arg(self.leased_key()).arg(task_id).ignore()
            .cmd("ZREM").arg(self.leases_key()).arg(task_id).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to acknowledge task")?;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let reclaimed: usize = self.reclaim_script
            .key(self.pending_key())
            .key(self.leased_key())
            .key(self.leases_key())
            .arg(Self::now_ms())
            .invoke_async(&mut *conn)
            .await
            .context("Failed to reclaim expired leases")?;

        if reclaimed > 0 {
            info!("Redelivering {} tasks with expired leases", reclaimed);
        }
        Ok(reclaimed)
    }

    async fn push_outcome(&self, outcome: &TaskOutcome) -> Result<()> {
        let outcome_json = serde_json::to_string(outcome)
            .context("Failed to serialize task outcome")?;
        let key = self.outcomes_key(&outcome.task.job_id);

        let mut conn = self.conn.lock().await;
        redis::pipe()
            .cmd("LPUSH").arg(&key).arg(&outcome_json).ignore()
            .cmd("EXPIRE").arg(&key).arg(self.job_ttl).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task outcome")?;
        Ok(())
    }

    async fn pull_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<TaskOutcome>> {
        let key = self.outcomes_key(job_id);

        let mut conn = self.blocking.lock().await;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&key)
            .arg(wait.as_secs_f64().max(0.01))
            .query_async(&mut *conn)
            .await
            .context("Failed to pop task outcome")?;

        match popped {
            Some((_, outcome_json)) => {
                let outcome = serde_json::from_str(&outcome_json)
                    .context("Failed to deserialize task outcome")?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    async fn push_asset_outcome(&self, outcome: &AssetOutcome) -> Result<()> {
        let outcome_json = serde_json::to_string(outcome)
            .context("Failed to serialize asset outcome")?;
        let key = self.asset_outcomes_key(&outcome.task.job_id);

        let mut conn = self.conn.lock().await;
        redis::pipe()
            .cmd("LPUSH").arg(&key).arg(&outcome_json).ignore()
            .cmd("EXPIRE").arg(&key).arg(self.job_ttl).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push asset outcome")?;
        Ok(())
    }

    async fn pull_asset_outcome(&self, job_id: &str, wait: Duration) -> Result<Option<AssetOutcome>> {
        let key = self.asset_outcomes_key(job_id);

        let mut conn = self.blocking.lock().await;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&key)
            .arg(wait.as_secs_f64().max(0.01))
            .query_async(&mut *conn)
            .await
            .context("Failed to pop asset outcome")?;

        match popped {
            Some((_, outcome_json)) => {
                let outcome = serde_json::from_str(&outcome_json)
                    .context("Failed to deserialize asset outcome")?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SADD")
            .arg(self.cancelled_key())
            .arg(job_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to flag job as cancelled")?;
        info!("Flagged job {} as cancelled on the broker", job_id);
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let cancelled: bool = redis::cmd("SISMEMBER")
            .arg(self.cancelled_key())
            .arg(job_id)
            .query_async(&mut *conn)
            .await
            .context("Failed to query cancelled jobs")?;
        Ok(cancelled)
    }

    async fn clear_job(&self, job_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::pipe()
            .cmd("DEL").arg(self.outcomes_key(job_id)).ignore()
            .cmd("DEL").arg(self.asset_outcomes_key(job_id)).ignore()
            .cmd("SREM").arg(self.cancelled_key()).arg(job_id).ignore()
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to clear job state")?;
        debug!("Cleared broker state for job: {}", job_id);
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let count: usize = redis::cmd("LLEN")
            .arg(self.pending_key())
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;
        Ok(count)
    }
}
