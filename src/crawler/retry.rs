use std::future::Future;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CrawlError, ErrorKind};

/// Retry policy for fetches.
///
/// Transient failures back off exponentially with additive jitter; blocked
/// pages get a smaller cap; everything else fails on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for transient failures, including the first
    pub max_attempts: u32,

    /// Attempts for blocked pages, including the first
    pub blocked_max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub multiplier: f64,

    /// Extra random delay as a fraction of the backoff (0.25 = up to +25%)
    pub jitter: f64,

    /// Deadline of a single attempt
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            blocked_max_attempts: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
            attempt_timeout_ms: 60_000,
        }
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CrawlError>,

    /// Attempts made, including the last
    pub attempts: u32,

    /// Time spent sleeping between attempts
    pub waited: Duration,
}

impl RetryPolicy {
    /// Attempt cap for a failure kind
    pub fn attempts_for(&self, error: &CrawlError) -> u32 {
        match error.kind() {
            ErrorKind::Blocked => self.blocked_max_attempts.max(1),
            _ if error.is_transient() => self.max_attempts.max(1),
            _ => 1,
        }
    }

    /// Backoff before retry number `attempt` (1 = first retry), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    /// Delay before the next attempt, honouring a server-requested delay
    pub fn delay_for(&self, attempt: u32, error: &CrawlError) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = if self.jitter > 0.0 {
            let extra = base.as_millis() as f64 * self.jitter;
            Duration::from_millis(thread_rng().gen_range(0.0..=extra) as u64)
        } else {
            Duration::ZERO
        };

        let delay = base + jitter;
        match error.retry_after() {
            Some(requested) => delay.max(requested.min(Duration::from_millis(self.max_backoff_ms))),
            None => delay,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Policy for work a remote worker retries under `self`: a single
    /// attempt that may last the worker's whole budget plus one attempt of queueing
    pub fn remote(&self) -> Self {
        let attempts = self.max_attempts.max(self.blocked_max_attempts).max(1) as u64;
        let budget = self.attempt_timeout_ms
            .saturating_mul(attempts + 1)
            .saturating_add(self.max_backoff_ms.saturating_mul(attempts - 1));

        Self { max_attempts: 1, blocked_max_attempts: 1, attempt_timeout_ms: budget, ..self.clone() }
    }
}

/// Run `op` under the retry policy.
///
/// Every attempt is bounded by the per-attempt timeout; a timeout feeds back
/// into the policy as a transient failure. Cancellation is observed both
/// during attempts and during backoff sleeps.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CrawlError>>,
{
    let mut attempts = 0;
    let mut waited = Duration::ZERO;

    loop {
        attempts += 1;
        if cancel.is_cancelled() {
            return RetryOutcome { result: Err(CrawlError::Cancelled), attempts, waited };
        }

        let attempt_timeout = policy.attempt_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
            outcome = timeout(attempt_timeout, op(attempts)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(CrawlError::timeout(attempt_timeout)),
            },
        };

        let error = match result {
            Ok(value) => return RetryOutcome { result: Ok(value), attempts, waited },
            Err(CrawlError::Cancelled) => {
                return RetryOutcome { result: Err(CrawlError::Cancelled), attempts, waited };
            }
            Err(error) => error,
        };

        if attempts >= policy.attempts_for(&error) {
            if attempts > 1 {
                warn!("{} failed after {} attempts: {}", label, attempts, error);
            }
            return RetryOutcome { result: Err(error), attempts, waited };
        }

        let delay = policy.delay_for(attempts, &error);
        debug!("{} attempt {} failed ({}), retrying in {:?}", label, attempts, error, delay);

        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome { result: Err(CrawlError::Cancelled), attempts, waited };
            }
            _ = sleep(delay) => {}
        }
        waited += started.elapsed();
    }
}
