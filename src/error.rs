use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single fetch, download or scoring step.
///
/// These are values, not control flow: the orchestrator matches on
/// [`CrawlError::kind`] to decide between retry, skip and job failure.
/// The type is serializable so remote workers can report it through the broker.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CrawlError {
    /// DNS or connection failure
    #[error("network error: {0}")]
    Network(String),

    /// Operation exceeded its deadline
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Target asked us to slow down (HTTP 429 / 503)
    #[error("rate limited with HTTP {status}")]
    RateLimited {
        status: u16,
        retry_after_ms: Option<u64>,
    },

    /// Any other non-success HTTP status
    #[error("unexpected HTTP status {0}")]
    Http(u16),

    /// Anti-bot defense could not be bypassed
    #[error("blocked: {0}")]
    Blocked(String),

    /// Malformed or unsupported content
    #[error("parse error: {0}")]
    Parse(String),

    /// Post-capture scoring could not complete
    #[error("verification error: {0}")]
    Verification(String),

    /// Local resource failure (disk, store, broker)
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Job cancellation observed at a safe point
    #[error("cancelled")]
    Cancelled,
}

/// Coarse classification used by the retry policy and the job error list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    Http,
    Blocked,
    Parse,
    Verification,
    Infrastructure,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Http => "http",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Parse => "parse",
            ErrorKind::Verification => "verification",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Network(_) => ErrorKind::Network,
            CrawlError::Timeout(_) => ErrorKind::Timeout,
            CrawlError::RateLimited { .. } => ErrorKind::RateLimited,
            CrawlError::Http(_) => ErrorKind::Http,
            CrawlError::Blocked(_) => ErrorKind::Blocked,
            CrawlError::Parse(_) => ErrorKind::Parse,
            CrawlError::Verification(_) => ErrorKind::Verification,
            CrawlError::Infrastructure(_) => ErrorKind::Infrastructure,
            CrawlError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Network failures, timeouts, rate limiting and server-side 5xx are
    /// retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Network(_) | CrawlError::Timeout(_) | CrawlError::RateLimited { .. } => true,
            CrawlError::Http(status) => *status >= 500,
            _ => false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        CrawlError::Timeout(after.as_millis() as u64)
    }

    /// Server-requested delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CrawlError::RateLimited { retry_after_ms: Some(ms), .. } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CrawlError::Timeout(0)
        } else if let Some(status) = err.status() {
            CrawlError::Http(status.as_u16())
        } else if err.is_decode() || err.is_body() {
            CrawlError::Parse(err.to_string())
        } else {
            CrawlError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::Infrastructure(err.to_string())
    }
}
