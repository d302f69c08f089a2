use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::assets::AssetRecord;
use crate::crawler::frontier::FrontierSnapshot;
use crate::crawler::options::JobOptions;
use crate::crawler::task::PageRecord;
use crate::error::{CrawlError, ErrorKind};
use crate::verify::VerificationReport;

/// Lifecycle of a clone job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Crawling,
    Downloading,
    Verifying,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Crawling) => true,
            (Crawling, Downloading | Paused | Failed) => true,
            (Downloading, Verifying | Paused | Failed) => true,
            (Verifying, Completed | Failed) => true,
            (Paused, Crawling) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Crawling => "crawling",
            JobStatus::Downloading => "downloading",
            JobStatus::Verifying => "verifying",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Progress counters of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    /// Pages present in the mirror (fetched or cached)
    pub pages_cloned: u32,

    /// Pages downloaded during this job
    pub pages_fetched: u32,

    /// Pages skipped because their content was unchanged
    pub pages_cached: u32,

    /// Pages recorded as failed after retries
    pub pages_failed: u32,

    /// Distinct assets in the mirror
    pub assets_captured: u32,

    /// Asset downloads performed
    pub assets_downloaded: u32,

    pub bytes_downloaded: u64,

    pub retries: u32,
}

/// Non-fatal error recorded on the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub url: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Persisted state needed to resume a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub frontier: FrontierSnapshot,

    /// Pages accepted so far
    pub pages: Vec<PageRecord>,

    /// Assets captured so far
    pub assets: Vec<AssetRecord>,

    /// Dedup keys of pages already rewritten into the mirror
    #[serde(default)]
    pub pages_written: Vec<String>,

    pub saved_at: Option<DateTime<Utc>>,
}

/// One crawl run and everything it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneJob {
    pub id: String,

    pub target_url: String,

    pub options: JobOptions,

    pub status: JobStatus,

    pub counters: JobCounters,

    pub errors: Vec<JobError>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub output_dir: String,

    /// Why the job failed, when it did
    pub failure: Option<String>,

    pub verification: Option<VerificationReport>,

    pub checkpoint: Option<Checkpoint>,
}

/// Job record handed to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub pages_cloned: u32,
    pub assets_captured: u32,
    pub errors: Vec<JobError>,
    pub verification: Option<VerificationReport>,
    pub output_dir: String,
}

impl CloneJob {
    pub fn new(target: &Url, options: JobOptions, output_dir: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_url: target.to_string(),
            options,
            status: JobStatus::Pending,
            counters: JobCounters::default(),
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_dir,
            failure: None,
            verification: None,
            checkpoint: None,
        }
    }

    /// Move along the state machine, stamping timestamps
    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }

        if next == JobStatus::Crawling && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }

        self.status = next;
        Ok(())
    }

    pub fn record_error(&mut self, url: Option<&str>, error: &CrawlError, attempts: u32) {
        self.errors.push(JobError {
            url: url.map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
            attempts,
            at: Utc::now(),
        });
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            url: self.target_url.clone(),
            status: self.status,
            pages_cloned: self.counters.pages_cloned,
            assets_captured: self.counters.assets_captured,
            errors: self.errors.clone(),
            verification: self.verification.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}
