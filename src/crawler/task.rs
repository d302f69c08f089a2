use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::browser::{FetchProfile, FetchedAsset, FetchedPage};
use crate::bypass::BypassOutcome;
use crate::crawler::frontier::FrontierEntry;
use crate::error::CrawlError;

/// What a task fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Page,

    /// Raw bytes of a stylesheet, script, image or font
    Asset,
}

/// A page or asset fetch to be executed, locally or by a remote worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Unique identifier of this delivery unit
    pub task_id: String,

    #[serde(default)]
    pub kind: TaskKind,

    /// Unique identifier for the job this task belongs to
    pub job_id: String,

    /// URL to fetch
    pub url: String,

    /// Current depth in the crawl tree (0 for the root)
    pub depth: u32,

    /// Parent URL that led to this URL (None for the root)
    pub parent_url: Option<String>,

    /// Frontier dedup key, used to collapse redeliveries
    pub dedup_key: String,

    /// ETag of the cached copy, sent as a conditional request
    pub etag: Option<String>,

    /// Proxy, bypass and geolocation settings of the job
    #[serde(default)]
    pub profile: FetchProfile,
}

impl CrawlTask {
    pub fn from_entry(job_id: &str, entry: &FrontierEntry, etag: Option<String>, profile: FetchProfile) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            kind: TaskKind::Page,
            job_id: job_id.to_string(),
            url: entry.url.clone(),
            depth: entry.depth,
            parent_url: entry.parent_url.clone(),
            dedup_key: entry.dedup_key.clone(),
            etag,
            profile,
        }
    }

    /// Download of one asset; assets have no depth or frontier key
    pub fn asset(job_id: &str, url: &str, profile: FetchProfile) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            kind: TaskKind::Asset,
            job_id: job_id.to_string(),
            url: url.to_string(),
            depth: 0,
            parent_url: None,
            dedup_key: url.to_string(),
            etag: None,
            profile,
        }
    }
}

/// Result of a crawl task, as sent back by whoever executed it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: CrawlTask,

    /// Fetched page or the classified failure after retries
    pub result: Result<FetchedPage, CrawlError>,

    /// Attempts spent, including the successful one
    pub attempts: u32,

    /// Wall time across all attempts
    pub duration_ms: u64,

    /// Worker that executed the task
    pub worker: String,
}

/// Result of an asset task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetOutcome {
    pub task: CrawlTask,

    pub result: Result<FetchedAsset, CrawlError>,

    pub attempts: u32,

    pub duration_ms: u64,

    pub worker: String,
}

/// Accepted result of fetching one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// URL as requested
    pub url: String,

    /// URL after redirects
    pub final_url: String,

    /// Canonical form, also the mirror path source
    pub canonical: String,

    pub dedup_key: String,

    pub depth: u32,

    pub status: u16,

    /// Hash of the raw HTML, which lives in the content cache
    pub content_hash: String,

    /// In-scope page links found on the page
    pub links: Vec<String>,

    /// Asset references found on the page
    pub assets: Vec<String>,

    pub fetch_duration_ms: u64,

    /// Challenge handling, when a challenge was met
    pub bypass: Option<BypassOutcome>,

    /// Served from cache instead of re-processed
    pub cached: bool,

    /// Mirror path relative to the output directory
    pub local_path: String,

    /// Timestamp when the page was fetched
    pub fetched_at: DateTime<Utc>,
}
