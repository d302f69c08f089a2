pub mod disk;
pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lookup key for the content cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// Canonical page URL, resolved through its URL record
    Url(&'a str),
    /// Content hash
    Hash(&'a str),
}

/// Content-addressed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: String,
    pub payload: Vec<u8>,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: Option<u64>,
}

/// Metadata kept next to a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub hash: String,
    pub size: u64,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: Option<u64>,
}

/// What was seen at a URL on the last fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// Canonical URL
    pub url: String,

    /// Hash of the page body
    pub content_hash: String,

    pub etag: Option<String>,

    /// In-scope links found on the page
    pub links: Vec<String>,

    /// Asset references found on the page
    pub assets: Vec<String>,

    pub stored_at: DateTime<Utc>,

    pub ttl_secs: Option<u64>,
}

pub(crate) fn is_expired(inserted_at: DateTime<Utc>, ttl_secs: Option<u64>, now: DateTime<Utc>) -> bool {
    match ttl_secs {
        Some(ttl) => (now - inserted_at).num_seconds() >= ttl as i64,
        None => false,
    }
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.inserted_at, self.ttl_secs, now)
    }
}

impl EntryMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.inserted_at, self.ttl_secs, now)
    }
}

impl UrlRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.stored_at, self.ttl_secs, now)
    }
}

/// Shared content cache.
///
/// Entries past their TTL are reported as misses. Concurrent writers of the
/// same hash store identical bytes, so the last write wins.
#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn get(&self, key: CacheKey<'_>) -> Result<Option<CacheEntry>>;

    async fn put(&self, hash: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()>;

    async fn get_url(&self, url: &str) -> Result<Option<UrlRecord>>;

    async fn put_url(&self, record: UrlRecord) -> Result<()>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

// Re-export common types
pub use disk::DiskCache;
pub use memory::MemoryCache;
