use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::cache::{CacheEntry, CacheKey, ContentCache, UrlRecord};

/// In-process cache for tests and single-run jobs
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    urls: RwLock<HashMap<String, UrlRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn get(&self, key: CacheKey<'_>) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let hash = match key {
            CacheKey::Hash(hash) => hash.to_string(),
            CacheKey::Url(url) => match self.get_url(url).await? {
                Some(record) => record.content_hash,
                None => return Ok(None),
            },
        };

        let entries = self.entries.read().await;
        Ok(entries.get(&hash).filter(|entry| !entry.is_expired(now)).cloned())
    }

    async fn put(&self, hash: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()> {
        let entry = CacheEntry {
            hash: hash.to_string(),
            payload: payload.to_vec(),
            inserted_at: Utc::now(),
            ttl_secs: ttl.map(|t| t.as_secs()),
        };
        self.entries.write().await.insert(hash.to_string(), entry);
        Ok(())
    }

    async fn get_url(&self, url: &str) -> Result<Option<UrlRecord>> {
        let now = Utc::now();
        let urls = self.urls.read().await;
        Ok(urls.get(url).filter(|record| !record.is_expired(now)).cloned())
    }

    async fn put_url(&self, record: UrlRecord) -> Result<()> {
        self.urls.write().await.insert(record.url.clone(), record);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let mut removed = before - entries.len();

        let mut urls = self.urls.write().await;
        let before = urls.len();
        urls.retain(|_, record| !record.is_expired(now));
        removed += before - urls.len();

        Ok(removed)
    }
}
