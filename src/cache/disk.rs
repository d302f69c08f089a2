use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheKey, ContentCache, EntryMeta, UrlRecord};
use crate::utils::{short_hash, write_atomic};

/// Content-addressed cache on the local filesystem.
///
/// Layout under the root:
/// `objects/<ab>/<hash>.bin` payloads, `objects/<ab>/<hash>.json` metadata,
/// `urls/<key>.json` URL records.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["objects", "urls"] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .context(format!("Failed to create cache directory: {}", path.display()))?;
        }
        debug!("Opened disk cache at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_paths(&self, hash: &str) -> (PathBuf, PathBuf) {
        let shard = if hash.len() >= 2 { &hash[..2] } else { "00" };
        let dir = self.root.join("objects").join(shard);
        (dir.join(format!("{}.bin", hash)), dir.join(format!("{}.json", hash)))
    }

    fn url_path(&self, url: &str) -> PathBuf {
        self.root.join("urls").join(format!("{}.json", short_hash(url, 32)))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // A torn or foreign file is a miss, not an error
                    warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read cache file: {}", path.display())),
        }
    }

    async fn remove(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove cache file {}: {}", path.display(), e);
            }
        }
    }

    async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("Failed to list cache directory: {}", dir.display())),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().map_or(false, |ext| ext == "json") {
                    files.push(path);
                }
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl ContentCache for DiskCache {
    async fn get(&self, key: CacheKey<'_>) -> Result<Option<CacheEntry>> {
        let hash = match key {
            CacheKey::Hash(hash) => hash.to_string(),
            CacheKey::Url(url) => match self.get_url(url).await? {
                Some(record) => record.content_hash,
                None => return Ok(None),
            },
        };

        let (payload_path, meta_path) = self.object_paths(&hash);
        let meta: EntryMeta = match Self::read_json(&meta_path).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        if meta.is_expired(Utc::now()) {
            return Ok(None);
        }

        let payload = match tokio::fs::read(&payload_path).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("Failed to read cache payload: {}", payload_path.display())),
        };

        Ok(Some(CacheEntry {
            hash: meta.hash,
            payload,
            inserted_at: meta.inserted_at,
            ttl_secs: meta.ttl_secs,
        }))
    }

    async fn put(&self, hash: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()> {
        let (payload_path, meta_path) = self.object_paths(hash);
        let meta = EntryMeta {
            hash: hash.to_string(),
            size: payload.len() as u64,
            inserted_at: Utc::now(),
            ttl_secs: ttl.map(|t| t.as_secs()),
        };

        // Payload first so a visible meta file always has its bytes
        write_atomic(&payload_path, payload).await?;
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?).await?;
        Ok(())
    }

    async fn get_url(&self, url: &str) -> Result<Option<UrlRecord>> {
        let record: Option<UrlRecord> = Self::read_json(&self.url_path(url)).await?;
        Ok(record.filter(|r| r.url == url && !r.is_expired(Utc::now())))
    }

    async fn put_url(&self, record: UrlRecord) -> Result<()> {
        let path = self.url_path(&record.url);
        write_atomic(&path, &serde_json::to_vec_pretty(&record)?).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for meta_path in Self::json_files(&self.root.join("objects")).await? {
            if let Some(meta) = Self::read_json::<EntryMeta>(&meta_path).await? {
                if meta.is_expired(now) {
                    Self::remove(&meta_path.with_extension("bin")).await;
                    Self::remove(&meta_path).await;
                    removed += 1;
                }
            }
        }

        for url_path in Self::json_files(&self.root.join("urls")).await? {
            if let Some(record) = Self::read_json::<UrlRecord>(&url_path).await? {
                if record.is_expired(now) {
                    Self::remove(&url_path).await;
                    removed += 1;
                }
            }
        }

        debug!("Purged {} expired cache entries", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::content_hash;

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).await.unwrap();
        let body = b"<html><body>hi</body></html>";
        let hash = content_hash(body);

        cache.put(&hash, body, Some(Duration::from_secs(3600))).await.unwrap();
        cache.put_url(UrlRecord {
            url: "https://example.com/".to_string(),
            content_hash: hash.clone(),
            etag: Some("\"v1\"".to_string()),
            links: vec!["https://example.com/about".to_string()],
            assets: vec![],
            stored_at: Utc::now(),
            ttl_secs: None,
        }).await.unwrap();

        // Reopening sees the same data
        let cache = DiskCache::open(dir.path()).await.unwrap();
        let entry = cache.get(CacheKey::Url("https://example.com/")).await.unwrap().unwrap();
        assert_eq!(entry.payload, body);
        assert!(dir.path().join("objects").join(&hash[..2]).join(format!("{}.bin", hash)).exists());

        let record = cache.get_url("https://example.com/").await.unwrap().unwrap();
        assert_eq!(record.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_purge_removes_expired_objects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).await.unwrap();

        cache.put("aa11", b"old", Some(Duration::ZERO)).await.unwrap();
        cache.put("bb22", b"fresh", None).await.unwrap();

        assert!(cache.get(CacheKey::Hash("aa11")).await.unwrap().is_none());
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert!(!dir.path().join("objects/aa/aa11.bin").exists());
        assert!(cache.get(CacheKey::Hash("bb22")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).await.unwrap();
        cache.put("cc33", b"x", None).await.unwrap();
        tokio::fs::write(dir.path().join("objects/cc/cc33.json"), b"{not json").await.unwrap();

        assert!(cache.get(CacheKey::Hash("cc33")).await.unwrap().is_none());
    }
}
