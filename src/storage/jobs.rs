use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cli::config::JobStoreSettings;
use crate::crawler::job::CloneJob;
use crate::storage::mongo::MongoJobStore;
use crate::utils::write_atomic;

/// Persistence for clone jobs, so they survive restarts
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job
    async fn save(&self, job: &CloneJob) -> Result<()>;

    async fn load(&self, job_id: &str) -> Result<Option<CloneJob>>;

    /// All jobs, newest first
    async fn list(&self) -> Result<Vec<CloneJob>>;

    async fn delete(&self, job_id: &str) -> Result<()>;
}

/// Factory for creating a JobStore implementation
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create a job store based on the settings
    pub async fn create(settings: &JobStoreSettings) -> Result<Arc<dyn JobStore>> {
        match settings.backend.as_str() {
            "file" | "filesystem" => {
                let store = FileJobStore::open(&settings.path).await?;
                Ok(Arc::new(store))
            }
            "mongodb" => {
                let store = MongoJobStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryJobStore::default())),
            _ => anyhow::bail!("Unsupported job store backend: {}", settings.backend),
        }
    }
}

/// Job store kept in memory, for tests and one-shot runs
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, CloneJob>>,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &CloneJob) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<CloneJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CloneJob>> {
        let mut jobs: Vec<CloneJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        self.jobs.write().await.remove(job_id);
        Ok(())
    }
}

/// One JSON document per job in a directory
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .context(format!("Failed to create job directory: {}", dir.display()))?;
        debug!("Using job directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, job_id: &str) -> Result<PathBuf> {
        // Job ids are uuids; refuse anything that could escape the directory
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("Invalid job id: {}", job_id);
        }
        Ok(self.dir.join(format!("{}.json", job_id)))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &CloneJob) -> Result<()> {
        let path = self.path(&job.id)?;
        let json = serde_json::to_vec_pretty(job).context("Failed to serialize job")?;
        write_atomic(&path, &json).await
    }

    async fn load(&self, job_id: &str) -> Result<Option<CloneJob>> {
        let path = self.path(job_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("Failed to read job file: {}", path.display())),
        };

        let job = serde_json::from_slice(&bytes)
            .context(format!("Failed to parse job file: {}", path.display()))?;
        Ok(Some(job))
    }

    async fn list(&self) -> Result<Vec<CloneJob>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .context(format!("Failed to list job directory: {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match tokio::fs::read(&path).await.map(|bytes| serde_json::from_slice::<CloneJob>(&bytes)) {
                Ok(Ok(job)) => jobs.push(job),
                Ok(Err(e)) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
                Err(e) => warn!("Skipping job file {}: {}", path.display(), e),
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let path = self.path(job_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to delete job file: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::job::JobStatus;
    use crate::crawler::options::JobOptions;
    use url::Url;

    fn job() -> CloneJob {
        CloneJob::new(
            &Url::parse("https://example.com/").unwrap(),
            JobOptions::default(),
            "/tmp/out".to_string(),
        )
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job();

        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            store.save(&job).await.unwrap();
            job.transition(JobStatus::Crawling).unwrap();
            store.save(&job).await.unwrap();
        }

        let store = FileJobStore::open(dir.path()).await.unwrap();
        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Crawling);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&job.id).await.unwrap();
        assert!(store.load(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(store.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_lists_newest_first() {
        let store = MemoryJobStore::default();
        let first = job();
        let mut second = job();
        second.created_at = first.created_at + chrono::Duration::seconds(5);

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
