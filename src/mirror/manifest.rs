use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assets::AssetRecord;
use crate::crawler::task::PageRecord;
use crate::utils::write_atomic;

/// Directory inside the mirror holding engine metadata
pub const MIRROR_META_DIR: &str = ".mirror";

/// What a finished clone holds, written next to the pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorManifest {
    pub job_id: String,

    pub target_url: String,

    pub generated_at: DateTime<Utc>,

    pub pages: Vec<PageRecord>,

    pub assets: Vec<AssetRecord>,
}

impl MirrorManifest {
    pub fn new(job_id: &str, target_url: &str, pages: Vec<PageRecord>, assets: Vec<AssetRecord>) -> Self {
        Self {
            job_id: job_id.to_string(),
            target_url: target_url.to_string(),
            generated_at: Utc::now(),
            pages,
            assets,
        }
    }

    pub fn path(output_dir: &Path) -> PathBuf {
        output_dir.join(MIRROR_META_DIR).join("manifest.json")
    }

    /// Manifest of a previous run, if the directory holds one
    pub async fn load(output_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(output_dir);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = tokio::fs::read(&path)
            .await
            .context(format!("Failed to read mirror manifest: {}", path.display()))?;

        let manifest = serde_json::from_slice(&content)
            .context(format!("Failed to parse mirror manifest: {}", path.display()))?;

        Ok(Some(manifest))
    }

    pub async fn save(&self, output_dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)
            .context("Failed to serialize mirror manifest")?;

        write_atomic(&Self::path(output_dir), &content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MirrorManifest::load(dir.path()).await.unwrap().is_none());

        let asset = AssetRecord {
            source_url: "https://example.com/a.png".to_string(),
            content_hash: "ab".repeat(32),
            stored_hash: "ab".repeat(32),
            byte_size: 10,
            local_path: "assets/images/abababababababab.png".to_string(),
            optimized: false,
            ref_count: 2,
            content_type: Some("image/png".to_string()),
            aliases: Vec::new(),
            references: Vec::new(),
        };
        let manifest = MirrorManifest::new("job-1", "https://example.com/", Vec::new(), vec![asset.clone()]);
        manifest.save(dir.path()).await.unwrap();

        let loaded = MirrorManifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert_eq!(loaded.assets, vec![asset]);
        assert!(dir.path().join(".mirror/manifest.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(&MirrorManifest::path(dir.path()), b"{not json").await.unwrap();
        assert!(MirrorManifest::load(dir.path()).await.is_err());
    }
}
