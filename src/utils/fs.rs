use anyhow::{Context, Result};
use std::path::Path;
use uuid::Uuid;

/// Write a file through a temporary sibling and rename it into place.
///
/// Concurrent writers of the same path never leave a torn file behind; the
/// last rename wins.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(format!("Failed to create directory: {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, bytes)
        .await
        .context(format!("Failed to write temporary file: {}", tmp.display()))?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).context(format!("Failed to move file into place: {}", path.display()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");

        write_atomic(&path, b"hello").await.unwrap();
        write_atomic(&path, b"world").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"world");
        let leftovers = std::fs::read_dir(dir.path().join("a/b")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_write_atomic_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");

        tokio_test::block_on(async {
            tokio_test::assert_ok!(write_atomic(&path, b"<p>old</p>").await);
            tokio_test::assert_ok!(write_atomic(&path, b"<p>new</p>").await);
        });

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<p>new</p>");
    }
}
