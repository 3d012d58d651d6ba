use crate::config::StartupConfig;
use crate::repository::CommentRepository;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

/// Prepare on-disk and stored state before serving.
///
/// The upload root is created when missing. With `reset_on_startup` the
/// upload root is emptied and every comment record removed first.
pub async fn prepare(
    config: &StartupConfig,
    upload_root: &Path,
    comments: &dyn CommentRepository,
) -> Result<()> {
    if config.reset_on_startup {
        warn!(upload_root = %upload_root.display(), "Resetting uploads and comments");

        match tokio::fs::remove_dir_all(upload_root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to clear upload root {}", upload_root.display())
                })
            }
        }

        let removed = comments
            .delete_all()
            .await
            .context("Failed to delete comments")?;
        info!(removed = removed, "Comment records removed");
    }

    tokio::fs::create_dir_all(upload_root)
        .await
        .with_context(|| format!("Failed to create upload root {}", upload_root.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockCommentRepository;

    #[tokio::test]
    async fn test_prepare_creates_missing_root_without_reset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("upload-dir");
        let mut comments = MockCommentRepository::new();
        comments.expect_delete_all().never();

        prepare(&StartupConfig::default(), &root, &comments)
            .await
            .unwrap();

        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_prepare_keeps_existing_files_without_reset() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("alpha.jpg"), b"alpha").await.unwrap();
        let comments = MockCommentRepository::new();

        prepare(&StartupConfig::default(), dir.path(), &comments)
            .await
            .unwrap();

        assert!(dir.path().join("alpha.jpg").exists());
    }

    #[tokio::test]
    async fn test_reset_wipes_uploads_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("upload-dir");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("alpha.jpg"), b"alpha").await.unwrap();

        let mut comments = MockCommentRepository::new();
        comments.expect_delete_all().times(1).returning(|| Ok(3));

        prepare(
            &StartupConfig {
                reset_on_startup: true,
            },
            &root,
            &comments,
        )
        .await
        .unwrap();

        assert!(root.is_dir());
        assert!(!root.join("alpha.jpg").exists());
    }
}
