//! Catalog persistence and atomic artifact writes for the metric master data set.

mod catalog;
mod error;
mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use catalog::{
    BulkReplace, CatalogStore, CatalogTable, StoreConfig, VersionRecord, DEFAULT_SNAPSHOT_RETENTION,
};
pub use error::{ArtifactError, StoreError};

pub const CRATE_NAME: &str = "mmd-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
///
/// Missing parent directories are created. An existing file at `path` is
/// replaced; readers see either the old or the new content, never a partial file.
pub async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<WrittenArtifact, ArtifactError> {
    stage_artifact(path, bytes).await?.publish().await
}

/// Content fully written and synced next to its target, not yet visible there.
#[derive(Debug)]
pub struct StagedArtifact {
    target: PathBuf,
    temp_path: PathBuf,
    content_hash: String,
    byte_size: usize,
}

impl StagedArtifact {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the staged file onto its target.
    pub async fn publish(self) -> Result<WrittenArtifact, ArtifactError> {
        if let Err(source) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(ArtifactError {
                action: "renaming temp file onto",
                path: self.target,
                source,
            });
        }
        Ok(WrittenArtifact {
            path: self.target,
            content_hash: self.content_hash,
            byte_size: self.byte_size,
        })
    }

    /// Drop the staged file; the target is left as it was.
    pub async fn discard(self) {
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

/// First half of `write_artifact`: create directories and write the temp file.
pub async fn stage_artifact(path: &Path, bytes: &[u8]) -> Result<StagedArtifact, ArtifactError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| ArtifactError {
            action: "creating directory",
            path: parent.clone(),
            source,
        })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    if let Err(err) = write_temp(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    Ok(StagedArtifact {
        target: path.to_path_buf(),
        temp_path,
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

async fn write_temp(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let err = |action: &'static str| {
        move |source| ArtifactError {
            action,
            path: path.to_path_buf(),
            source,
        }
    };
    let mut file = fs::File::create(path).await.map_err(err("creating temp file"))?;
    file.write_all(bytes).await.map_err(err("writing temp file"))?;
    file.sync_all().await.map_err(err("syncing temp file"))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only timeouts are worth another attempt; key and constraint failures repeat identically.
pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Sleep before retry number `retry` (0-based): `base_delay * 2^retry`, never above `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn artifact_write_creates_directories_and_replaces_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("public").join("data").join("metric-synonyms.json");

        let first = write_artifact(&path, b"[1]").await.expect("first write");
        assert_eq!(first.byte_size, 3);
        assert_eq!(std::fs::read(&path).expect("read"), b"[1]");

        let second = write_artifact(&path, b"[1,2]").await.expect("second write");
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(std::fs::read(&path).expect("read"), b"[1,2]");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = StoreError::TransactionTimeout {
            operation: "commit",
            after: Duration::from_secs(1),
        };
        let duplicate = StoreError::DuplicateKey {
            entity: "metric",
            key: "1".into(),
        };
        assert_eq!(classify_store_error(&timeout), RetryDisposition::Retryable);
        assert_eq!(classify_store_error(&duplicate), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn discarded_stage_leaves_target_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("metric-synonyms.json");
        write_artifact(&path, b"[]").await.expect("seed");

        let staged = stage_artifact(&path, b"[1]").await.expect("stage");
        assert_eq!(staged.target(), path.as_path());
        assert_eq!(std::fs::read(&path).expect("read"), b"[]");
        staged.discard().await;

        assert_eq!(std::fs::read(&path).expect("read"), b"[]");
        assert_eq!(std::fs::read_dir(dir.path()).expect("list").count(), 1);
    }

    #[test]
    fn default_commit_backoff_doubles_from_a_quarter_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }
}
