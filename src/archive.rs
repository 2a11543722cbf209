//! Log archival
//!
//! At shutdown the orchestrator and every worker upload their log files to
//! `<bucket>/<folder_root>/<prefix>/`. [`LocalArchive`] writes that layout
//! under a base directory on a mounted filesystem.

use std::path::{Path, PathBuf};

use crate::error::ArchiveError;

/// Destination for log files at shutdown
#[async_trait::async_trait]
pub trait ArchivalStore: Send + Sync {
    /// Upload `files`; returns the number of files archived
    async fn upload(
        &self,
        bucket: &str,
        folder_root: &str,
        prefix: &str,
        files: &[PathBuf],
    ) -> Result<usize, ArchiveError>;
}

/// Archive that copies files into a local directory tree
#[derive(Debug, Clone)]
pub struct LocalArchive {
    base: PathBuf,
}

impl LocalArchive {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Directory a given upload lands in
    pub fn destination(&self, bucket: &str, folder_root: &str, prefix: &str) -> PathBuf {
        self.base.join(bucket).join(folder_root).join(prefix)
    }
}

#[async_trait::async_trait]
impl ArchivalStore for LocalArchive {
    async fn upload(
        &self,
        bucket: &str,
        folder_root: &str,
        prefix: &str,
        files: &[PathBuf],
    ) -> Result<usize, ArchiveError> {
        let destination = self.destination(bucket, folder_root, prefix);
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| ArchiveError::Destination {
                path: destination.clone(),
                reason: e.to_string(),
            })?;

        let mut archived = 0;
        for file in files {
            let Some(name) = file.file_name() else {
                tracing::warn!(path = %file.display(), "Skipping archive entry without a file name");
                continue;
            };
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                tracing::warn!(path = %file.display(), "Log file not found, not archived");
                continue;
            }

            let target = destination.join(name);
            tokio::fs::copy(file, &target)
                .await
                .map_err(|e| ArchiveError::UploadFailed {
                    path: file.clone(),
                    reason: e.to_string(),
                })?;
            archived += 1;
        }

        tracing::info!(
            destination = %destination.display(),
            archived,
            requested = files.len(),
            "Archived log files"
        );
        Ok(archived)
    }
}

/// Resolve bare log file names against a log directory
pub fn resolve_log_files(log_dir: &Path, names: &[String]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = Path::new(name);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                log_dir.join(path)
            }
        })
        .collect()
}
