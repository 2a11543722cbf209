//! Static manifest file reader
//!
//! Format: one path per line. A trailing `/` marks a container. Blank lines
//! and lines starting with `#` are skipped. Paths may be absolute under the
//! source root or relative to it; either way they are emitted relative to the
//! root. Leaf sizes are taken from the source when the file is present there.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use super::{ManifestEntry, ManifestSource};
use crate::error::GenerationError;

/// Manifest source backed by a list file
#[derive(Debug, Clone)]
pub struct ManifestFileReader {
    root: PathBuf,
    manifest: PathBuf,
}

impl ManifestFileReader {
    pub fn new(root: PathBuf, manifest: PathBuf) -> Self {
        Self { root, manifest }
    }

    fn parse_line(&self, line: &str) -> Option<ManifestEntry> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let is_container = line.ends_with('/');
        let root = self.root.to_string_lossy();
        let relative = line
            .strip_prefix(root.trim_end_matches('/'))
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(line);

        if is_container {
            return Some(ManifestEntry::container(relative));
        }

        let size = std::fs::metadata(self.root.join(relative.trim_start_matches('/')))
            .map(|m| m.len())
            .unwrap_or(0);
        Some(ManifestEntry::file(relative, size))
    }

    /// Blocking read
    pub fn read(&self) -> Result<Vec<ManifestEntry>, GenerationError> {
        if !self.root.is_dir() {
            return Err(GenerationError::SourceUnreadable {
                path: self.root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let unreadable = |e: std::io::Error| GenerationError::ManifestUnreadable {
            path: self.manifest.display().to_string(),
            reason: e.to_string(),
        };

        let reader = BufReader::new(File::open(&self.manifest).map_err(unreadable)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(unreadable)?;
            if let Some(entry) = self.parse_line(&line) {
                entries.push(entry);
            }
        }

        tracing::debug!(
            manifest = %self.manifest.display(),
            entries = entries.len(),
            "Read manifest file"
        );
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl ManifestSource for ManifestFileReader {
    fn describe(&self) -> String {
        format!("manifest file {}", self.manifest.display())
    }

    async fn produce(&self) -> Result<Vec<ManifestEntry>, GenerationError> {
        let reader = self.clone();
        tokio::task::spawn_blocking(move || reader.read())
            .await
            .map_err(|e| GenerationError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_reads_entries_and_skips_comments() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("src");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("docs/readme.md"), b"hello").unwrap();

        let manifest = dir.path().join("manifest.txt");
        fs::write(
            &manifest,
            format!(
                "# generated\n\n/docs/\n/docs/readme.md\n{}/docs/absent.bin\n",
                root.display()
            ),
        )
        .unwrap();

        let entries = ManifestFileReader::new(root, manifest).read().unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0], ManifestEntry::container("/docs"));
        assert_eq!(entries[1].path, "/docs/readme.md");
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[2].path, "/docs/absent.bin");
        assert_eq!(entries[2].size, 0);
    }

    #[test]
    fn test_missing_manifest_is_error() {
        let dir = tempdir().unwrap();
        let result = ManifestFileReader::new(dir.path().to_path_buf(), dir.path().join("none.txt")).read();
        assert!(matches!(result, Err(GenerationError::ManifestUnreadable { .. })));
    }
}
