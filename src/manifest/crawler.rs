//! Directory tree crawler
//!
//! Walks the source root with `walkdir`. Directories are always emitted as
//! containers; files are emitted when they pass the optional
//! modification-time lower bound. Exclude patterns match against the path
//! relative to the root and prune whole subtrees.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{ManifestEntry, ManifestSource};
use crate::error::GenerationError;

/// Filesystem-tree manifest source
#[derive(Debug, Clone)]
pub struct DirectoryCrawler {
    root: PathBuf,
    modified_after: Option<DateTime<Utc>>,
    exclude: Vec<Regex>,
}

impl DirectoryCrawler {
    /// Crawl everything under `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            modified_after: None,
            exclude: Vec::new(),
        }
    }

    /// Only include files modified strictly after this instant
    pub fn modified_after(mut self, bound: Option<DateTime<Utc>>) -> Self {
        self.modified_after = bound;
        self
    }

    /// Skip paths (and subtrees) matching any of these patterns
    pub fn exclude(mut self, patterns: Vec<Regex>) -> Self {
        self.exclude = patterns;
        self
    }

    fn is_excluded(&self, relative: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(relative))
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        format!("/{}", rel.to_string_lossy())
    }

    /// Blocking walk
    pub fn crawl(&self) -> Result<Vec<ManifestEntry>, GenerationError> {
        if !self.root.is_dir() {
            return Err(GenerationError::SourceUnreadable {
                path: self.root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_excluded(&self.relative(e.path())));

        for entry in walker {
            let entry = entry.map_err(|e| GenerationError::ScanFailed {
                path: e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| self.root.display().to_string()),
                reason: e.to_string(),
            })?;

            let relative = self.relative(entry.path());

            if entry.file_type().is_dir() {
                entries.push(ManifestEntry::container(relative));
                continue;
            }

            let metadata = entry.metadata().map_err(|e| GenerationError::ScanFailed {
                path: entry.path().display().to_string(),
                reason: e.to_string(),
            })?;

            if let Some(bound) = self.modified_after {
                let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);
                match modified {
                    Some(mtime) if mtime > bound => {}
                    _ => continue,
                }
            }

            entries.push(ManifestEntry::file(relative, metadata.len()));
        }

        Ok(entries)
    }
}

#[async_trait::async_trait]
impl ManifestSource for DirectoryCrawler {
    fn describe(&self) -> String {
        format!("directory crawl of {}", self.root.display())
    }

    async fn produce(&self) -> Result<Vec<ManifestEntry>, GenerationError> {
        let crawler = self.clone();
        tokio::task::spawn_blocking(move || crawler.crawl())
            .await
            .map_err(|e| GenerationError::Aborted(e.to_string()))?
    }
}
