//! Manifest generation
//!
//! A manifest source enumerates the full entry set for a run. Three variants
//! exist, each selected explicitly through [`ManifestSourceConfig`]:
//!
//! - [`DirectoryCrawler`]: walks a directory tree, optionally filtering files
//!   by a modification-time lower bound
//! - [`ManifestFileReader`]: reads a static list of paths from a file
//! - [`BucketLister`]: lists the keys of an object-storage bucket
//!
//! The rest of the system depends only on [`ManifestSource::produce`].

mod bucket;
mod crawler;
mod listing;
mod types;

pub use bucket::{BucketLister, ObjectLister, ObjectSummary};
pub use crawler::DirectoryCrawler;
pub use listing::ManifestFileReader;
pub use types::{ItemMode, Manifest, ManifestEntry, ManifestStats, WorkItem};

use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ConfigError, GenerationError};

/// Produces the complete entry list for a run
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    /// Short name for logging
    fn describe(&self) -> String;

    /// Enumerate every entry
    async fn produce(&self) -> Result<Vec<ManifestEntry>, GenerationError>;
}

/// Explicit selection of a manifest source variant
#[derive(Debug, Clone)]
pub enum ManifestSourceConfig {
    /// Crawl a directory tree
    Crawl {
        root: PathBuf,
        modified_after: Option<DateTime<Utc>>,
        exclude: Vec<Regex>,
    },
    /// Read a manifest file of paths under `root`
    ManifestFile { root: PathBuf, manifest: PathBuf },
    /// List an object-storage bucket
    Bucket { bucket: String },
}

impl ManifestSourceConfig {
    /// Source root on the local filesystem, if the variant has one
    pub fn source_root(&self) -> Option<&PathBuf> {
        match self {
            ManifestSourceConfig::Crawl { root, .. } => Some(root),
            ManifestSourceConfig::ManifestFile { root, .. } => Some(root),
            ManifestSourceConfig::Bucket { .. } => None,
        }
    }

    /// Build the configured source
    ///
    /// The bucket variant needs a storage client handle supplied by the caller.
    pub fn build(&self, lister: Option<Arc<dyn ObjectLister>>) -> Result<Arc<dyn ManifestSource>, ConfigError> {
        match self {
            ManifestSourceConfig::Crawl {
                root,
                modified_after,
                exclude,
            } => Ok(Arc::new(
                DirectoryCrawler::new(root.clone())
                    .modified_after(*modified_after)
                    .exclude(exclude.clone()),
            )),
            ManifestSourceConfig::ManifestFile { root, manifest } => {
                Ok(Arc::new(ManifestFileReader::new(root.clone(), manifest.clone())))
            }
            ManifestSourceConfig::Bucket { bucket } => {
                let client = lister.ok_or_else(|| {
                    ConfigError::InvalidManifestSource(format!(
                        "bucket source '{}' requires an object storage client",
                        bucket
                    ))
                })?;
                Ok(Arc::new(BucketLister::new(bucket, client)))
            }
        }
    }
}
