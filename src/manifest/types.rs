//! Manifest and work item types
//!
//! A [`Manifest`] is the complete set of entries to replicate in one run. It is
//! produced once and then shared read-only: the WRITE and VALIDATE phases both
//! dispatch work items built from the same manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Which phase a work item is executed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemMode {
    /// Copy source to target
    Write,
    /// Verify target against source
    Validate,
}

impl fmt::Display for ItemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemMode::Write => write!(f, "WRITE"),
            ItemMode::Validate => write!(f, "VALIDATE"),
        }
    }
}

/// One enumerated source entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the source root, always starting with '/'
    pub path: String,
    /// Directory (true) or leaf file (false)
    pub is_container: bool,
    /// Size in bytes as seen at enumeration time (0 for containers or when unknown)
    pub size: u64,
}

impl ManifestEntry {
    /// Create a leaf entry
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: normalize(path.into()),
            is_container: false,
            size,
        }
    }

    /// Create a container entry
    pub fn container(path: impl Into<String>) -> Self {
        Self {
            path: normalize(path.into()),
            is_container: true,
            size: 0,
        }
    }
}

/// Leading slash, no duplicate or trailing slashes
fn normalize(path: String) -> String {
    let joined = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// One unit of replication pushed onto the work queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity of the item
    pub path: String,
    /// Directory (true) or leaf file (false)
    pub is_container: bool,
    /// Enumerated size in bytes
    pub size: u64,
    /// Phase this item belongs to
    pub mode: ItemMode,
}

impl WorkItem {
    /// Build a work item for `entry` under `mode`
    pub fn from_entry(entry: &ManifestEntry, mode: ItemMode) -> Self {
        Self {
            path: entry.path.clone(),
            is_container: entry.is_container,
            size: entry.size,
            mode,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Aggregate statistics about a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStats {
    /// Number of leaf entries
    pub file_count: u64,
    /// Number of container entries
    pub container_count: u64,
    /// Total enumerated bytes
    pub total_bytes: u64,
}

impl ManifestStats {
    /// Add an entry to the stats
    pub fn add_entry(&mut self, entry: &ManifestEntry) {
        if entry.is_container {
            self.container_count += 1;
        } else {
            self.file_count += 1;
            self.total_bytes += entry.size;
        }
    }

    /// Total number of entries
    pub fn total_entries(&self) -> u64 {
        self.file_count + self.container_count
    }
}

/// Immutable, cheaply clonable set of entries for a run
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Arc<[ManifestEntry]>,
    stats: ManifestStats,
    generated_at: DateTime<Utc>,
}

impl Manifest {
    /// Build a manifest; duplicate paths keep their first occurrence
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        let mut seen = HashSet::with_capacity(entries.len());
        let mut stats = ManifestStats::default();
        let mut unique = Vec::with_capacity(entries.len());

        for entry in entries {
            if seen.insert(entry.path.clone()) {
                stats.add_entry(&entry);
                unique.push(entry);
            }
        }

        Self {
            entries: unique.into(),
            stats,
            generated_at: Utc::now(),
        }
    }

    /// Entries in enumeration order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statistics
    pub fn stats(&self) -> &ManifestStats {
        &self.stats
    }

    /// When the manifest was generated
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Work items for one phase
    pub fn work_items(&self, mode: ItemMode) -> impl Iterator<Item = WorkItem> + '_ {
        self.entries.iter().map(move |e| WorkItem::from_entry(e, mode))
    }

    /// Whether two manifests hold the same entries (order-independent)
    pub fn same_membership(&self, other: &Manifest) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mine: HashSet<&ManifestEntry> = self.entries.iter().collect();
        other.entries.iter().all(|e| mine.contains(e))
    }
}
