//! Error report collection and the persisted report artifact
//!
//! The artifact is a single JSON document:
//!
//! ```text
//! { "errorReports" : [ <report> , <report> ] }
//! ```
//!
//! written one entry at a time and flushed after each, so a crash part way
//! through leaves every report written so far on disk.

use serde_json::Value;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::registry::WorkerRegistry;
use crate::control::{codec, MessageType};

/// One worker's decoded error report
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedReport {
    pub worker: String,
    pub report: Value,
}

/// Decode every submitted error report held by the registry
///
/// A report that cannot be decoded is kept as an object describing the
/// decode failure so it still appears in the artifact.
pub fn collect(registry: &WorkerRegistry) -> Vec<CollectedReport> {
    registry
        .payloads_of(MessageType::WorkerErrorReportDetails)
        .into_iter()
        .map(|(worker, value)| {
            let decoded = codec::decode_decompress(&value)
                .map_err(|e| e.to_string())
                .and_then(|json| serde_json::from_str::<Value>(&json).map_err(|e| e.to_string()));

            let report = match decoded {
                Ok(report) => report,
                Err(reason) => {
                    tracing::warn!(worker = %worker, "Undecodable error report: {}", reason);
                    serde_json::json!({ "worker": worker, "decodeError": reason })
                }
            };
            CollectedReport { worker, report }
        })
        .collect()
}

/// Local file the error reports are persisted to
#[derive(Debug, Clone)]
pub struct ErrorReportLog {
    path: PathBuf,
}

impl ErrorReportLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every report; returns the number of entries written
    pub fn persist(&self, reports: &[CollectedReport]) -> io::Result<usize> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&self.path)?;
        file.write_all(b"{ \"errorReports\" : [ ")?;
        file.flush()?;

        for (i, entry) in reports.iter().enumerate() {
            if i > 0 {
                file.write_all(b" , ")?;
            }
            let json = serde_json::to_string(&entry.report).map_err(io::Error::from)?;
            file.write_all(json.as_bytes())?;
            file.flush()?;
        }

        file.write_all(b" ] }\n")?;
        file.flush()?;

        tracing::info!(path = %self.path.display(), reports = reports.len(), "Error reports persisted");
        Ok(reports.len())
    }
}
