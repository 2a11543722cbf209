//! Worker-local outcome accumulation
//!
//! Outcomes from the executor are folded into per-phase counters that become
//! the interim and finished summaries sent to the orchestrator. Failures are
//! kept in full for the error report submitted during REPORT_ERRORS.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::executor::{PathOperationResult, VERIFY_STEP};
use crate::control::{codec, Phase, WorkerSummary};
use crate::error::CodecResult;
use crate::manifest::ItemMode;

#[derive(Debug, Clone, Default)]
struct PhaseCounters {
    ok: u64,
    failed: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    write: PhaseCounters,
    validate: PhaseCounters,
    monitor_errors: u64,
    post_write_verify_errors: u64,
    failures: Vec<PathOperationResult>,
}

/// Error report a worker submits during REPORT_ERRORS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Address of the reporting worker
    pub worker: String,
    pub write_failures: u64,
    pub validate_failures: u64,
    pub monitor_errors: u64,
    pub post_write_verify_errors: u64,
    /// Every failed item outcome
    pub failures: Vec<PathOperationResult>,
}

impl ErrorReport {
    /// Decode a report from a compressed message value
    pub fn from_compressed(value: &str) -> CodecResult<Self> {
        let json = codec::decode_decompress(value)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Accumulated outcomes for one worker
#[derive(Debug, Default)]
pub struct WorkerState {
    inner: Mutex<Inner>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one item outcome into the counters
    pub fn record(&self, result: PathOperationResult) {
        let mut inner = self.inner.lock();
        let counters = match result.mode {
            ItemMode::Write => &mut inner.write,
            ItemMode::Validate => &mut inner.validate,
        };

        if result.success {
            counters.ok += 1;
            counters.bytes += result.bytes;
            return;
        }

        if result.failed_step.as_deref() == Some(VERIFY_STEP) {
            inner.post_write_verify_errors += 1;
        } else {
            counters.failed += 1;
        }
        inner.failures.push(result);
    }

    /// Count an error in the worker's own loop (queue or channel)
    pub fn note_monitor_error(&self) {
        self.inner.lock().monitor_errors += 1;
    }

    /// Summary for a work phase
    pub fn summary(&self, phase: Phase) -> WorkerSummary {
        let inner = self.inner.lock();
        let counters = match phase {
            Phase::Validate => &inner.validate,
            _ => &inner.write,
        };
        WorkerSummary::new(
            counters.ok,
            counters.failed,
            counters.bytes,
            inner.monitor_errors,
            inner.post_write_verify_errors,
        )
    }

    /// Number of failed items recorded
    pub fn failure_count(&self) -> usize {
        self.inner.lock().failures.len()
    }

    /// Full error report
    pub fn error_report(&self, worker: &str) -> ErrorReport {
        let inner = self.inner.lock();
        ErrorReport {
            worker: worker.to_string(),
            write_failures: inner.write.failed,
            validate_failures: inner.validate.failed,
            monitor_errors: inner.monitor_errors,
            post_write_verify_errors: inner.post_write_verify_errors,
            failures: inner.failures.clone(),
        }
    }

    /// Error report as a compressed message value
    pub fn compressed_error_report(&self, worker: &str) -> CodecResult<String> {
        let json = serde_json::to_string(&self.error_report(worker))?;
        codec::compress_encode(&json)
    }
}
