//! Control channel message types
//!
//! Every participant (orchestrator and workers) publishes [`ControlMessage`]s
//! onto one shared broadcast channel. Delivery is at-least-once and unordered,
//! so every type here is a plain value that can be applied idempotently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ControlError;

/// Global stage of a run
///
/// Ordered: the orchestrator only ever moves forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Waiting for the fleet to register
    Initialized,
    /// Copying source entries to the target
    Write,
    /// Verifying the copied entries
    Validate,
    /// Collecting error reports from every worker
    ReportErrors,
    /// Terminal
    Shutdown,
}

impl Phase {
    /// Wire name of this phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialized => "INITIALIZED",
            Phase::Write => "WRITE",
            Phase::Validate => "VALIDATE",
            Phase::ReportErrors => "REPORT_ERRORS",
            Phase::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "INITIALIZED" => Ok(Phase::Initialized),
            "WRITE" => Ok(Phase::Write),
            "VALIDATE" => Ok(Phase::Validate),
            "REPORT_ERRORS" => Ok(Phase::ReportErrors),
            "SHUTDOWN" => Ok(Phase::Shutdown),
            other => Err(ControlError::Malformed(format!("unknown phase '{}'", other))),
        }
    }
}

/// Kind of a control message; decides how `value` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Orchestrator announces the authoritative phase (value: phase name)
    OrchestratorCurrentPhase,
    /// Every work item of a phase has been enqueued (value: phase name)
    OrchestratorDispatchComplete,
    /// Worker announces the phase it is in (value: phase name)
    WorkerCurrentPhase,
    /// In-flight WRITE progress (value: [`WorkerSummary`] JSON)
    WorkerWritesCurrentSummary,
    /// Worker finished its WRITE work (value: [`WorkerSummary`] JSON)
    WorkerWritesFinishedSummary,
    /// In-flight VALIDATE progress (value: [`WorkerSummary`] JSON)
    WorkerValidationsCurrentSummary,
    /// Worker finished its VALIDATE work (value: [`WorkerSummary`] JSON)
    WorkerValidationsFinishedSummary,
    /// Compressed error report (value: codec-encoded JSON)
    WorkerErrorReportDetails,
    /// Shutdown command (value: [`ShutdownDirective`] JSON)
    CmdWorkerShutdown,
}

impl MessageType {
    /// Interim summary type for a work phase
    pub fn current_summary_for(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Write => Some(MessageType::WorkerWritesCurrentSummary),
            Phase::Validate => Some(MessageType::WorkerValidationsCurrentSummary),
            _ => None,
        }
    }

    /// Final summary type for a work phase
    pub fn finished_summary_for(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Write => Some(MessageType::WorkerWritesFinishedSummary),
            Phase::Validate => Some(MessageType::WorkerValidationsFinishedSummary),
            _ => None,
        }
    }
}

/// One message on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Published by the orchestrator
    pub from_orchestrator: bool,
    /// Identifier of the publishing process
    pub source_id: String,
    /// Network address of the publishing process; the registry key for workers
    pub source_address: String,
    /// When set, only the worker at this address acts on the message
    pub target_address_filter: Option<String>,
    /// Message kind
    pub message_type: MessageType,
    /// Opaque payload, interpretation depends on `message_type`
    pub value: String,
    /// Publish time (informational only, never used for ordering)
    pub sent_at: DateTime<Utc>,
}

impl ControlMessage {
    /// Build a broadcast message
    pub fn new(
        from_orchestrator: bool,
        source_id: &str,
        source_address: &str,
        message_type: MessageType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            from_orchestrator,
            source_id: source_id.to_string(),
            source_address: source_address.to_string(),
            target_address_filter: None,
            message_type,
            value: value.into(),
            sent_at: Utc::now(),
        }
    }

    /// Restrict this message to a single worker address
    pub fn targeted(mut self, address: &str) -> Self {
        self.target_address_filter = Some(address.to_string());
        self
    }

    /// Whether the participant at `address` should act on this message
    pub fn is_for(&self, address: &str) -> bool {
        match &self.target_address_filter {
            None => true,
            Some(target) => target == address,
        }
    }

    /// Parse the value as a phase name
    pub fn phase_value(&self) -> Result<Phase, ControlError> {
        self.value.parse()
    }

    /// Parse the value as a worker summary
    pub fn summary_value(&self) -> Result<WorkerSummary, ControlError> {
        serde_json::from_str(&self.value).map_err(|e| ControlError::Malformed(e.to_string()))
    }

    /// Serialize to the wire format
    pub fn to_json(&self) -> Result<String, ControlError> {
        serde_json::to_string(self).map_err(|e| ControlError::Malformed(e.to_string()))
    }

    /// Deserialize from the wire format
    pub fn from_json(json: &str) -> Result<Self, ControlError> {
        serde_json::from_str(json).map_err(|e| ControlError::Malformed(e.to_string()))
    }
}

/// Worker progress summary carried by the summary message types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Items that completed successfully in this phase
    pub ok: u64,
    /// Items that failed in this phase
    pub failed: u64,
    /// Bytes replicated or verified
    pub bytes: u64,
    /// Transport and monitoring errors; reported, never escalated
    pub monitor_errors: u64,
    /// Post-write local verification errors
    pub post_write_verify_errors: u64,
    /// Some item failed or failed verification
    pub has_errors: bool,
}

impl WorkerSummary {
    /// Build a summary, deriving `has_errors` from the counters
    pub fn new(ok: u64, failed: u64, bytes: u64, monitor_errors: u64, post_write_verify_errors: u64) -> Self {
        Self {
            ok,
            failed,
            bytes,
            monitor_errors,
            post_write_verify_errors,
            has_errors: failed > 0 || post_write_verify_errors > 0,
        }
    }

    /// Item-level failures, judged from the counters rather than the sent flag
    pub fn has_item_errors(&self) -> bool {
        self.failed > 0 || self.post_write_verify_errors > 0
    }

    /// Serialize for a message value
    pub fn to_json(&self) -> String {
        // Plain integer/bool struct: serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast at termination: where workers archive their logs before exiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownDirective {
    /// Archival bucket name
    pub bucket: String,
    /// Timestamped destination folder root
    pub folder_root: String,
    /// Worker-side log files to archive
    pub worker_log_files: Vec<String>,
}

impl ShutdownDirective {
    /// Build a directive whose folder root is the current time
    pub fn new(bucket: &str, worker_log_files: Vec<String>) -> Self {
        Self {
            bucket: bucket.to_string(),
            folder_root: Utc::now().format("%Y-%m-%d-%H-%M-%S-%3f").to_string(),
            worker_log_files,
        }
    }

    /// Serialize for a message value
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse from a message value
    pub fn from_json(json: &str) -> Result<Self, ControlError> {
        serde_json::from_str(json).map_err(|e| ControlError::Malformed(e.to_string()))
    }
}
