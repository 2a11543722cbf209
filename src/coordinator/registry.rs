//! Worker registry
//!
//! Aggregates everything the orchestrator has heard from each worker, keyed
//! by worker address. Records are created on the first message from an
//! unseen address and updated in place afterwards; they live for the run.
//!
//! Every update is an idempotent upsert, so duplicated or reordered delivery
//! converges on the same state: phases only move forward, summaries are
//! overwritten by newer ones and completion flags are never cleared.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::control::{ControlMessage, MessageType, Phase, WorkerSummary};
use crate::error::ControlError;

/// Aggregate state for one worker
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub address: String,
    pub source_id: String,
    /// Furthest phase the worker has reported
    pub phase: Phase,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub write_interim: Option<WorkerSummary>,
    pub write_final: Option<WorkerSummary>,
    pub validate_interim: Option<WorkerSummary>,
    pub validate_final: Option<WorkerSummary>,
    pub error_report_submitted: bool,
    /// Last value received per message type
    pub payloads: HashMap<MessageType, String>,
}

impl WorkerRecord {
    fn new(address: &str, source_id: &str) -> Self {
        let now = Utc::now();
        Self {
            address: address.to_string(),
            source_id: source_id.to_string(),
            phase: Phase::Initialized,
            first_seen: now,
            last_seen: now,
            write_interim: None,
            write_final: None,
            validate_interim: None,
            validate_final: None,
            error_report_submitted: false,
            payloads: HashMap::new(),
        }
    }

    /// Whether the worker has finished `phase`
    pub fn is_complete(&self, phase: Phase) -> bool {
        match phase {
            Phase::Write => self.write_final.is_some(),
            Phase::Validate => self.validate_final.is_some(),
            Phase::ReportErrors => self.error_report_submitted,
            _ => false,
        }
    }

    fn interim(&self, phase: Phase) -> Option<&WorkerSummary> {
        match phase {
            Phase::Write => self.write_interim.as_ref(),
            Phase::Validate => self.validate_interim.as_ref(),
            _ => None,
        }
    }

    fn finished(&self, phase: Phase) -> Option<&WorkerSummary> {
        match phase {
            Phase::Write => self.write_final.as_ref(),
            Phase::Validate => self.validate_final.as_ref(),
            _ => None,
        }
    }

    /// Most recent summary for a phase: finished if present, else interim
    pub fn latest(&self, phase: Phase) -> Option<&WorkerSummary> {
        self.finished(phase).or_else(|| self.interim(phase))
    }
}

/// Registry of every worker heard from during the run
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a worker message into its record
    ///
    /// Returns `true` when the message registered a previously unseen worker.
    /// A malformed value still registers the worker but leaves its state alone.
    pub fn register_worker_payload(&self, message: &ControlMessage) -> Result<bool, ControlError> {
        let mut workers = self.workers.write();
        let is_new = !workers.contains_key(&message.source_address);
        let record = workers
            .entry(message.source_address.clone())
            .or_insert_with(|| WorkerRecord::new(&message.source_address, &message.source_id));

        record.last_seen = Utc::now();
        record.source_id.clone_from(&message.source_id);
        record
            .payloads
            .insert(message.message_type, message.value.clone());

        match message.message_type {
            MessageType::WorkerCurrentPhase => {
                let phase = message.phase_value()?;
                if phase > record.phase {
                    record.phase = phase;
                }
            }
            MessageType::WorkerWritesCurrentSummary => {
                record.write_interim = Some(message.summary_value()?);
            }
            MessageType::WorkerWritesFinishedSummary => {
                record.write_final = Some(message.summary_value()?);
            }
            MessageType::WorkerValidationsCurrentSummary => {
                record.validate_interim = Some(message.summary_value()?);
            }
            MessageType::WorkerValidationsFinishedSummary => {
                record.validate_final = Some(message.summary_value()?);
            }
            MessageType::WorkerErrorReportDetails => {
                record.error_report_submitted = true;
            }
            _ => {}
        }

        Ok(is_new)
    }

    /// Number of registered workers
    pub fn size(&self) -> usize {
        self.workers.read().len()
    }

    /// Every registered worker's furthest reported phase is `phase`
    pub fn all_workers_current_phase_is(&self, phase: Phase) -> bool {
        let workers = self.workers.read();
        !workers.is_empty() && workers.values().all(|w| w.phase == phase)
    }

    /// Every registered worker has finished `phase`
    pub fn all_complete(&self, phase: Phase) -> bool {
        let workers = self.workers.read();
        !workers.is_empty() && workers.values().all(|w| w.is_complete(phase))
    }

    /// At least one worker has finished `phase`
    pub fn any_complete(&self, phase: Phase) -> bool {
        self.workers.read().values().any(|w| w.is_complete(phase))
    }

    /// Registered workers that have not finished `phase`, sorted by address
    pub fn workers_awaiting(&self, phase: Phase) -> Vec<String> {
        let mut awaiting: Vec<String> = self
            .workers
            .read()
            .values()
            .filter(|w| !w.is_complete(phase))
            .map(|w| w.address.clone())
            .collect();
        awaiting.sort();
        awaiting
    }

    /// Some worker's interim summary for `phase` reports errors
    pub fn any_interim_summary_has_errors(&self, phase: Phase) -> bool {
        self.workers
            .read()
            .values()
            .any(|w| w.interim(phase).is_some_and(WorkerSummary::has_item_errors))
    }

    /// Some worker has sent an interim summary for `phase`
    pub fn any_interim_summary_received(&self, phase: Phase) -> bool {
        self.workers.read().values().any(|w| w.interim(phase).is_some())
    }

    /// Some worker's finished summary for `phase` reports errors
    pub fn any_final_summary_has_errors(&self, phase: Phase) -> bool {
        self.workers
            .read()
            .values()
            .any(|w| w.finished(phase).is_some_and(WorkerSummary::has_item_errors))
    }

    fn sum(&self, phase: Phase, field: impl Fn(&WorkerSummary) -> u64) -> u64 {
        self.workers
            .read()
            .values()
            .filter_map(|w| w.latest(phase))
            .map(field)
            .sum()
    }

    pub fn total_written(&self) -> u64 {
        self.sum(Phase::Write, |s| s.ok)
    }

    pub fn total_write_failures(&self) -> u64 {
        self.sum(Phase::Write, |s| s.failed)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.sum(Phase::Write, |s| s.bytes)
    }

    pub fn total_validated(&self) -> u64 {
        self.sum(Phase::Validate, |s| s.ok)
    }

    pub fn total_validate_failures(&self) -> u64 {
        self.sum(Phase::Validate, |s| s.failed)
    }

    /// Monitor errors summed over each worker's most recent summary
    pub fn total_monitor_errors(&self) -> u64 {
        self.workers
            .read()
            .values()
            .filter_map(|w| w.latest(Phase::Validate).or_else(|| w.latest(Phase::Write)))
            .map(|s| s.monitor_errors)
            .sum()
    }

    /// Snapshot of one worker's record
    pub fn by_address(&self, address: &str) -> Option<WorkerRecord> {
        self.workers.read().get(address).cloned()
    }

    /// Addresses of every registered worker
    pub fn addresses(&self) -> HashSet<String> {
        self.workers.read().keys().cloned().collect()
    }

    /// Last value of `message_type` from every worker that sent one, sorted by address
    pub fn payloads_of(&self, message_type: MessageType) -> Vec<(String, String)> {
        let mut values: Vec<(String, String)> = self
            .workers
            .read()
            .values()
            .filter_map(|w| {
                w.payloads
                    .get(&message_type)
                    .map(|v| (w.address.clone(), v.clone()))
            })
            .collect();
        values.sort();
        values
    }
}
