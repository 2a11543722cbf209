//! Master side of a run
//!
//! - [`Orchestrator`]: the phase state machine
//! - [`WorkerRegistry`]: per-worker aggregate state behind the barriers
//! - [`FleetMonitor`]: retires compute nodes that will never register
//! - [`report`]: error report collection and the persisted artifact
//! - [`cleanup`]: ordered best-effort teardown

pub mod cleanup;
mod fleet;
mod orchestrator;
mod registry;
pub mod report;

pub use cleanup::{CleanupPlan, CleanupReport};
pub use fleet::{
    wait_until_running, worker_tag, ComputeProvider, FleetMonitor, FleetMonitorConfig, NodeHealth, NodeInfo,
    TickReport,
};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorHandle, PhaseTimings, RunOutcome, RunSummary,
};
pub use registry::{WorkerRecord, WorkerRegistry};
pub use report::{CollectedReport, ErrorReportLog};
