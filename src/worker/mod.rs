//! Worker side: consumes work items and reports to the orchestrator
//!
//! - [`command`]: local command execution behind [`CommandRunner`]
//! - [`TaskExecutor`]: the per-item operation pipeline with bounded retries
//! - [`WorkerState`]: accumulated outcomes, summaries and the error report
//! - [`WorkerNode`]: the poll/execute/report loop

pub mod command;
mod executor;
mod node;
mod state;

pub use command::{CommandOutcome, CommandRunner, CommandSpec, ProcessRunner, SENTINEL_EXIT_CODE};
pub use executor::{ExecutorConfig, PathOperationResult, StepReport, TaskExecutor, VERIFY_STEP};
pub use node::{WorkerNode, WorkerNodeConfig, WorkerProgress, WorkerRunStats};
pub use state::{ErrorReport, WorkerState};
