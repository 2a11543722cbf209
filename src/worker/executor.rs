//! Work item execution pipeline
//!
//! WRITE items run a fixed ordered pipeline, stopping at the first step that
//! fails:
//!
//! 1. `mkdir -p` the target directory (the parent for files, the target
//!    itself for containers)
//! 2. `cp` source to target (files only)
//! 3. `chown` the target, if an owner is configured
//! 4. `chmod` the target, if a permission spec is configured
//!
//! Each step is retried on its own up to `max_attempts` times; a failed step
//! ends the pipeline for that item. After a successful copy the target size
//! is compared to the source size.
//!
//! VALIDATE items check that the target exists and, for files, that its size
//! matches the source.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::command::{CommandOutcome, CommandRunner, CommandSpec};
use crate::manifest::{ItemMode, WorkItem};

/// Name of the post-copy verification step
pub const VERIFY_STEP: &str = "verify";

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root the item paths are relative to on the source side
    pub source_root: PathBuf,
    /// Root the item paths are replicated under
    pub target_root: PathBuf,
    /// `chown` spec applied to every target (e.g. `app:app`)
    pub owner: Option<String>,
    /// `chmod` spec applied to every target (e.g. `0644`)
    pub permissions: Option<String>,
    /// Attempts per step
    pub max_attempts: u32,
    /// Pause after a failed attempt
    pub retry_pause: Duration,
}

impl ExecutorConfig {
    pub fn new(source_root: PathBuf, target_root: PathBuf) -> Self {
        Self {
            source_root,
            target_root,
            owner: None,
            permissions: None,
            max_attempts: 3,
            retry_pause: Duration::from_millis(500),
        }
    }
}

/// Every attempt made for one pipeline step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub success: bool,
    pub attempts: Vec<CommandOutcome>,
}

/// Outcome of one work item's pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOperationResult {
    pub mode: ItemMode,
    pub success: bool,
    /// Item path relative to the roots
    pub path: String,
    /// Resolved target path
    pub target_path: String,
    /// Human readable list of steps performed
    pub description: String,
    /// Step that ended the pipeline, when it failed
    pub failed_step: Option<String>,
    /// JSON evidence of every attempt
    pub evidence: String,
    /// Bytes replicated or verified
    pub bytes: u64,
}

impl PathOperationResult {
    /// Parse the evidence back into step reports
    pub fn step_reports(&self) -> Vec<StepReport> {
        serde_json::from_str(&self.evidence).unwrap_or_default()
    }

    /// Total attempts across every step
    pub fn attempt_count(&self) -> usize {
        self.step_reports().iter().map(|s| s.attempts.len()).sum()
    }
}

/// Runs work items through the local operation pipeline
pub struct TaskExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn CommandRunner>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn resolve(root: &Path, item_path: &str) -> PathBuf {
        root.join(item_path.trim_start_matches('/'))
    }

    /// Run one item through the pipeline for its mode
    pub async fn execute(&self, item: &WorkItem) -> PathOperationResult {
        match item.mode {
            ItemMode::Write => self.write(item).await,
            ItemMode::Validate => self.validate(item).await,
        }
    }

    /// Attempt `spec` until it succeeds or attempts run out
    ///
    /// An attempt succeeds when the command exits 0 and its expected path
    /// exists afterwards. A runner error ends the step immediately.
    pub async fn run_step(&self, step: &str, spec: &CommandSpec) -> StepReport {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::new();

        for attempt in 1..=max_attempts {
            let outcome = match self.runner.run(spec).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(step, command = %spec, "Step aborted: {}", e);
                    attempts.push(CommandOutcome::sentinel(spec, &e));
                    return StepReport {
                        step: step.to_string(),
                        success: false,
                        attempts,
                    };
                }
            };

            let path_ok = match &spec.expect_path {
                Some(path) => self.runner.path_exists(path).await,
                None => true,
            };
            let success = outcome.succeeded() && path_ok;
            attempts.push(outcome);

            if success {
                return StepReport {
                    step: step.to_string(),
                    success: true,
                    attempts,
                };
            }

            tracing::debug!(step, attempt, max_attempts, command = %spec, "Step attempt failed");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_pause).await;
            }
        }

        StepReport {
            step: step.to_string(),
            success: false,
            attempts,
        }
    }

    async fn write(&self, item: &WorkItem) -> PathOperationResult {
        let source = Self::resolve(&self.config.source_root, &item.path);
        let target = Self::resolve(&self.config.target_root, &item.path);

        let directory = if item.is_container {
            target.clone()
        } else {
            target.parent().map(Path::to_path_buf).unwrap_or_else(|| self.config.target_root.clone())
        };

        let mut pipeline = vec![(
            "mkdir",
            CommandSpec::new("mkdir").arg("-p").arg(&directory).expect(&directory),
        )];
        if !item.is_container {
            pipeline.push(("cp", CommandSpec::new("cp").arg(&source).arg(&target).expect(&target)));
        }
        if let Some(owner) = &self.config.owner {
            pipeline.push(("chown", CommandSpec::new("chown").arg(owner).arg(&target).expect(&target)));
        }
        if let Some(mode) = &self.config.permissions {
            pipeline.push(("chmod", CommandSpec::new("chmod").arg(mode).arg(&target).expect(&target)));
        }

        let mut reports = Vec::with_capacity(pipeline.len());
        for (step, spec) in &pipeline {
            let report = self.run_step(step, spec).await;
            let success = report.success;
            reports.push(report);

            if !success {
                return self.outcome(item, &target, false, Some(step.to_string()), &reports, 0);
            }
        }

        if item.is_container {
            return self.outcome(item, &target, true, None, &reports, 0);
        }

        let source_size = self.runner.file_size(&source).await;
        let target_size = self.runner.file_size(&target).await;
        match (source_size, target_size) {
            (Some(s), Some(t)) if s == t => self.outcome(item, &target, true, None, &reports, t),
            _ => {
                tracing::warn!(
                    path = %item.path,
                    source_size = ?source_size,
                    target_size = ?target_size,
                    "Post-write size check failed"
                );
                reports.push(StepReport {
                    step: VERIFY_STEP.to_string(),
                    success: false,
                    attempts: vec![CommandOutcome {
                        command: format!("stat {}", target.display()),
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: format!("source size {:?} != target size {:?}", source_size, target_size),
                    }],
                });
                self.outcome(item, &target, false, Some(VERIFY_STEP.to_string()), &reports, 0)
            }
        }
    }

    async fn validate(&self, item: &WorkItem) -> PathOperationResult {
        let source = Self::resolve(&self.config.source_root, &item.path);
        let target = Self::resolve(&self.config.target_root, &item.path);

        let exists = self.runner.path_exists(&target).await;
        let (success, detail, bytes) = if !exists {
            (false, "target missing".to_string(), 0)
        } else if item.is_container {
            (true, "target exists".to_string(), 0)
        } else {
            let source_size = self.runner.file_size(&source).await;
            let target_size = self.runner.file_size(&target).await;
            match (source_size, target_size) {
                (Some(s), Some(t)) if s == t => (true, format!("size {} matches", t), t),
                _ => (
                    false,
                    format!("source size {:?} != target size {:?}", source_size, target_size),
                    0,
                ),
            }
        };

        let reports = vec![StepReport {
            step: "validate".to_string(),
            success,
            attempts: vec![CommandOutcome {
                command: format!("stat {}", target.display()),
                exit_code: if success { 0 } else { 1 },
                stdout: if success { detail.clone() } else { String::new() },
                stderr: if success { String::new() } else { detail },
            }],
        }];

        let failed_step = (!success).then(|| "validate".to_string());
        self.outcome(item, &target, success, failed_step, &reports, bytes)
    }

    fn outcome(
        &self,
        item: &WorkItem,
        target: &Path,
        success: bool,
        failed_step: Option<String>,
        reports: &[StepReport],
        bytes: u64,
    ) -> PathOperationResult {
        let steps = reports.iter().map(|r| r.step.as_str()).collect::<Vec<_>>().join(" + ");
        let description = match &failed_step {
            Some(step) => format!("{} failed ({})", step, steps),
            None => steps,
        };

        PathOperationResult {
            mode: item.mode,
            success,
            path: item.path.clone(),
            target_path: target.display().to_string(),
            description,
            failed_step,
            evidence: serde_json::to_string(reports).unwrap_or_default(),
            bytes,
        }
    }
}
