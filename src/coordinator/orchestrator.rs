//! Master orchestrator: the phase state machine
//!
//! The orchestrator is the single holder of the run's [`Phase`]. Every inbound
//! control message is folded into the [`WorkerRegistry`] and then the barrier
//! rules are evaluated against the aggregate state, never against message
//! order:
//!
//! ```text
//! INITIALIZED --all registered--> WRITE --all finished, no errors--> VALIDATE
//!                                   |                                   |
//!                                   +--errors / fail-fast--+   errors / |
//!                                                          v  fail-fast |
//!                                                   REPORT_ERRORS <-----+
//!                                                          |            |
//!                                             all reports in   all finished,
//!                                                          |    no errors
//!                                                          v            |
//!                                                       SHUTDOWN <------+
//! ```
//!
//! Both routes into SHUTDOWN go through the same run-once finalization.
//!
//! Phase changes are check-and-set under the state lock, so a transition
//! happens at most once however often its trigger is delivered. Finalization
//! is additionally guarded by a one-shot flag.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::cleanup::{CleanupPlan, CleanupReport};
use super::fleet::{wait_until_running, worker_tag, ComputeProvider, FleetMonitor, FleetMonitorConfig};
use super::registry::WorkerRegistry;
use super::report::{self, ErrorReportLog};
use crate::archive::ArchivalStore;
use crate::config::OrchestratorConfig;
use crate::control::{ControlChannel, ControlHandler, ControlMessage, MessageType, Phase, ShutdownDirective};
use crate::dispatch::{DispatchReport, ManifestDispatcher, ManifestInput};
use crate::error::{FleetError, FleetResult, GenerationError, Result};
use crate::manifest::{ItemMode, Manifest, ManifestSource};
use crate::queue::WorkQueue;
use crate::worker::command::{CommandRunner, CommandSpec, SENTINEL_EXIT_CODE};

/// Everything the orchestrator talks to
pub struct Collaborators {
    pub control: Arc<dyn ControlChannel>,
    pub queue: Arc<dyn WorkQueue>,
    pub source: Arc<dyn ManifestSource>,
    pub archive: Arc<dyn ArchivalStore>,
    /// Runs source host hook commands
    pub runner: Arc<dyn CommandRunner>,
    /// Needed for a self-managed fleet or a source host node id
    pub provider: Option<Arc<dyn ComputeProvider>>,
}

/// How the run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Running,
    /// Final reports collected and the auto-shutdown delay elapsed
    Completed,
    /// Fatal error, torn down
    Failed(String),
}

/// Wall-clock phase boundaries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    pub write_started: Option<DateTime<Utc>>,
    pub write_finished: Option<DateTime<Utc>>,
    pub validate_started: Option<DateTime<Utc>>,
    pub validate_finished: Option<DateTime<Utc>>,
}

impl PhaseTimings {
    fn span(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<Duration> {
        match (start, end) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn write_duration(&self) -> Option<Duration> {
        Self::span(self.write_started, self.write_finished)
    }

    pub fn validate_duration(&self) -> Option<Duration> {
        Self::span(self.validate_started, self.validate_finished)
    }
}

/// Aggregate counters across the fleet
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub phase: Phase,
    pub registered: usize,
    pub expected_workers: usize,
    pub written: u64,
    pub write_failures: u64,
    pub bytes_written: u64,
    pub validated: u64,
    pub validate_failures: u64,
    pub monitor_errors: u64,
    pub manifest_entries: Option<usize>,
    pub elapsed: Duration,
    pub timings: PhaseTimings,
}

struct RunState {
    phase: Phase,
    /// Set once by the WRITE dispatch, reused unchanged for VALIDATE
    manifest: Option<Manifest>,
    /// Phases whose dispatch has completed
    dispatched: HashSet<Phase>,
    /// Directive broadcast at finalization
    directive: Option<ShutdownDirective>,
    /// Stops the dispatch currently feeding the queue
    dispatch_cancel: Option<CancellationToken>,
    timings: PhaseTimings,
}

/// Resolves when the run ends
#[derive(Clone)]
pub struct OrchestratorHandle {
    outcome: watch::Receiver<RunOutcome>,
}

impl OrchestratorHandle {
    /// Wait for the run to end
    pub async fn terminated(mut self) -> RunOutcome {
        let outcome = match self.outcome.wait_for(|o| *o != RunOutcome::Running).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => RunOutcome::Failed("orchestrator dropped".into()),
        };
        outcome
    }
}

/// The master orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    control: Arc<dyn ControlChannel>,
    queue: Arc<dyn WorkQueue>,
    source: Arc<dyn ManifestSource>,
    archive: Arc<dyn ArchivalStore>,
    runner: Arc<dyn CommandRunner>,
    provider: Option<Arc<dyn ComputeProvider>>,
    registry: Arc<WorkerRegistry>,
    expected_workers: Arc<AtomicUsize>,
    dispatcher: ManifestDispatcher,
    state: Mutex<RunState>,
    finalized: AtomicBool,
    destroyed: AtomicBool,
    reports_persisted: AtomicUsize,
    phase_tx: watch::Sender<Phase>,
    outcome_tx: watch::Sender<RunOutcome>,
    fleet: Mutex<Option<Arc<FleetMonitor>>>,
    owned_nodes: Mutex<Vec<String>>,
    background: CancellationToken,
    started_at: Instant,
    this: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            control,
            queue,
            source,
            archive,
            runner,
            provider,
        } = collaborators;

        let dispatcher = ManifestDispatcher::new(Arc::clone(&queue), config.dispatch_threads);
        let expected_workers = Arc::new(AtomicUsize::new(config.expected_workers));
        let (phase_tx, _) = watch::channel(Phase::Initialized);
        let (outcome_tx, _) = watch::channel(RunOutcome::Running);

        Arc::new_cyclic(|this| Self {
            config,
            control,
            queue,
            source,
            archive,
            runner,
            provider,
            registry: Arc::new(WorkerRegistry::new()),
            expected_workers,
            dispatcher,
            state: Mutex::new(RunState {
                phase: Phase::Initialized,
                manifest: None,
                dispatched: HashSet::new(),
                directive: None,
                dispatch_cancel: None,
                timings: PhaseTimings::default(),
            }),
            finalized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reports_persisted: AtomicUsize::new(0),
            phase_tx,
            outcome_tx,
            fleet: Mutex::new(None),
            owned_nodes: Mutex::new(Vec::new()),
            background: CancellationToken::new(),
            started_at: Instant::now(),
            this: this.clone(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    /// The manifest, once the WRITE dispatch has completed
    pub fn manifest(&self) -> Option<Manifest> {
        self.state.lock().manifest.clone()
    }

    pub fn expected_workers(&self) -> usize {
        self.expected_workers.load(Ordering::SeqCst)
    }

    /// Number of times the error report artifact was written
    pub fn reports_persisted(&self) -> usize {
        self.reports_persisted.load(Ordering::SeqCst)
    }

    /// Whether the dispatch for `phase` has completed
    pub fn dispatch_completed(&self, phase: Phase) -> bool {
        self.state.lock().dispatched.contains(&phase)
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            outcome: self.outcome_tx.subscribe(),
        }
    }

    /// Bring up prerequisites, start listening and announce INITIALIZED
    ///
    /// A failure here tears down whatever was already brought up.
    pub async fn start(self: &Arc<Self>) -> Result<OrchestratorHandle> {
        tracing::info!(
            expected_workers = self.expected_workers(),
            dispatch_threads = self.config.dispatch_threads,
            fail_fast = self.config.fail_fast,
            source = %self.source.describe(),
            "Starting orchestrator"
        );

        if let Err(e) = self.prepare().await {
            tracing::error!("Orchestrator start failed: {}", e);
            self.destroy().await;
            self.outcome_tx.send_replace(RunOutcome::Failed(e.to_string()));
            return Err(e);
        }

        Ok(self.handle())
    }

    async fn prepare(self: &Arc<Self>) -> Result<()> {
        self.start_source_host().await?;

        if self.config.self_managed_fleet {
            self.launch_fleet().await?;
        }

        self.control
            .listen(Arc::clone(self) as Arc<dyn ControlHandler>)
            .await?;
        self.broadcast_phase(Phase::Initialized).await;
        self.spawn_stats_task();
        Ok(())
    }

    async fn start_source_host(&self) -> FleetResult<()> {
        let host = &self.config.source_host;

        if let Some(node_id) = &host.node_id {
            let provider = self.provider.as_ref().ok_or_else(|| FleetError::NodeOperation {
                operation: "start".into(),
                node_id: node_id.clone(),
                reason: "no compute provider available".into(),
            })?;

            if provider.is_running(node_id).await? {
                tracing::info!(node_id = %node_id, "Source host already running");
            } else {
                tracing::info!(node_id = %node_id, "Starting source host");
                provider.start(node_id).await?;
                wait_until_running(provider.as_ref(), node_id, host.poll_interval, host.start_timeout).await?;
                tokio::time::sleep(host.settle_delay).await;
            }
        }

        if let Some(command) = &host.post_start_command {
            self.run_hook(command).await?;
        }
        Ok(())
    }

    /// Run a host hook through `sh -c` with bounded attempts
    async fn run_hook(&self, command: &str) -> FleetResult<()> {
        let attempts = self.config.source_host.command_attempts.max(1);
        let spec = CommandSpec::new("sh").arg("-c").arg(command);
        let mut exit_code = SENTINEL_EXIT_CODE;

        for attempt in 1..=attempts {
            match self.runner.run(&spec).await {
                Ok(outcome) if outcome.succeeded() => {
                    tracing::info!(command, attempt, "Host command succeeded");
                    return Ok(());
                }
                Ok(outcome) => {
                    exit_code = outcome.exit_code;
                    tracing::warn!(command, attempt, exit_code, stderr = %outcome.stderr.trim(), "Host command failed");
                }
                Err(e) => {
                    exit_code = SENTINEL_EXIT_CODE;
                    tracing::warn!(command, attempt, "Host command could not run: {}", e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.source_host.poll_interval).await;
            }
        }

        Err(FleetError::HookFailed {
            command: command.to_string(),
            exit_code,
        })
    }

    async fn launch_fleet(&self) -> FleetResult<()> {
        let requested = self.expected_workers();
        let provider = self.provider.clone().ok_or_else(|| FleetError::LaunchFailed {
            count: requested,
            reason: "no compute provider available".into(),
        })?;

        let nodes = provider.launch(requested).await?;
        *self.owned_nodes.lock() = nodes.clone();
        if nodes.len() != requested {
            tracing::warn!(requested, launched = nodes.len(), "Fewer nodes launched than requested");
            self.expected_workers.store(nodes.len(), Ordering::SeqCst);
        }

        let tag = worker_tag();
        provider.tag(&nodes, &tag).await?;
        tracing::info!(nodes = nodes.len(), tag = %tag, "Worker nodes launched");

        let monitor = Arc::new(FleetMonitor::new(
            FleetMonitorConfig {
                interval: self.config.monitor_interval,
                grace_period: self.config.registration_grace,
                shutdown_pause: self.config.straggler_pause,
                archive_bucket: self.config.archive_bucket.clone(),
                worker_log_files: self.config.worker_log_files.clone(),
            },
            provider,
            Arc::clone(&self.registry),
            Arc::clone(&self.control),
            Arc::clone(&self.expected_workers),
            nodes,
            self.started_at,
        ));
        Arc::clone(&monitor).spawn(self.phase_tx.subscribe());
        *self.fleet.lock() = Some(monitor);
        Ok(())
    }

    fn spawn_stats_task(&self) {
        let this = self.this.clone();
        let cancel = self.background.clone();
        let interval = self.config.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => match this.upgrade() {
                        Some(orchestrator) => orchestrator.dump_stats(),
                        None => break,
                    },
                }
            }
        });
    }

    /// Snapshot of the aggregate counters
    pub fn summary(&self) -> RunSummary {
        let (phase, timings, manifest_entries) = {
            let state = self.state.lock();
            (state.phase, state.timings.clone(), state.manifest.as_ref().map(Manifest::len))
        };
        RunSummary {
            phase,
            registered: self.registry.size(),
            expected_workers: self.expected_workers(),
            written: self.registry.total_written(),
            write_failures: self.registry.total_write_failures(),
            bytes_written: self.registry.total_bytes_written(),
            validated: self.registry.total_validated(),
            validate_failures: self.registry.total_validate_failures(),
            monitor_errors: self.registry.total_monitor_errors(),
            manifest_entries,
            elapsed: self.started_at.elapsed(),
            timings,
        }
    }

    fn dump_stats(&self) {
        let s = self.summary();
        tracing::info!(
            phase = %s.phase,
            workers = s.registered,
            expected = s.expected_workers,
            manifest = ?s.manifest_entries,
            written = s.written,
            write_failures = s.write_failures,
            bytes = %humansize::format_size(s.bytes_written, humansize::BINARY),
            validated = s.validated,
            validate_failures = s.validate_failures,
            monitor_errors = s.monitor_errors,
            elapsed_secs = s.elapsed.as_secs(),
            write_secs = ?s.timings.write_duration().map(|d| d.as_secs()),
            validate_secs = ?s.timings.validate_duration().map(|d| d.as_secs()),
            "Run stats"
        );
    }

    /// Entry point for every inbound control message
    pub async fn on_control_message(&self, message: ControlMessage) {
        if message.from_orchestrator {
            return;
        }

        match self.registry.register_worker_payload(&message) {
            Ok(true) => tracing::info!(
                address = %message.source_address,
                source_id = %message.source_id,
                registered = self.registry.size(),
                expected = self.expected_workers(),
                "Worker registered"
            ),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                address = %message.source_address,
                message_type = ?message.message_type,
                "Malformed worker message: {}",
                e
            ),
        }

        if message.message_type == MessageType::WorkerCurrentPhase {
            self.answer_heartbeat(&message).await;
        }

        match self.phase() {
            Phase::Initialized => self.evaluate_registration().await,
            phase @ (Phase::Write | Phase::Validate) => self.evaluate_work_phase(phase).await,
            Phase::ReportErrors => self.evaluate_reports().await,
            Phase::Shutdown => {}
        }
    }

    /// Re-send whatever a worker's heartbeat shows it has missed
    async fn answer_heartbeat(&self, message: &ControlMessage) {
        let Ok(reported) = message.phase_value() else {
            return;
        };
        let (current, dispatched, directive) = {
            let state = self.state.lock();
            (state.phase, state.dispatched.contains(&state.phase), state.directive.clone())
        };
        let address = &message.source_address;

        let resend = match current {
            Phase::Shutdown => directive.map(|d| (MessageType::CmdWorkerShutdown, d.to_json())),
            _ if reported < current => Some((MessageType::OrchestratorCurrentPhase, current.as_str().to_string())),
            _ if reported == current && dispatched => {
                Some((MessageType::OrchestratorDispatchComplete, current.as_str().to_string()))
            }
            _ => None,
        };

        if let Some((message_type, value)) = resend {
            tracing::debug!(address = %address, reported = %reported, current = %current, ?message_type, "Re-sending to worker");
            if let Err(e) = self.control.send_to(address, message_type, value).await {
                tracing::debug!(address = %address, "Re-send failed: {}", e);
            }
        }
    }

    /// Rules 1 and 2
    async fn evaluate_registration(&self) {
        let expected = self.expected_workers();
        let registered = self.registry.size();

        if registered == expected && self.registry.all_workers_current_phase_is(Phase::Initialized) {
            if self.advance(Phase::Initialized, Phase::Write) {
                self.broadcast_phase(Phase::Write).await;
                self.start_dispatch(Phase::Write);
            }
        } else if registered != expected {
            tracing::info!(registered, expected, "Waiting for workers to register");
        }
    }

    /// Rules 3 to 6
    async fn evaluate_work_phase(&self, phase: Phase) {
        if self.registry.all_complete(phase) {
            let errors = self.registry.any_final_summary_has_errors(phase);
            if phase == Phase::Validate && !errors {
                tracing::info!(validated = self.registry.total_validated(), "Validation clean across all workers");
                self.finalize_once(Phase::Validate).await;
                return;
            }

            let next = if phase == Phase::Write && !errors {
                Phase::Validate
            } else {
                Phase::ReportErrors
            };

            if self.advance(phase, next) {
                if errors {
                    tracing::warn!(phase = %phase, "Workers reported errors");
                }
                self.broadcast_phase(next).await;
                if next == Phase::Validate {
                    self.start_dispatch(Phase::Validate);
                }
            }
            return;
        }

        let errors_in_flight = self.registry.any_interim_summary_has_errors(phase)
            || self.registry.any_final_summary_has_errors(phase);
        if self.config.fail_fast && errors_in_flight {
            if self.advance(phase, Phase::ReportErrors) {
                tracing::warn!(
                    phase = %phase,
                    awaiting = ?self.registry.workers_awaiting(phase),
                    "Fail-fast: error reported while phase in flight"
                );
                self.cancel_dispatch();
                self.broadcast_phase(Phase::ReportErrors).await;
                self.drain_queue().await;
            }
            return;
        }

        if self.registry.any_complete(phase) {
            tracing::info!(phase = %phase, awaiting = ?self.registry.workers_awaiting(phase), "Waiting for workers");
        } else if self.registry.any_interim_summary_received(phase) {
            tracing::debug!(phase = %phase, written = self.registry.total_written(), "Phase in progress");
        }
    }

    /// Rules 7 and 8
    async fn evaluate_reports(&self) {
        if self.registry.all_complete(Phase::ReportErrors) {
            self.finalize_once(Phase::ReportErrors).await;
        } else if self.registry.any_complete(Phase::ReportErrors) {
            tracing::info!(
                awaiting = ?self.registry.workers_awaiting(Phase::ReportErrors),
                "Waiting for error reports"
            );
        }
    }

    /// Check-and-set the phase; true when this call moved it
    fn advance(&self, from: Phase, to: Phase) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase != from {
                return false;
            }
            state.phase = to;

            let now = Some(Utc::now());
            match (from, to) {
                (_, Phase::Write) => state.timings.write_started = now,
                (Phase::Write, Phase::Validate) => {
                    state.timings.write_finished = now;
                    state.timings.validate_started = now;
                }
                (Phase::Write, Phase::ReportErrors) => state.timings.write_finished = now,
                (Phase::Validate, Phase::ReportErrors | Phase::Shutdown) => state.timings.validate_finished = now,
                _ => {}
            }
        }

        self.phase_tx.send_replace(to);
        tracing::info!(from = %from, to = %to, "Phase transition");
        self.dump_stats();
        true
    }

    async fn broadcast_phase(&self, phase: Phase) {
        if let Err(e) = self
            .control
            .send(MessageType::OrchestratorCurrentPhase, phase.as_str().to_string())
            .await
        {
            tracing::warn!(phase = %phase, "Failed to broadcast phase: {}", e);
        }
    }

    fn cancel_dispatch(&self) {
        if let Some(cancel) = self.state.lock().dispatch_cancel.take() {
            cancel.cancel();
        }
    }

    /// Best effort; an empty queue purges nothing
    async fn drain_queue(&self) {
        match self.queue.purge().await {
            Ok(purged) => tracing::info!(purged, "Work queue drained"),
            Err(e) => tracing::warn!("Failed to drain work queue: {}", e),
        }
    }

    fn start_dispatch(&self, phase: Phase) {
        let (mode, input) = match phase {
            Phase::Write => (ItemMode::Write, ManifestInput::Generate(Arc::clone(&self.source))),
            Phase::Validate => match self.manifest() {
                Some(manifest) => (ItemMode::Validate, ManifestInput::Reuse(manifest)),
                None => {
                    self.spawn_failure("VALIDATE started without a manifest".into());
                    return;
                }
            },
            _ => return,
        };

        let handle = self.dispatcher.dispatch(mode, input);
        {
            let mut state = self.state.lock();
            if state.phase == phase {
                state.dispatch_cancel = Some(handle.canceller());
            } else {
                // Fail-fast landed while the phase was being announced
                handle.canceller().cancel();
            }
        }
        let this = self.this.clone();
        tokio::spawn(async move {
            let outcome = handle.completion().await;
            let Some(orchestrator) = this.upgrade() else {
                return;
            };
            match outcome {
                Ok(report) => orchestrator.on_dispatch_complete(phase, report).await,
                Err(e) => orchestrator.on_generation_error(phase, e).await,
            }
        });
    }

    async fn on_dispatch_complete(&self, phase: Phase, report: DispatchReport) {
        let current = {
            let mut state = self.state.lock();
            if state.manifest.is_none() {
                state.manifest = Some(report.manifest.clone());
            }
            if state.phase == phase {
                state.dispatched.insert(phase);
                state.dispatch_cancel = None;
            }
            state.phase
        };

        if current != phase {
            tracing::info!(phase = %phase, current = %current, items = report.enqueued, "Dispatch finished after the run moved on");
            self.drain_late_items(current).await;
            return;
        }

        if report.enqueue_failures > 0 {
            tracing::warn!(phase = %phase, failures = report.enqueue_failures, "Some work items were not enqueued");
        }
        tracing::info!(phase = %phase, items = report.enqueued, "Dispatch complete, announcing");

        if let Err(e) = self
            .control
            .send(MessageType::OrchestratorDispatchComplete, phase.as_str().to_string())
            .await
        {
            tracing::warn!(phase = %phase, "Failed to announce dispatch completion: {}", e);
        }
    }

    async fn on_generation_error(&self, phase: Phase, error: GenerationError) {
        let current = self.phase();
        if current != phase {
            tracing::info!(phase = %phase, "Dispatch ended after the run moved on: {}", error);
            self.drain_late_items(current).await;
            return;
        }
        tracing::error!(phase = %phase, "Manifest generation failed: {}", error);
        self.fail(error.to_string()).await;
    }

    /// Items pushed by a dispatch that outlived its phase are purged again
    async fn drain_late_items(&self, current: Phase) {
        if current == Phase::ReportErrors {
            self.drain_queue().await;
        }
    }

    fn spawn_failure(&self, reason: String) {
        let this = self.this.clone();
        tokio::spawn(async move {
            if let Some(orchestrator) = this.upgrade() {
                orchestrator.fail(reason).await;
            }
        });
    }

    async fn fail(&self, reason: String) {
        tracing::error!(reason = %reason, "Run failed, shutting down");
        self.destroy().await;
        self.outcome_tx.send_replace(RunOutcome::Failed(reason));
    }

    /// Finalize unless some other delivery already has
    async fn finalize_once(&self, from: Phase) {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.finalize(from).await;
        }
    }

    /// Persist reports, broadcast the shutdown directive, then auto-shutdown
    async fn finalize(&self, from: Phase) {
        let reports = report::collect(&self.registry);
        for entry in &reports {
            tracing::info!(worker = %entry.worker, report = %entry.report, "Worker error report");
        }

        if let Some(path) = &self.config.error_report_log {
            match ErrorReportLog::new(path).persist(&reports) {
                Ok(_) => {
                    self.reports_persisted.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => tracing::error!(path = %path.display(), "Failed to persist error reports: {}", e),
            }
        }

        let directive = ShutdownDirective::new(&self.config.archive_bucket, self.config.worker_log_files.clone());
        self.state.lock().directive = Some(directive.clone());
        if let Err(e) = self
            .control
            .send(MessageType::CmdWorkerShutdown, directive.to_json())
            .await
        {
            tracing::error!("Failed to broadcast shutdown directive: {}", e);
        }
        self.advance(from, Phase::Shutdown);

        match self.config.auto_shutdown {
            Some(delay) => {
                tracing::info!(delay_secs = delay.as_secs(), "Run complete, shutting down after delay");
                tokio::time::sleep(delay).await;
                self.destroy().await;
                self.outcome_tx.send_replace(RunOutcome::Completed);
            }
            None => tracing::info!("Run complete, waiting for interrupt"),
        }
    }

    fn shutdown_directive(&self) -> ShutdownDirective {
        self.state
            .lock()
            .directive
            .clone()
            .unwrap_or_else(|| ShutdownDirective::new(&self.config.archive_bucket, self.config.worker_log_files.clone()))
    }

    async fn archive_logs(&self) -> Result<()> {
        let directive = self.shutdown_directive();
        let archived = self
            .archive
            .upload(&directive.bucket, &directive.folder_root, "orchestrator", &self.config.log_files)
            .await?;
        tracing::info!(archived, "Orchestrator logs archived");
        Ok(())
    }

    async fn terminate_owned_nodes(&self) -> Result<()> {
        let Some(provider) = self.provider.clone() else {
            return Ok(());
        };
        let monitor = self.fleet.lock().clone();
        let nodes = match monitor {
            Some(monitor) => monitor.live_nodes(),
            None => self.owned_nodes.lock().clone(),
        };

        let mut last_error = None;
        for node_id in &nodes {
            if let Err(e) = provider.terminate(node_id).await {
                tracing::warn!(node_id = %node_id, "Failed to terminate node: {}", e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn stop_source_host(&self) -> Result<()> {
        let host = &self.config.source_host;
        if let Some(command) = &host.pre_stop_command {
            self.run_hook(command).await?;
        }
        if host.stop_on_shutdown {
            if let (Some(provider), Some(node_id)) = (&self.provider, &host.node_id) {
                provider.stop(node_id).await?;
                tracing::info!(node_id = %node_id, "Source host stopped");
            }
        }
        Ok(())
    }

    /// Best-effort teardown; runs once
    pub async fn destroy(&self) -> CleanupReport {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return CleanupReport::default();
        }
        tracing::info!("Tearing down orchestrator");

        let report = CleanupPlan::new()
            .step("dump stats", async {
                self.dump_stats();
                Ok(())
            })
            .step("broadcast shutdown", async {
                let directive = self.shutdown_directive();
                self.control
                    .send(MessageType::CmdWorkerShutdown, directive.to_json())
                    .await?;
                Ok(())
            })
            .step("archive logs", self.archive_logs())
            .step("stop dispatcher", async {
                self.dispatcher.stop();
                Ok(())
            })
            .step("stop fleet monitor", async {
                let monitor = self.fleet.lock().clone();
                if let Some(monitor) = monitor {
                    monitor.stop();
                }
                self.background.cancel();
                Ok(())
            })
            .step("stop control channel", async {
                self.control.stop().await?;
                Ok(())
            })
            .step("close queue", async {
                self.queue.close().await?;
                Ok(())
            })
            .step("terminate nodes", self.terminate_owned_nodes())
            .step("stop source host", self.stop_source_host())
            .run()
            .await;

        tracing::info!(completed = report.completed.len(), failed = report.failed.len(), "Teardown finished");
        report
    }
}

#[async_trait::async_trait]
impl ControlHandler for Orchestrator {
    async fn handle(&self, message: ControlMessage) {
        self.on_control_message(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LocalArchive;
    use crate::control::{codec, Identity, MemoryControlBus, WorkerSummary};
    use crate::manifest::{ManifestEntry, ManifestSourceConfig};
    use crate::queue::MemoryWorkQueue;
    use crate::worker::command::CommandOutcome;
    use std::collections::VecDeque;
    use std::io;
    use tempfile::{tempdir, TempDir};

    struct FixedSource(std::result::Result<Vec<ManifestEntry>, GenerationError>);

    #[async_trait::async_trait]
    impl ManifestSource for FixedSource {
        fn describe(&self) -> String {
            "fixed".into()
        }

        async fn produce(&self) -> std::result::Result<Vec<ManifestEntry>, GenerationError> {
            self.0.clone()
        }
    }

    /// Produces `count` files after a delay
    struct SlowSource {
        delay: Duration,
        count: usize,
    }

    #[async_trait::async_trait]
    impl ManifestSource for SlowSource {
        fn describe(&self) -> String {
            "slow".into()
        }

        async fn produce(&self) -> std::result::Result<Vec<ManifestEntry>, GenerationError> {
            tokio::time::sleep(self.delay).await;
            Ok((0..self.count)
                .map(|i| ManifestEntry::file(format!("/slow/{}.bin", i), 1))
                .collect())
        }
    }

    /// Returns scripted exit codes, then succeeds
    #[derive(Default)]
    struct HookRunner {
        exit_codes: parking_lot::Mutex<VecDeque<i32>>,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for HookRunner {
        async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutcome> {
            self.calls.lock().push(spec.to_string());
            let exit_code = self.exit_codes.lock().pop_front().unwrap_or(0);
            Ok(CommandOutcome {
                command: spec.to_string(),
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct Harness {
        bus: Arc<MemoryControlBus>,
        queue: Arc<MemoryWorkQueue>,
        runner: Arc<HookRunner>,
        orchestrator: Arc<Orchestrator>,
        dir: TempDir,
    }

    fn entries() -> Vec<ManifestEntry> {
        vec![
            ManifestEntry::container("/data"),
            ManifestEntry::file("/data/a.bin", 10),
            ManifestEntry::file("/data/b.bin", 20),
        ]
    }

    fn harness_with(
        expected: usize,
        tweak: impl FnOnce(&mut OrchestratorConfig),
        source: impl ManifestSource + 'static,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let bus = MemoryControlBus::new();
        let queue = Arc::new(MemoryWorkQueue::new());
        let runner = Arc::new(HookRunner::default());

        let mut config = OrchestratorConfig::new(expected, ManifestSourceConfig::Bucket { bucket: "src".into() });
        config.dispatch_threads = 2;
        config.error_report_log = Some(dir.path().join("errors.json"));
        config.source_host.poll_interval = Duration::from_millis(1);
        tweak(&mut config);

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                control: Arc::new(bus.channel(Identity::orchestrator("orch", "10.0.0.1"))),
                queue: Arc::clone(&queue) as Arc<dyn WorkQueue>,
                source: Arc::new(source),
                archive: Arc::new(LocalArchive::new(dir.path().join("archive"))),
                runner: Arc::clone(&runner) as Arc<dyn CommandRunner>,
                provider: None,
            },
        );

        Harness {
            bus,
            queue,
            runner,
            orchestrator,
            dir,
        }
    }

    fn harness(expected: usize) -> Harness {
        harness_with(expected, |_| {}, FixedSource(Ok(entries())))
    }

    fn from_worker(address: &str, message_type: MessageType, value: impl Into<String>) -> ControlMessage {
        ControlMessage::new(false, &format!("wkr-{}", address), address, message_type, value)
    }

    fn phase_msg(address: &str, phase: Phase) -> ControlMessage {
        from_worker(address, MessageType::WorkerCurrentPhase, phase.as_str())
    }

    fn finished(address: &str, phase: Phase, failed: u64) -> ControlMessage {
        let message_type = MessageType::finished_summary_for(phase).unwrap();
        from_worker(address, message_type, WorkerSummary::new(3, failed, 30, 0, 0).to_json())
    }

    fn error_report(address: &str) -> ControlMessage {
        let value = codec::compress_encode(&format!(r#"{{"worker":"{}","failures":[]}}"#, address)).unwrap();
        from_worker(address, MessageType::WorkerErrorReportDetails, value)
    }

    fn broadcasts(bus: &MemoryControlBus, message_type: MessageType) -> Vec<ControlMessage> {
        bus.published_of(message_type)
            .into_iter()
            .filter(|m| m.target_address_filter.is_none())
            .collect()
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn drive_to_write(h: &Harness, workers: &[&str]) {
        for w in workers {
            h.orchestrator.on_control_message(phase_msg(w, Phase::Initialized)).await;
        }
        assert_eq!(h.orchestrator.phase(), Phase::Write);
        let o = Arc::clone(&h.orchestrator);
        wait_until("write dispatch", move || o.dispatch_completed(Phase::Write)).await;
    }

    #[tokio::test]
    async fn test_write_starts_once_all_registered() {
        let h = harness(2);

        h.orchestrator.on_control_message(phase_msg("10.0.0.2", Phase::Initialized)).await;
        h.orchestrator.on_control_message(phase_msg("10.0.0.2", Phase::Initialized)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Initialized);

        h.orchestrator.on_control_message(phase_msg("10.0.0.3", Phase::Initialized)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Write);

        // Replays of the trigger do not re-trigger
        h.orchestrator.on_control_message(phase_msg("10.0.0.3", Phase::Initialized)).await;
        h.orchestrator.on_control_message(phase_msg("10.0.0.2", Phase::Initialized)).await;

        let writes: Vec<_> = broadcasts(&h.bus, MessageType::OrchestratorCurrentPhase)
            .into_iter()
            .filter(|m| m.value == "WRITE")
            .collect();
        assert_eq!(writes.len(), 1);

        let o = Arc::clone(&h.orchestrator);
        wait_until("write dispatch", move || o.dispatch_completed(Phase::Write)).await;
        assert_eq!(h.queue.queued_items().len(), 3);
        assert_eq!(broadcasts(&h.bus, MessageType::OrchestratorDispatchComplete).len(), 1);
    }

    #[tokio::test]
    async fn test_own_messages_ignored() {
        let h = harness(1);
        let own = ControlMessage::new(true, "orch", "10.0.0.1", MessageType::WorkerCurrentPhase, "INITIALIZED");
        h.orchestrator.on_control_message(own).await;

        assert_eq!(h.orchestrator.registry().size(), 0);
        assert_eq!(h.orchestrator.phase(), Phase::Initialized);
    }

    #[tokio::test]
    async fn test_clean_write_moves_to_validate_with_same_manifest() {
        let h = harness(2);
        drive_to_write(&h, &["10.0.0.2", "10.0.0.3"]).await;
        let written = h.queue.queued_items();

        h.orchestrator.on_control_message(finished("10.0.0.2", Phase::Write, 0)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Write);
        h.orchestrator.on_control_message(finished("10.0.0.3", Phase::Write, 0)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Validate);

        let o = Arc::clone(&h.orchestrator);
        wait_until("validate dispatch", move || o.dispatch_completed(Phase::Validate)).await;

        let all = h.queue.queued_items();
        let write_paths: HashSet<_> = written.iter().map(|i| i.path.clone()).collect();
        let validate_paths: HashSet<_> = all
            .iter()
            .filter(|i| i.mode == ItemMode::Validate)
            .map(|i| i.path.clone())
            .collect();
        assert_eq!(write_paths, validate_paths);
    }

    #[tokio::test]
    async fn test_write_errors_skip_validate() {
        let h = harness(2);
        drive_to_write(&h, &["10.0.0.2", "10.0.0.3"]).await;

        h.orchestrator.on_control_message(finished("10.0.0.2", Phase::Write, 1)).await;
        h.orchestrator.on_control_message(finished("10.0.0.3", Phase::Write, 0)).await;

        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);
    }

    #[tokio::test]
    async fn test_fail_fast_on_interim_error() {
        let h = harness_with(3, |c| c.fail_fast = true, FixedSource(Ok(entries())));
        drive_to_write(&h, &["a", "b", "c"]).await;

        let interim = from_worker(
            "a",
            MessageType::WorkerWritesCurrentSummary,
            WorkerSummary::new(1, 1, 10, 0, 0).to_json(),
        );
        h.orchestrator.on_control_message(interim).await;

        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);
        assert!(h.queue.queued_items().is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_dispatch_in_flight() {
        let h = harness_with(
            1,
            |c| c.fail_fast = true,
            SlowSource {
                delay: Duration::from_millis(300),
                count: 50,
            },
        );
        h.orchestrator.on_control_message(phase_msg("a", Phase::Initialized)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Write);

        let interim = from_worker(
            "a",
            MessageType::WorkerWritesCurrentSummary,
            WorkerSummary::new(0, 1, 0, 0, 0).to_json(),
        );
        h.orchestrator.on_control_message(interim).await;
        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.queue.queued_items().is_empty());
        assert!(h.bus.published_of(MessageType::OrchestratorDispatchComplete).is_empty());
        assert!(!h.orchestrator.dispatch_completed(Phase::Write));
        // Cancelled dispatch is not a fatal generation error
        assert_eq!(*h.orchestrator.handle().outcome.borrow(), RunOutcome::Running);
    }

    #[tokio::test]
    async fn test_fail_fast_on_interim_validate_error() {
        let h = harness_with(2, |c| c.fail_fast = true, FixedSource(Ok(entries())));
        drive_to_write(&h, &["a", "b"]).await;
        h.orchestrator.on_control_message(finished("a", Phase::Write, 0)).await;
        h.orchestrator.on_control_message(finished("b", Phase::Write, 0)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Validate);
        let o = Arc::clone(&h.orchestrator);
        wait_until("validate dispatch", move || o.dispatch_completed(Phase::Validate)).await;

        // A clean interim summary changes nothing
        let clean = from_worker(
            "b",
            MessageType::WorkerValidationsCurrentSummary,
            WorkerSummary::new(1, 0, 10, 0, 0).to_json(),
        );
        h.orchestrator.on_control_message(clean).await;
        assert_eq!(h.orchestrator.phase(), Phase::Validate);

        let failing = from_worker(
            "a",
            MessageType::WorkerValidationsCurrentSummary,
            WorkerSummary::new(1, 1, 10, 0, 0).to_json(),
        );
        h.orchestrator.on_control_message(failing).await;

        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);
        assert!(h.queue.queued_items().is_empty());
        assert_eq!(
            h.orchestrator.registry().workers_awaiting(Phase::Validate),
            vec!["a".to_string(), "b".to_string()]
        );
        let report_errors = broadcasts(&h.bus, MessageType::OrchestratorCurrentPhase)
            .into_iter()
            .filter(|m| m.value == "REPORT_ERRORS")
            .count();
        assert_eq!(report_errors, 1);
    }

    #[tokio::test]
    async fn test_monitor_errors_do_not_fail_the_phase() {
        let h = harness_with(2, |c| c.fail_fast = true, FixedSource(Ok(entries())));
        drive_to_write(&h, &["a", "b"]).await;

        let hiccup = WorkerSummary::new(3, 0, 30, 1, 0).to_json();
        h.orchestrator
            .on_control_message(from_worker("a", MessageType::WorkerWritesCurrentSummary, hiccup.clone()))
            .await;
        assert_eq!(h.orchestrator.phase(), Phase::Write);

        h.orchestrator
            .on_control_message(from_worker("a", MessageType::WorkerWritesFinishedSummary, hiccup.clone()))
            .await;
        h.orchestrator
            .on_control_message(from_worker("b", MessageType::WorkerWritesFinishedSummary, hiccup))
            .await;

        assert_eq!(h.orchestrator.phase(), Phase::Validate);
        assert_eq!(h.orchestrator.summary().monitor_errors, 2);
    }

    #[tokio::test]
    async fn test_clean_validate_shuts_down_directly() {
        let h = harness(2);
        drive_to_write(&h, &["a", "b"]).await;
        h.orchestrator.on_control_message(finished("a", Phase::Write, 0)).await;
        h.orchestrator.on_control_message(finished("b", Phase::Write, 0)).await;
        let o = Arc::clone(&h.orchestrator);
        wait_until("validate dispatch", move || o.dispatch_completed(Phase::Validate)).await;

        h.orchestrator.on_control_message(finished("a", Phase::Validate, 0)).await;
        assert_eq!(h.orchestrator.phase(), Phase::Validate);

        let last = finished("b", Phase::Validate, 0);
        let o1 = Arc::clone(&h.orchestrator);
        let o2 = Arc::clone(&h.orchestrator);
        let (m1, m2) = (last.clone(), last);
        tokio::join!(o1.on_control_message(m1), o2.on_control_message(m2));

        assert_eq!(h.orchestrator.phase(), Phase::Shutdown);
        assert_eq!(broadcasts(&h.bus, MessageType::CmdWorkerShutdown).len(), 1);
        assert_eq!(h.orchestrator.reports_persisted(), 1);
        assert!(broadcasts(&h.bus, MessageType::OrchestratorCurrentPhase)
            .iter()
            .all(|m| m.value != "REPORT_ERRORS"));
        assert!(h.orchestrator.summary().timings.validate_duration().is_some());

        let text = std::fs::read_to_string(h.dir.path().join("errors.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(parsed["errorReports"].as_array().unwrap().is_empty());

        // A late heartbeat gets the directive again, targeted
        h.orchestrator.on_control_message(phase_msg("a", Phase::Validate)).await;
        let targeted = h
            .bus
            .published_of(MessageType::CmdWorkerShutdown)
            .into_iter()
            .filter(|m| m.target_address_filter.as_deref() == Some("a"))
            .count();
        assert_eq!(targeted, 1);
    }

    #[tokio::test]
    async fn test_validate_errors_collect_reports() {
        let h = harness(1);
        drive_to_write(&h, &["a"]).await;
        h.orchestrator.on_control_message(finished("a", Phase::Write, 0)).await;
        let o = Arc::clone(&h.orchestrator);
        wait_until("validate dispatch", move || o.dispatch_completed(Phase::Validate)).await;

        h.orchestrator.on_control_message(finished("a", Phase::Validate, 2)).await;
        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);
        assert!(broadcasts(&h.bus, MessageType::CmdWorkerShutdown).is_empty());
    }

    #[tokio::test]
    async fn test_interim_error_without_fail_fast_keeps_waiting() {
        let h = harness(2);
        drive_to_write(&h, &["a", "b"]).await;

        let interim = from_worker(
            "a",
            MessageType::WorkerWritesCurrentSummary,
            WorkerSummary::new(1, 1, 10, 0, 0).to_json(),
        );
        h.orchestrator.on_control_message(interim).await;
        assert_eq!(h.orchestrator.phase(), Phase::Write);
    }

    #[tokio::test]
    async fn test_finalization_runs_once() {
        let h = harness(2);
        drive_to_write(&h, &["a", "b"]).await;
        h.orchestrator.on_control_message(finished("a", Phase::Write, 1)).await;
        h.orchestrator.on_control_message(finished("b", Phase::Write, 0)).await;
        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);

        h.orchestrator.on_control_message(error_report("a")).await;
        assert_eq!(h.orchestrator.phase(), Phase::ReportErrors);

        let last = error_report("b");
        let o1 = Arc::clone(&h.orchestrator);
        let o2 = Arc::clone(&h.orchestrator);
        let (m1, m2) = (last.clone(), last);
        tokio::join!(o1.on_control_message(m1), o2.on_control_message(m2));

        assert_eq!(h.orchestrator.phase(), Phase::Shutdown);
        assert_eq!(h.orchestrator.reports_persisted(), 1);
        assert_eq!(broadcasts(&h.bus, MessageType::CmdWorkerShutdown).len(), 1);

        let text = std::fs::read_to_string(h.dir.path().join("errors.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["errorReports"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lagging_heartbeat_gets_targeted_phase() {
        let h = harness(1);
        drive_to_write(&h, &["a"]).await;

        h.orchestrator.on_control_message(phase_msg("a", Phase::Initialized)).await;
        let targeted: Vec<_> = h
            .bus
            .published_of(MessageType::OrchestratorCurrentPhase)
            .into_iter()
            .filter(|m| m.target_address_filter.as_deref() == Some("a"))
            .collect();
        assert_eq!(targeted.len(), 1);
        assert_eq!(targeted[0].value, "WRITE");

        h.orchestrator.on_control_message(phase_msg("a", Phase::Write)).await;
        let resent = h
            .bus
            .published_of(MessageType::OrchestratorDispatchComplete)
            .into_iter()
            .filter(|m| m.target_address_filter.as_deref() == Some("a"))
            .count();
        assert_eq!(resent, 1);
    }

    #[tokio::test]
    async fn test_generation_error_is_fatal() {
        let h = harness_with(
            1,
            |_| {},
            FixedSource(Err(GenerationError::SourceUnreadable {
                path: "/missing".into(),
                reason: "gone".into(),
            })),
        );
        let handle = h.orchestrator.handle();
        h.orchestrator.on_control_message(phase_msg("a", Phase::Initialized)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.terminated())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(_)));
        // Teardown broadcasts a shutdown directive
        assert_eq!(broadcasts(&h.bus, MessageType::CmdWorkerShutdown).len(), 1);
    }

    #[tokio::test]
    async fn test_post_start_hook_retries() {
        let h = harness_with(
            1,
            |c| c.source_host.post_start_command = Some("mount -a".into()),
            FixedSource(Ok(entries())),
        );
        h.runner.exit_codes.lock().extend([1, 1]);

        h.orchestrator.start().await.unwrap();
        assert_eq!(h.runner.calls.lock().len(), 3);
        assert_eq!(broadcasts(&h.bus, MessageType::OrchestratorCurrentPhase)[0].value, "INITIALIZED");
        h.orchestrator.destroy().await;
    }

    #[tokio::test]
    async fn test_post_start_hook_exhausted_aborts_start() {
        let h = harness_with(
            1,
            |c| c.source_host.post_start_command = Some("mount -a".into()),
            FixedSource(Ok(entries())),
        );
        h.runner.exit_codes.lock().extend([2, 2, 2]);

        let err = h.orchestrator.start().await.err().unwrap();
        assert!(err.to_string().contains("mount -a"));
        assert!(broadcasts(&h.bus, MessageType::OrchestratorCurrentPhase).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_runs_every_step_once() {
        let h = harness(1);
        let report = h.orchestrator.destroy().await;
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.completed.len(), 9);

        assert!(h.orchestrator.destroy().await.completed.is_empty());
    }
}
