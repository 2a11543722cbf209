//! Worker node main loop
//!
//! A worker follows the orchestrator's phase announcements:
//!
//! - INITIALIZED: announce itself and wait
//! - WRITE / VALIDATE: pop items, execute, acknowledge; send interim
//!   summaries on an interval; once the orchestrator has announced that the
//!   phase's dispatch is complete and the queue has stayed empty for a few
//!   polls, send the finished summary
//! - REPORT_ERRORS: submit the compressed error report
//!
//! The current phase is re-announced on every heartbeat, together with the
//! finished summary or error report already sent, so lost broadcasts are
//! recovered. A shutdown directive addressed to this worker ends the loop
//! after its log files are archived.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::executor::TaskExecutor;
use super::state::WorkerState;
use crate::archive::{resolve_log_files, ArchivalStore};
use crate::control::{ControlChannel, ControlHandler, ControlMessage, MessageType, Phase, ShutdownDirective, WorkerSummary};
use crate::error::Result;
use crate::queue::WorkQueue;

/// Worker loop timing
#[derive(Debug, Clone)]
pub struct WorkerNodeConfig {
    /// How long one queue pop waits
    pub poll_timeout: Duration,
    /// Consecutive empty polls after dispatch completion before the phase is finished
    pub idle_polls_to_finish: u32,
    /// Interval between interim summaries
    pub summary_interval: Duration,
    /// Interval between phase re-announcements
    pub heartbeat_interval: Duration,
    /// Directory worker log file names are resolved against
    pub log_dir: PathBuf,
}

impl Default for WorkerNodeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            idle_polls_to_finish: 3,
            summary_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            log_dir: PathBuf::from("."),
        }
    }
}

/// Progress information during worker operation
#[derive(Debug, Clone)]
pub struct WorkerProgress {
    pub phase: Phase,
    pub items_ok: u64,
    pub items_failed: u64,
    pub bytes: u64,
    /// Item just finished
    pub current_item: Option<String>,
    pub elapsed: Duration,
}

/// Final statistics from a worker run
#[derive(Debug, Clone)]
pub struct WorkerRunStats {
    pub write: WorkerSummary,
    pub validate: WorkerSummary,
    pub failures: usize,
    /// Log files archived at shutdown
    pub archived: usize,
    pub duration: Duration,
}

#[derive(Debug)]
struct Directives {
    phase: Phase,
    dispatch_complete: HashSet<Phase>,
    shutdown: Option<ShutdownDirective>,
}

/// Orchestrator directives as received on the control channel
struct Inbox {
    address: String,
    directives: Mutex<Directives>,
    wake: Notify,
}

impl Inbox {
    fn snapshot(&self, phase: Phase) -> (Phase, bool, Option<ShutdownDirective>) {
        let d = self.directives.lock();
        (d.phase, d.dispatch_complete.contains(&phase), d.shutdown.clone())
    }
}

#[async_trait::async_trait]
impl ControlHandler for Inbox {
    async fn handle(&self, message: ControlMessage) {
        if !message.from_orchestrator || !message.is_for(&self.address) {
            return;
        }

        match message.message_type {
            MessageType::OrchestratorCurrentPhase => match message.phase_value() {
                Ok(phase) => {
                    let mut d = self.directives.lock();
                    if phase > d.phase {
                        d.phase = phase;
                    }
                }
                Err(e) => tracing::warn!("Ignoring phase announcement: {}", e),
            },
            MessageType::OrchestratorDispatchComplete => match message.phase_value() {
                Ok(phase) => {
                    self.directives.lock().dispatch_complete.insert(phase);
                }
                Err(e) => tracing::warn!("Ignoring dispatch announcement: {}", e),
            },
            MessageType::CmdWorkerShutdown => match ShutdownDirective::from_json(&message.value) {
                Ok(directive) => {
                    self.directives.lock().shutdown.get_or_insert(directive);
                }
                Err(e) => tracing::warn!("Ignoring shutdown command: {}", e),
            },
            _ => return,
        }

        self.wake.notify_one();
    }
}

/// One worker process
pub struct WorkerNode {
    config: WorkerNodeConfig,
    channel: Arc<dyn ControlChannel>,
    queue: Arc<dyn WorkQueue>,
    executor: TaskExecutor,
    archive: Arc<dyn ArchivalStore>,
    state: Arc<WorkerState>,
    inbox: Arc<Inbox>,
    cancel: CancellationToken,
}

impl WorkerNode {
    pub fn new(
        config: WorkerNodeConfig,
        channel: Arc<dyn ControlChannel>,
        queue: Arc<dyn WorkQueue>,
        executor: TaskExecutor,
        archive: Arc<dyn ArchivalStore>,
    ) -> Self {
        let inbox = Arc::new(Inbox {
            address: channel.identity().address.clone(),
            directives: Mutex::new(Directives {
                phase: Phase::Initialized,
                dispatch_complete: HashSet::new(),
                shutdown: None,
            }),
            wake: Notify::new(),
        });

        Self {
            config,
            channel,
            queue,
            executor,
            archive,
            state: Arc::new(WorkerState::new()),
            inbox,
            cancel: CancellationToken::new(),
        }
    }

    /// Accumulated outcomes
    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    /// Signal shutdown
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn address(&self) -> &str {
        &self.channel.identity().address
    }

    async fn send(&self, message_type: MessageType, value: String) {
        if let Err(e) = self.channel.send(message_type, value).await {
            self.state.note_monitor_error();
            tracing::warn!(message_type = ?message_type, "Failed to send control message: {}", e);
        }
    }

    async fn announce(&self, phase: Phase) {
        self.send(MessageType::WorkerCurrentPhase, phase.as_str().to_string()).await;
    }

    async fn send_summary(&self, message_type: Option<MessageType>, phase: Phase) {
        if let Some(message_type) = message_type {
            self.send(message_type, self.state.summary(phase).to_json()).await;
        }
    }

    async fn submit_error_report(&self) {
        match self.state.compressed_error_report(self.address()) {
            Ok(value) => self.send(MessageType::WorkerErrorReportDetails, value).await,
            Err(e) => {
                self.state.note_monitor_error();
                tracing::error!("Failed to encode error report: {}", e);
            }
        }
    }

    fn progress(&self, phase: Phase, current_item: Option<String>, start: Instant) -> WorkerProgress {
        let summary = self.state.summary(phase);
        WorkerProgress {
            phase,
            items_ok: summary.ok,
            items_failed: summary.failed,
            bytes: summary.bytes,
            current_item,
            elapsed: start.elapsed(),
        }
    }

    /// Run until a shutdown directive arrives or [`stop`](Self::stop) is called
    pub async fn run<F>(&self, progress_callback: F) -> Result<WorkerRunStats>
    where
        F: Fn(&WorkerProgress) + Send + Sync,
    {
        let start = Instant::now();
        let consumer = self.channel.identity().source_id.clone();

        self.channel
            .listen(Arc::clone(&self.inbox) as Arc<dyn ControlHandler>)
            .await?;

        let mut phase = Phase::Initialized;
        self.announce(phase).await;
        tracing::info!(address = %self.address(), "Worker registered, waiting for orchestrator");

        let mut last_heartbeat = Instant::now();
        let mut last_summary = Instant::now();
        let mut idle_polls = 0u32;
        let mut finished: Option<Phase> = None;

        let directive = loop {
            if self.cancel.is_cancelled() {
                break None;
            }

            let (target, dispatched, shutdown) = self.inbox.snapshot(phase);
            if let Some(directive) = shutdown {
                break Some(directive);
            }

            if target > phase {
                tracing::info!(from = %phase, to = %target, "Phase change");
                phase = target;
                idle_polls = 0;
                finished = None;
                last_summary = Instant::now();
                self.announce(phase).await;
                if phase == Phase::ReportErrors {
                    self.submit_error_report().await;
                }
                continue;
            }

            match phase {
                Phase::Write | Phase::Validate => {
                    let popped = tokio::select! {
                        () = self.cancel.cancelled() => continue,
                        popped = self.queue.pop(&consumer, self.config.poll_timeout) => popped,
                    };

                    match popped {
                        Ok(Some(queued)) => {
                            idle_polls = 0;
                            if finished == Some(phase) {
                                // Redelivered work after finishing: report again once idle
                                finished = None;
                            }

                            let result = self.executor.execute(&queued.item).await;
                            if !result.success {
                                tracing::warn!(
                                    path = %result.path,
                                    step = ?result.failed_step,
                                    "Work item failed"
                                );
                            }
                            self.state.record(result);

                            if let Err(e) = self.queue.ack(&queued.receipt).await {
                                self.state.note_monitor_error();
                                tracing::warn!(receipt = %queued.receipt, "Failed to acknowledge item: {}", e);
                            }
                            progress_callback(&self.progress(phase, Some(queued.item.path), start));
                        }
                        Ok(None) => {
                            idle_polls += 1;
                            if finished != Some(phase)
                                && dispatched
                                && idle_polls >= self.config.idle_polls_to_finish
                            {
                                self.send_summary(MessageType::finished_summary_for(phase), phase).await;
                                finished = Some(phase);
                                let summary = self.state.summary(phase);
                                tracing::info!(
                                    phase = %phase,
                                    ok = summary.ok,
                                    failed = summary.failed,
                                    "Finished phase"
                                );
                                progress_callback(&self.progress(phase, None, start));
                            }
                        }
                        Err(e) => {
                            self.state.note_monitor_error();
                            tracing::warn!("Queue poll failed: {}", e);
                            tokio::time::sleep(self.config.poll_timeout).await;
                        }
                    }

                    if finished != Some(phase) && last_summary.elapsed() >= self.config.summary_interval {
                        self.send_summary(MessageType::current_summary_for(phase), phase).await;
                        last_summary = Instant::now();
                    }
                }
                _ => {
                    tokio::select! {
                        () = self.cancel.cancelled() => {}
                        () = self.inbox.wake.notified() => {}
                        () = tokio::time::sleep(self.config.poll_timeout) => {}
                    }
                }
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.announce(phase).await;
                if finished == Some(phase) {
                    self.send_summary(MessageType::finished_summary_for(phase), phase).await;
                }
                if phase == Phase::ReportErrors {
                    self.submit_error_report().await;
                }
                last_heartbeat = Instant::now();
            }
        };

        if let Err(e) = self.channel.stop().await {
            tracing::warn!("Failed to stop control channel: {}", e);
        }

        let mut archived = 0;
        if let Some(directive) = directive {
            tracing::info!(
                bucket = %directive.bucket,
                folder_root = %directive.folder_root,
                "Shutdown directive received, archiving logs"
            );
            let files = resolve_log_files(&self.config.log_dir, &directive.worker_log_files);
            match self
                .archive
                .upload(&directive.bucket, &directive.folder_root, self.address(), &files)
                .await
            {
                Ok(count) => archived = count,
                Err(e) => tracing::warn!("Failed to archive worker logs: {}", e),
            }
        }

        Ok(WorkerRunStats {
            write: self.state.summary(Phase::Write),
            validate: self.state.summary(Phase::Validate),
            failures: self.state.failure_count(),
            archived,
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::LocalArchive;
    use crate::control::{Identity, MemoryControlBus};
    use crate::manifest::{ItemMode, ManifestEntry, WorkItem};
    use crate::queue::MemoryWorkQueue;
    use crate::worker::{ExecutorConfig, ProcessRunner};
    use tempfile::tempdir;

    fn fast_config(log_dir: PathBuf) -> WorkerNodeConfig {
        WorkerNodeConfig {
            poll_timeout: Duration::from_millis(20),
            idle_polls_to_finish: 2,
            summary_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            log_dir,
        }
    }

    #[tokio::test]
    async fn test_worker_copies_and_reports_finished() {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();
        let logs = tempdir().unwrap();
        let archive_base = tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(logs.path().join("worker.log"), b"log").unwrap();

        let bus = MemoryControlBus::new();
        let orchestrator = bus.channel(Identity::orchestrator("orch", "10.0.0.1"));
        let queue = Arc::new(MemoryWorkQueue::new());

        let executor = TaskExecutor::new(
            ExecutorConfig::new(source.path().to_path_buf(), target.path().to_path_buf()),
            Arc::new(ProcessRunner::default()),
        );
        let node = Arc::new(WorkerNode::new(
            fast_config(logs.path().to_path_buf()),
            Arc::new(bus.channel(Identity::worker("w1", "10.0.0.2"))),
            queue.clone(),
            executor,
            Arc::new(LocalArchive::new(archive_base.path())),
        ));

        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(|_| {}).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bus.published_of(MessageType::WorkerCurrentPhase).is_empty());

        queue
            .push(WorkItem::from_entry(&ManifestEntry::file("/a.txt", 5), ItemMode::Write))
            .await
            .unwrap();
        orchestrator
            .send(MessageType::OrchestratorCurrentPhase, "WRITE".into())
            .await
            .unwrap();
        orchestrator
            .send(MessageType::OrchestratorDispatchComplete, "WRITE".into())
            .await
            .unwrap();

        let mut finished = Vec::new();
        for _ in 0..100 {
            finished = bus.published_of(MessageType::WorkerWritesFinishedSummary);
            if !finished.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!finished.is_empty(), "worker never finished WRITE");
        let summary = finished[0].summary_value().unwrap();
        assert_eq!(summary.ok, 1);
        assert!(!summary.has_errors);
        assert_eq!(std::fs::read(target.path().join("a.txt")).unwrap(), b"alpha");

        let directive = ShutdownDirective::new("logs", vec!["worker.log".into()]);
        orchestrator
            .send_to("10.0.0.2", MessageType::CmdWorkerShutdown, directive.to_json())
            .await
            .unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.write.ok, 1);
        assert_eq!(stats.archived, 1);
        assert!(archive_base
            .path()
            .join("logs")
            .join(&directive.folder_root)
            .join("10.0.0.2")
            .join("worker.log")
            .exists());
    }

    #[tokio::test]
    async fn test_worker_ignores_shutdown_for_other_address() {
        let bus = MemoryControlBus::new();
        let orchestrator = bus.channel(Identity::orchestrator("orch", "10.0.0.1"));
        let dir = tempdir().unwrap();

        let node = Arc::new(WorkerNode::new(
            fast_config(dir.path().to_path_buf()),
            Arc::new(bus.channel(Identity::worker("w1", "10.0.0.2"))),
            Arc::new(MemoryWorkQueue::new()),
            TaskExecutor::new(
                ExecutorConfig::new(dir.path().to_path_buf(), dir.path().to_path_buf()),
                Arc::new(ProcessRunner::default()),
            ),
            Arc::new(LocalArchive::new(dir.path())),
        ));
        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(|_| {}).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let directive = ShutdownDirective::new("logs", Vec::new());
        orchestrator
            .send_to("10.0.0.99", MessageType::CmdWorkerShutdown, directive.to_json())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_finished());

        node.stop();
        let stats = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.archived, 0);
    }
}
