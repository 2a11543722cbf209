//! Integration tests for bucket-loader
//!
//! Whole runs driven through the in-memory control bus and work queue. No
//! Redis server is needed.

use bucket_loader::archive::LocalArchive;
use bucket_loader::config::OrchestratorConfig;
use bucket_loader::control::{
    codec, ControlChannel, ControlMessage, Identity, MemoryControlBus, MemoryControlChannel, MessageType, Phase,
    WorkerSummary,
};
use bucket_loader::coordinator::{
    Collaborators, ComputeProvider, NodeHealth, NodeInfo, Orchestrator, RunOutcome,
};
use bucket_loader::error::FleetResult;
use bucket_loader::manifest::{DirectoryCrawler, ItemMode, ManifestSourceConfig};
use bucket_loader::queue::{MemoryWorkQueue, WorkQueue};
use bucket_loader::worker::{ExecutorConfig, ProcessRunner, TaskExecutor, WorkerNode, WorkerNodeConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn broadcasts(bus: &MemoryControlBus, message_type: MessageType) -> Vec<ControlMessage> {
    bus.published_of(message_type)
        .into_iter()
        .filter(|m| m.target_address_filter.is_none())
        .collect()
}

fn source_tree() -> TempDir {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("docs/2024")).unwrap();
    std::fs::create_dir_all(dir.path().join("media")).unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"top level").unwrap();
    std::fs::write(dir.path().join("docs/2024/report.csv"), b"a,b,c\n1,2,3\n").unwrap();
    std::fs::write(dir.path().join("docs/notes.md"), b"# notes").unwrap();
    std::fs::write(dir.path().join("media/clip.bin"), vec![7u8; 4096]).unwrap();
    dir
}

/// Orchestrator wired to in-memory transports
struct Master {
    bus: Arc<MemoryControlBus>,
    queue: Arc<MemoryWorkQueue>,
    orchestrator: Arc<Orchestrator>,
    work: TempDir,
}

fn master(
    expected: usize,
    source_root: &Path,
    tweak: impl FnOnce(&mut OrchestratorConfig),
    provider: Option<Arc<dyn ComputeProvider>>,
) -> Master {
    let work = tempdir().unwrap();
    let bus = MemoryControlBus::new();
    let queue = Arc::new(MemoryWorkQueue::new());

    let mut config = OrchestratorConfig::new(
        expected,
        ManifestSourceConfig::Crawl {
            root: source_root.to_path_buf(),
            modified_after: None,
            exclude: Vec::new(),
        },
    );
    config.dispatch_threads = 3;
    config.stats_interval = Duration::from_millis(200);
    config.error_report_log = Some(work.path().join("errors.json"));
    config.archive_bucket = "run-logs".into();
    config.worker_log_files = vec!["worker.log".into()];
    tweak(&mut config);

    let source = config.source.build(None).unwrap();
    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            control: Arc::new(bus.channel(Identity::orchestrator("orch", "10.0.0.1"))),
            queue: Arc::clone(&queue) as Arc<dyn WorkQueue>,
            source,
            archive: Arc::new(LocalArchive::new(work.path().join("archive"))),
            runner: Arc::new(ProcessRunner::default()),
            provider,
        },
    );

    Master {
        bus,
        queue,
        orchestrator,
        work,
    }
}

/// A worker simulated by publishing its messages directly
struct FakeWorker {
    channel: MemoryControlChannel,
}

impl FakeWorker {
    fn new(bus: &Arc<MemoryControlBus>, address: &str) -> Self {
        Self {
            channel: bus.channel(Identity::worker(&format!("wkr-{}", address), address)),
        }
    }

    async fn announce(&self, phase: Phase) {
        self.channel
            .send(MessageType::WorkerCurrentPhase, phase.as_str().to_string())
            .await
            .unwrap();
    }

    async fn finished(&self, phase: Phase, failed: u64) {
        let summary = WorkerSummary::new(2, failed, 64, 0, 0);
        self.channel
            .send(MessageType::finished_summary_for(phase).unwrap(), summary.to_json())
            .await
            .unwrap();
    }

    async fn interim(&self, phase: Phase, failed: u64) {
        let summary = WorkerSummary::new(1, failed, 32, 0, 0);
        self.channel
            .send(MessageType::current_summary_for(phase).unwrap(), summary.to_json())
            .await
            .unwrap();
    }

    async fn error_report(&self) {
        let address = &self.channel.identity().address;
        let value = codec::compress_encode(&format!(r#"{{"worker":"{}","failures":[]}}"#, address)).unwrap();
        self.channel
            .send(MessageType::WorkerErrorReportDetails, value)
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_workers_full_run_with_duplicates() {
    let source = source_tree();
    let m = master(3, source.path(), |_| {}, None);
    m.orchestrator.start().await.unwrap();

    let workers: Vec<FakeWorker> = ["10.0.0.2", "10.0.0.3", "10.0.0.4"]
        .iter()
        .map(|a| FakeWorker::new(&m.bus, a))
        .collect();

    for w in &workers {
        w.announce(Phase::Initialized).await;
    }
    let o = Arc::clone(&m.orchestrator);
    wait_until("WRITE", move || o.phase() == Phase::Write).await;

    // Replayed registrations do not re-trigger WRITE
    for w in &workers {
        w.announce(Phase::Initialized).await;
    }

    let o = Arc::clone(&m.orchestrator);
    wait_until("WRITE dispatch", move || o.dispatch_completed(Phase::Write)).await;
    let write_paths: HashSet<String> = m.queue.queued_items().into_iter().map(|i| i.path).collect();
    // 3 directories + 4 files
    assert_eq!(write_paths.len(), 7);

    for w in &workers {
        w.finished(Phase::Write, 0).await;
    }
    let o = Arc::clone(&m.orchestrator);
    wait_until("VALIDATE", move || o.phase() == Phase::Validate).await;
    let o = Arc::clone(&m.orchestrator);
    wait_until("VALIDATE dispatch", move || o.dispatch_completed(Phase::Validate)).await;

    let validate_paths: HashSet<String> = m
        .queue
        .queued_items()
        .into_iter()
        .filter(|i| i.mode == ItemMode::Validate)
        .map(|i| i.path)
        .collect();
    assert_eq!(write_paths, validate_paths);

    for w in &workers {
        w.finished(Phase::Validate, 0).await;
    }
    // At-least-once delivery: the last finished summary arrives again
    workers[2].finished(Phase::Validate, 0).await;
    workers[2].finished(Phase::Validate, 0).await;

    // Clean validation goes straight to shutdown, no error report round
    let o = Arc::clone(&m.orchestrator);
    wait_until("SHUTDOWN", move || o.phase() == Phase::Shutdown).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let writes = broadcasts(&m.bus, MessageType::OrchestratorCurrentPhase)
        .into_iter()
        .filter(|msg| msg.value == "WRITE")
        .count();
    assert_eq!(writes, 1);
    assert!(broadcasts(&m.bus, MessageType::OrchestratorCurrentPhase)
        .iter()
        .all(|msg| msg.value != "REPORT_ERRORS"));
    assert_eq!(broadcasts(&m.bus, MessageType::CmdWorkerShutdown).len(), 1);
    assert_eq!(m.orchestrator.reports_persisted(), 1);

    let summary = m.orchestrator.summary();
    assert_eq!(summary.written, 6);
    assert_eq!(summary.validated, 6);
    assert!(summary.timings.write_duration().is_some());
    assert!(summary.timings.validate_duration().is_some());

    let text = std::fs::read_to_string(m.work.path().join("errors.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(parsed["errorReports"].as_array().unwrap().is_empty());

    m.orchestrator.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_fast_with_workers_still_writing() {
    let source = source_tree();
    let m = master(5, source.path(), |c| c.fail_fast = true, None);
    m.orchestrator.start().await.unwrap();

    let workers: Vec<FakeWorker> = (2..7)
        .map(|i| FakeWorker::new(&m.bus, &format!("10.0.0.{}", i)))
        .collect();
    for w in &workers {
        w.announce(Phase::Initialized).await;
    }
    let o = Arc::clone(&m.orchestrator);
    wait_until("WRITE", move || o.phase() == Phase::Write).await;

    for w in &workers[..3] {
        w.finished(Phase::Write, 0).await;
    }
    workers[3].interim(Phase::Write, 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(m.orchestrator.phase(), Phase::Write);

    workers[4].interim(Phase::Write, 2).await;
    let o = Arc::clone(&m.orchestrator);
    wait_until("REPORT_ERRORS", move || o.phase() == Phase::ReportErrors).await;

    let awaiting = m.orchestrator.registry().workers_awaiting(Phase::Write);
    assert_eq!(awaiting, vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]);
    assert!(broadcasts(&m.bus, MessageType::OrchestratorCurrentPhase)
        .iter()
        .all(|msg| msg.value != "VALIDATE"));
    let queue = Arc::clone(&m.queue);
    wait_until("queue drained", move || queue.queued_items().is_empty()).await;

    for w in &workers {
        w.error_report().await;
    }
    workers[0].error_report().await;
    let o = Arc::clone(&m.orchestrator);
    wait_until("SHUTDOWN", move || o.phase() == Phase::Shutdown).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broadcasts(&m.bus, MessageType::CmdWorkerShutdown).len(), 1);
    let text = std::fs::read_to_string(m.work.path().join("errors.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["errorReports"].as_array().unwrap().len(), 5);

    m.orchestrator.destroy().await;
}

/// Provider whose nodes get fixed private addresses
#[derive(Default)]
struct StaticProvider {
    terminated: Mutex<Vec<String>>,
    tags: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ComputeProvider for StaticProvider {
    async fn launch(&self, count: usize) -> FleetResult<Vec<String>> {
        Ok((0..count).map(|i| format!("node-{}", i)).collect())
    }

    async fn tag(&self, _node_ids: &[String], tag: &str) -> FleetResult<()> {
        self.tags.lock().push(tag.to_string());
        Ok(())
    }

    async fn describe(&self, node_ids: &[String]) -> FleetResult<Vec<NodeInfo>> {
        Ok(node_ids
            .iter()
            .map(|id| NodeInfo {
                id: id.clone(),
                private_address: Some(format!("10.0.1.{}", id.trim_start_matches("node-"))),
                health: NodeHealth::Healthy,
            })
            .collect())
    }

    async fn terminate(&self, node_id: &str) -> FleetResult<()> {
        self.terminated.lock().push(node_id.to_string());
        Ok(())
    }

    async fn start(&self, _node_id: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn stop(&self, _node_id: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn is_running(&self, _node_id: &str) -> FleetResult<bool> {
        Ok(true)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_straggler_retired_unblocks_registration() {
    let source = source_tree();
    let provider = Arc::new(StaticProvider::default());
    let m = master(
        3,
        source.path(),
        |c| {
            c.self_managed_fleet = true;
            c.registration_grace = Duration::from_millis(100);
            c.monitor_interval = Duration::from_millis(20);
            c.straggler_pause = Duration::from_millis(1);
        },
        Some(Arc::clone(&provider) as Arc<dyn ComputeProvider>),
    );
    m.orchestrator.start().await.unwrap();
    assert_eq!(provider.tags.lock().len(), 1);
    assert!(provider.tags.lock()[0].starts_with("bktldr-wkr-"));

    let a = FakeWorker::new(&m.bus, "10.0.1.0");
    let b = FakeWorker::new(&m.bus, "10.0.1.1");
    a.announce(Phase::Initialized).await;
    b.announce(Phase::Initialized).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(m.orchestrator.phase(), Phase::Initialized);

    let o = Arc::clone(&m.orchestrator);
    wait_until("straggler retired", move || o.expected_workers() == 2).await;
    assert_eq!(*provider.terminated.lock(), vec!["node-2".to_string()]);

    let targeted: Vec<ControlMessage> = m
        .bus
        .published_of(MessageType::CmdWorkerShutdown)
        .into_iter()
        .filter(|msg| msg.target_address_filter.is_some())
        .collect();
    assert_eq!(targeted.len(), 1);
    assert_eq!(targeted[0].target_address_filter.as_deref(), Some("10.0.1.2"));

    // Next heartbeat re-evaluates the barrier
    a.announce(Phase::Initialized).await;
    let o = Arc::clone(&m.orchestrator);
    wait_until("WRITE", move || o.phase() == Phase::Write).await;

    m.orchestrator.destroy().await;
    let terminated = provider.terminated.lock().clone();
    assert!(terminated.contains(&"node-0".to_string()));
    assert!(terminated.contains(&"node-1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generation_failure_ends_run() {
    let m = master(
        1,
        Path::new("/nonexistent/source/root"),
        |_| {},
        None,
    );
    let handle = m.orchestrator.start().await.unwrap();

    FakeWorker::new(&m.bus, "10.0.0.2").announce(Phase::Initialized).await;

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.terminated())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Failed(_)));
    assert_eq!(m.orchestrator.phase(), Phase::Write);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_replication_with_real_workers() {
    let source = source_tree();
    let m = master(
        2,
        source.path(),
        |c| c.auto_shutdown = Some(Duration::from_millis(50)),
        None,
    );
    let handle = m.orchestrator.start().await.unwrap();

    let target = tempdir().unwrap();
    let mut runs = Vec::new();
    let mut logs = Vec::new();
    for address in ["10.0.0.21", "10.0.0.22"] {
        let log_dir = tempdir().unwrap();
        std::fs::write(log_dir.path().join("worker.log"), format!("log of {}", address)).unwrap();

        let mut executor_config = ExecutorConfig::new(source.path().to_path_buf(), target.path().to_path_buf());
        executor_config.retry_pause = Duration::from_millis(10);

        let node = WorkerNode::new(
            WorkerNodeConfig {
                poll_timeout: Duration::from_millis(20),
                idle_polls_to_finish: 3,
                summary_interval: Duration::from_millis(50),
                heartbeat_interval: Duration::from_millis(100),
                log_dir: log_dir.path().to_path_buf(),
            },
            Arc::new(m.bus.channel(Identity::worker(&format!("wkr-{}", address), address))),
            Arc::clone(&m.queue) as Arc<dyn WorkQueue>,
            TaskExecutor::new(executor_config, Arc::new(ProcessRunner::default())),
            Arc::new(LocalArchive::new(m.work.path().join("archive"))),
        );
        runs.push(tokio::spawn(async move { node.run(|_| {}).await }));
        logs.push(log_dir);
    }

    let outcome = tokio::time::timeout(Duration::from_secs(30), handle.terminated())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let mut written = 0;
    let mut validated = 0;
    for run in runs {
        let stats = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.archived, 1);
        written += stats.write.ok;
        validated += stats.validate.ok;
    }
    assert_eq!(written, 7);
    assert_eq!(validated, 7);

    assert_eq!(
        std::fs::read(target.path().join("docs/2024/report.csv")).unwrap(),
        b"a,b,c\n1,2,3\n"
    );
    assert_eq!(std::fs::read(target.path().join("media/clip.bin")).unwrap().len(), 4096);

    let archived_logs = walkdir::WalkDir::new(m.work.path().join("archive/run-logs"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() == "worker.log")
        .count();
    assert_eq!(archived_logs, 2);

    // The manifest the crawler produces is the one both phases used
    let direct = DirectoryCrawler::new(source.path().to_path_buf()).crawl().unwrap();
    let manifest = m.orchestrator.manifest().unwrap();
    assert_eq!(manifest.len(), direct.len());
}
