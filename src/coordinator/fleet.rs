//! Compute node lifecycle and the fleet resilience monitor
//!
//! The provisioning mechanics live behind [`ComputeProvider`]. The
//! [`FleetMonitor`] runs while the run is still INITIALIZED and retires nodes
//! that will never join:
//!
//! - nodes whose health check reports them impaired are terminated
//! - once the registration grace period has passed, nodes whose address
//!   never appeared in the registry are sent a targeted shutdown, given a
//!   moment, then terminated
//!
//! Every retired node lowers the expected worker count by one, which is what
//! lets a stalled INITIALIZED barrier complete.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::WorkerRegistry;
use crate::control::{ControlChannel, MessageType, Phase, ShutdownDirective};
use crate::error::{FleetError, FleetResult};

/// Node health as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    Impaired,
    /// Still initializing or not reported
    Unknown,
}

/// Provider view of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    pub private_address: Option<String>,
    pub health: NodeHealth,
}

/// Elastic compute node lifecycle operations
#[async_trait::async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch `count` nodes, returning their ids
    async fn launch(&self, count: usize) -> FleetResult<Vec<String>>;

    /// Attach a name tag to nodes
    async fn tag(&self, node_ids: &[String], tag: &str) -> FleetResult<()>;

    /// Health and address of each node
    async fn describe(&self, node_ids: &[String]) -> FleetResult<Vec<NodeInfo>>;

    /// Terminate a node
    async fn terminate(&self, node_id: &str) -> FleetResult<()>;

    /// Start a stopped node
    async fn start(&self, node_id: &str) -> FleetResult<()>;

    /// Stop a running node
    async fn stop(&self, node_id: &str) -> FleetResult<()>;

    /// Whether a node is running
    async fn is_running(&self, node_id: &str) -> FleetResult<bool>;
}

/// Name tag for worker nodes launched at `now`
pub fn worker_tag() -> String {
    format!("bktldr-wkr-{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Poll until a node is running, or fail after `timeout`
pub async fn wait_until_running(
    provider: &dyn ComputeProvider,
    node_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> FleetResult<()> {
    let start = Instant::now();
    loop {
        if provider.is_running(node_id).await? {
            tracing::info!(node_id, waited_ms = start.elapsed().as_millis() as u64, "Node is running");
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(FleetError::StartTimeout {
                node_id: node_id.to_string(),
                waited_secs: start.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Fleet monitor settings
#[derive(Debug, Clone)]
pub struct FleetMonitorConfig {
    /// Time between ticks
    pub interval: Duration,
    /// How long nodes get to register before they are retired
    pub grace_period: Duration,
    /// Pause between the targeted shutdown and termination
    pub shutdown_pause: Duration,
    /// Archival bucket named in the straggler shutdown directive
    pub archive_bucket: String,
    /// Worker log files named in the straggler shutdown directive
    pub worker_log_files: Vec<String>,
}

impl Default for FleetMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(600),
            shutdown_pause: Duration::from_secs(10),
            archive_bucket: String::new(),
            worker_log_files: Vec::new(),
        }
    }
}

/// What one tick retired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub impaired: Vec<String>,
    pub stragglers: Vec<String>,
}

/// Retires nodes that will never register a worker
pub struct FleetMonitor {
    config: FleetMonitorConfig,
    provider: Arc<dyn ComputeProvider>,
    registry: Arc<WorkerRegistry>,
    control: Arc<dyn ControlChannel>,
    expected_workers: Arc<AtomicUsize>,
    nodes: Vec<String>,
    retired: Mutex<HashSet<String>>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl FleetMonitor {
    pub fn new(
        config: FleetMonitorConfig,
        provider: Arc<dyn ComputeProvider>,
        registry: Arc<WorkerRegistry>,
        control: Arc<dyn ControlChannel>,
        expected_workers: Arc<AtomicUsize>,
        nodes: Vec<String>,
        started_at: Instant,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            control,
            expected_workers,
            nodes,
            retired: Mutex::new(HashSet::new()),
            started_at,
            cancel: CancellationToken::new(),
        }
    }

    /// Nodes not yet retired
    pub fn live_nodes(&self) -> Vec<String> {
        let retired = self.retired.lock();
        self.nodes.iter().filter(|id| !retired.contains(*id)).cloned().collect()
    }

    fn retire(&self, node_id: &str) {
        if self.retired.lock().insert(node_id.to_string()) {
            let _ = self
                .expected_workers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
            tracing::warn!(
                node_id,
                expected_workers = self.expected_workers.load(Ordering::SeqCst),
                "Node retired, expected worker count lowered"
            );
        }
    }

    /// One monitoring pass
    pub async fn tick(&self) -> FleetResult<TickReport> {
        let mut report = TickReport::default();
        let live = self.live_nodes();
        if live.is_empty() {
            return Ok(report);
        }

        let infos = self.provider.describe(&live).await?;

        for info in infos.iter().filter(|i| i.health == NodeHealth::Impaired) {
            tracing::warn!(node_id = %info.id, "Node impaired, terminating");
            match self.provider.terminate(&info.id).await {
                Ok(()) => {
                    self.retire(&info.id);
                    report.impaired.push(info.id.clone());
                }
                Err(e) => tracing::error!(node_id = %info.id, "Failed to terminate impaired node: {}", e),
            }
        }

        let registered = self.registry.addresses();
        let unregistered: Vec<&NodeInfo> = infos
            .iter()
            .filter(|i| i.health != NodeHealth::Impaired)
            .filter(|i| {
                i.private_address
                    .as_ref()
                    .map_or(true, |addr| !registered.contains(addr))
            })
            .collect();

        if unregistered.is_empty() {
            return Ok(report);
        }

        let elapsed = self.started_at.elapsed();
        if elapsed < self.config.grace_period {
            tracing::info!(
                unregistered = unregistered.len(),
                remaining_secs = (self.config.grace_period - elapsed).as_secs(),
                "Waiting for nodes to register"
            );
            return Ok(report);
        }

        for info in unregistered {
            tracing::warn!(node_id = %info.id, address = ?info.private_address, "Node never registered, retiring");

            if let Some(address) = &info.private_address {
                let directive =
                    ShutdownDirective::new(&self.config.archive_bucket, self.config.worker_log_files.clone());
                if let Err(e) = self
                    .control
                    .send_to(address, MessageType::CmdWorkerShutdown, directive.to_json())
                    .await
                {
                    tracing::warn!(address = %address, "Failed to send straggler shutdown: {}", e);
                }
                tokio::time::sleep(self.config.shutdown_pause).await;
            }

            match self.provider.terminate(&info.id).await {
                Ok(()) => {
                    self.retire(&info.id);
                    report.stragglers.push(info.id.clone());
                }
                Err(e) => tracing::error!(node_id = %info.id, "Failed to terminate straggler: {}", e),
            }
        }

        Ok(report)
    }

    /// Tick on the configured interval while the run is INITIALIZED
    pub fn spawn(self: Arc<Self>, mut phase: watch::Receiver<Phase>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if *phase.borrow_and_update() != Phase::Initialized {
                            tracing::debug!("Run left INITIALIZED, fleet monitor stopping");
                            break;
                        }
                        if let Err(e) = self.tick().await {
                            tracing::warn!("Fleet monitor tick failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Stop the periodic loop
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
