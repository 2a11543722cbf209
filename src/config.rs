//! Configuration types for bucket-loader
//!
//! Defines CLI arguments and the validated runtime configuration for the
//! orchestrator and worker processes. Every check that can fail runs here,
//! before any node is provisioned or any transport is connected.

use crate::control::DEFAULT_CONTROL_CHANNEL;
use crate::error::ConfigError;
use crate::manifest::ManifestSourceConfig;
use crate::queue::RedisQueueConfig;
use crate::worker::{ExecutorConfig, WorkerNodeConfig};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable dispatch thread count
const MAX_DISPATCH_THREADS: usize = 512;

/// Coordinated two-phase replication across a fleet of workers
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bucket-loader",
    version,
    about = "Coordinated two-phase replication across a fleet of workers",
    long_about = "Replicates a large set of files and directories from a source to a target\n\
                  using a fleet of independent workers.\n\n\
                  Operates in two globally synchronized phases:\n\
                  1. WRITE: workers copy every manifest entry to the target\n\
                  2. VALIDATE: workers verify every copied entry\n\n\
                  One master drives the phases over a Redis control channel and\n\
                  distributes work items over a Redis stream.",
    after_help = "EXAMPLES:\n    \
        # Start the master for a fleet of 4 workers\n    \
        bucket-loader master -n 4 --source-root /mnt/src --redis redis://queue:6379\n\n    \
        # Start a worker on each node\n    \
        bucket-loader worker --source-root /mnt/src --target-root /mnt/dst --redis redis://queue:6379\n\n    \
        # Drop every queued work item\n    \
        bucket-loader purge --redis redis://queue:6379"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Redis URL for the control channel and work queue
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    pub redis: String,

    /// Redis pub/sub channel for control messages
    #[arg(long, default_value = DEFAULT_CONTROL_CHANNEL, global = true, value_name = "NAME")]
    pub control_channel: String,

    /// Key prefix for the work queue
    #[arg(long, default_value = "bucket-loader", global = true, value_name = "PREFIX")]
    pub queue_prefix: String,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the master orchestrator
    Master(MasterArgs),

    /// Run a worker
    Worker(WorkerArgs),

    /// Drop every queued work item
    Purge,
}

/// Manifest source variant
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Crawl the source root
    Crawl,
    /// Read paths from a manifest file
    Manifest,
    /// List an object-storage bucket
    Bucket,
}

/// Master subcommand arguments
#[derive(Args, Debug, Clone)]
pub struct MasterArgs {
    /// Total number of workers expected to register
    #[arg(short = 'n', long = "workers", default_value_t = 1, value_name = "NUM")]
    pub expected_workers: usize,

    /// Number of parallel dispatch tasks
    #[arg(short = 't', long, default_value_t = default_dispatch_threads(), value_name = "NUM")]
    pub dispatch_threads: usize,

    /// Move to REPORT_ERRORS as soon as any worker reports an error
    #[arg(long)]
    pub fail_fast: bool,

    /// Manifest source
    #[arg(long, value_enum, default_value = "crawl")]
    pub source: SourceKind,

    /// Source root directory
    #[arg(long, value_name = "DIR")]
    pub source_root: Option<PathBuf>,

    /// Manifest file (for --source manifest)
    #[arg(long, value_name = "FILE")]
    pub manifest_file: Option<PathBuf>,

    /// Bucket to list (for --source bucket)
    #[arg(long, value_name = "NAME")]
    pub bucket: Option<String>,

    /// Only include files modified after this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    pub modified_after: Option<String>,

    /// Exclude paths matching pattern (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Minutes nodes get to register before they are retired
    #[arg(long, default_value = "10", value_name = "MINS")]
    pub registration_grace_mins: u64,

    /// Seconds between fleet monitor passes
    #[arg(long, default_value = "30", value_name = "SECS")]
    pub monitor_interval: u64,

    /// Exit this many seconds after the final reports are in
    #[arg(long, value_name = "SECS")]
    pub auto_shutdown: Option<u64>,

    /// Seconds between aggregate stats dumps
    #[arg(long, default_value = "60", value_name = "SECS")]
    pub stats_interval: u64,

    /// Archival bucket for log files
    #[arg(long, default_value = "bucket-loader-logs", value_name = "NAME")]
    pub archive_bucket: String,

    /// Local directory standing in for the archival store
    #[arg(long, default_value = "archive", value_name = "DIR")]
    pub archive_dir: PathBuf,

    /// Worker log file names to archive at shutdown (can be repeated)
    #[arg(long = "worker-log-file", value_name = "NAME", action = clap::ArgAction::Append)]
    pub worker_log_files: Vec<String>,

    /// Master log files to archive at shutdown (can be repeated)
    #[arg(long = "log-file", value_name = "FILE", action = clap::ArgAction::Append)]
    pub log_files: Vec<PathBuf>,

    /// Write collected worker error reports to this file
    #[arg(long, value_name = "FILE")]
    pub error_report_log: Option<PathBuf>,

    /// Provider id of an externally managed source host
    #[arg(long, value_name = "ID")]
    pub source_node_id: Option<String>,

    /// Command run once the source host is up
    #[arg(long, value_name = "CMD")]
    pub post_start_command: Option<String>,

    /// Command run before the source host is stopped
    #[arg(long, value_name = "CMD")]
    pub pre_stop_command: Option<String>,

    /// Stop the source host at shutdown
    #[arg(long)]
    pub stop_source_on_shutdown: bool,

    /// Address this master publishes as
    #[arg(long, value_name = "ADDR")]
    pub address: Option<String>,
}

/// Worker subcommand arguments
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Source root directory
    #[arg(long, value_name = "DIR")]
    pub source_root: PathBuf,

    /// Target root directory
    #[arg(long, value_name = "DIR")]
    pub target_root: PathBuf,

    /// Owner applied to every target (chown spec)
    #[arg(long, value_name = "USER[:GROUP]")]
    pub owner: Option<String>,

    /// Permissions applied to every target (chmod spec)
    #[arg(long, value_name = "MODE")]
    pub permissions: Option<String>,

    /// Attempts per pipeline step
    #[arg(long, default_value = "3", value_name = "NUM")]
    pub max_attempts: u32,

    /// Pause after a failed attempt in milliseconds
    #[arg(long, default_value = "500", value_name = "MS")]
    pub retry_pause_ms: u64,

    /// Timeout for one local command in seconds
    #[arg(long, default_value = "600", value_name = "SECS")]
    pub command_timeout: u64,

    /// Queue poll timeout in milliseconds
    #[arg(long, default_value = "1000", value_name = "MS")]
    pub poll_timeout_ms: u64,

    /// Empty polls after dispatch completion before a phase is finished
    #[arg(long, default_value = "3", value_name = "NUM")]
    pub idle_polls: u32,

    /// Seconds between interim summaries
    #[arg(long, default_value = "10", value_name = "SECS")]
    pub summary_interval: u64,

    /// Seconds between phase re-announcements
    #[arg(long, default_value = "15", value_name = "SECS")]
    pub heartbeat_interval: u64,

    /// Directory worker log file names are relative to
    #[arg(long, default_value = ".", value_name = "DIR")]
    pub log_dir: PathBuf,

    /// Local directory standing in for the archival store
    #[arg(long, default_value = "archive", value_name = "DIR")]
    pub archive_dir: PathBuf,

    /// Worker ID (auto-generated if not specified)
    #[arg(long, value_name = "ID")]
    pub worker_id: Option<String>,

    /// Address this worker registers under (defaults to the hostname)
    #[arg(long, value_name = "ADDR")]
    pub address: Option<String>,
}

fn default_dispatch_threads() -> usize {
    (num_cpus::get() * 2).min(MAX_DISPATCH_THREADS)
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Process identifier: hostname plus a short random suffix
pub fn generate_process_id() -> String {
    format!("{}-{}", hostname(), &uuid::Uuid::new_v4().to_string()[..8])
}

/// Parse a YYYY-MM-DD date as midnight UTC
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| ConfigError::InvalidDate {
        value: value.to_string(),
    })?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| ConfigError::InvalidDate {
        value: value.to_string(),
    })?;
    Ok(midnight.and_utc())
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn existing_dir(path: Option<&PathBuf>, setting: &str) -> Result<PathBuf, ConfigError> {
    let path = path.ok_or_else(|| ConfigError::MissingRequired(setting.to_string()))?;
    if !path.is_dir() {
        return Err(ConfigError::SourceRootMissing { path: path.clone() });
    }
    Ok(path.clone())
}

/// Externally managed source host
#[derive(Debug, Clone)]
pub struct SourceHostConfig {
    /// Provider node id; start/stop calls need a compute provider
    pub node_id: Option<String>,
    /// Command run once the host is up
    pub post_start_command: Option<String>,
    /// Command run before the host is stopped
    pub pre_stop_command: Option<String>,
    /// Stop the host at shutdown
    pub stop_on_shutdown: bool,
    /// Poll interval while waiting for the host to run
    pub poll_interval: Duration,
    /// Give up waiting for the host after this long
    pub start_timeout: Duration,
    /// Pause between the host running and the post-start command
    pub settle_delay: Duration,
    /// Attempts for each hook command
    pub command_attempts: u32,
}

impl Default for SourceHostConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            post_start_command: None,
            pre_stop_command: None,
            stop_on_shutdown: false,
            poll_interval: Duration::from_secs(2),
            start_timeout: Duration::from_secs(300),
            settle_delay: Duration::from_secs(30),
            command_attempts: 3,
        }
    }
}

impl SourceHostConfig {
    /// Whether anything needs to happen for the source host
    pub fn is_configured(&self) -> bool {
        self.node_id.is_some() || self.post_start_command.is_some() || self.pre_stop_command.is_some()
    }
}

/// Runtime configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workers that must register before WRITE starts
    pub expected_workers: usize,
    /// Parallel dispatch tasks
    pub dispatch_threads: usize,
    /// Escalate to REPORT_ERRORS on the first reported error
    pub fail_fast: bool,
    /// Manifest source selection
    pub source: ManifestSourceConfig,
    /// Launch and monitor worker nodes through the compute provider
    pub self_managed_fleet: bool,
    /// Time nodes get to register
    pub registration_grace: Duration,
    /// Fleet monitor interval
    pub monitor_interval: Duration,
    /// Pause between a straggler's shutdown message and its termination
    pub straggler_pause: Duration,
    /// Delay between final reporting and termination
    pub auto_shutdown: Option<Duration>,
    /// Interval between aggregate stats dumps
    pub stats_interval: Duration,
    /// Archival bucket
    pub archive_bucket: String,
    /// Worker log file names named in shutdown directives
    pub worker_log_files: Vec<String>,
    /// Orchestrator log files archived at shutdown
    pub log_files: Vec<PathBuf>,
    /// Error report artifact path
    pub error_report_log: Option<PathBuf>,
    /// Source host lifecycle
    pub source_host: SourceHostConfig,
    /// Timeout for hook commands
    pub command_timeout: Duration,
    /// Process identifier
    pub source_id: String,
    /// Address published on the control channel
    pub address: String,
}

impl OrchestratorConfig {
    /// Defaults for everything but the fleet size and manifest source
    pub fn new(expected_workers: usize, source: ManifestSourceConfig) -> Self {
        Self {
            expected_workers,
            dispatch_threads: default_dispatch_threads(),
            fail_fast: false,
            source,
            self_managed_fleet: false,
            registration_grace: Duration::from_secs(600),
            monitor_interval: Duration::from_secs(30),
            straggler_pause: Duration::from_secs(10),
            auto_shutdown: None,
            stats_interval: Duration::from_secs(60),
            archive_bucket: "bucket-loader-logs".to_string(),
            worker_log_files: Vec::new(),
            log_files: Vec::new(),
            error_report_log: None,
            source_host: SourceHostConfig::default(),
            command_timeout: Duration::from_secs(120),
            source_id: generate_process_id(),
            address: hostname(),
        }
    }

    /// Create from CLI args
    pub fn from_master_args(args: &MasterArgs) -> Result<Self, ConfigError> {
        if args.expected_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount(args.expected_workers));
        }
        if args.dispatch_threads == 0 || args.dispatch_threads > MAX_DISPATCH_THREADS {
            return Err(ConfigError::InvalidDispatchThreads {
                count: args.dispatch_threads,
                max: MAX_DISPATCH_THREADS,
            });
        }

        let source = match args.source {
            SourceKind::Crawl => ManifestSourceConfig::Crawl {
                root: existing_dir(args.source_root.as_ref(), "--source-root")?,
                modified_after: args.modified_after.as_deref().map(parse_date).transpose()?,
                exclude: compile_patterns(&args.exclude_patterns)?,
            },
            SourceKind::Manifest => {
                let root = existing_dir(args.source_root.as_ref(), "--source-root")?;
                let manifest = args
                    .manifest_file
                    .clone()
                    .ok_or_else(|| ConfigError::MissingRequired("--manifest-file".into()))?;
                ManifestSourceConfig::ManifestFile { root, manifest }
            }
            SourceKind::Bucket => ManifestSourceConfig::Bucket {
                bucket: args
                    .bucket
                    .clone()
                    .ok_or_else(|| ConfigError::MissingRequired("--bucket".into()))?,
            },
        };

        let mut config = Self::new(args.expected_workers, source);
        config.dispatch_threads = args.dispatch_threads;
        config.fail_fast = args.fail_fast;
        config.registration_grace = Duration::from_secs(args.registration_grace_mins * 60);
        config.monitor_interval = Duration::from_secs(args.monitor_interval.max(1));
        config.auto_shutdown = args.auto_shutdown.map(Duration::from_secs);
        config.stats_interval = Duration::from_secs(args.stats_interval.max(1));
        config.archive_bucket = args.archive_bucket.clone();
        config.worker_log_files = args.worker_log_files.clone();
        config.log_files = args.log_files.clone();
        config.error_report_log = args.error_report_log.clone();
        config.source_host = SourceHostConfig {
            node_id: args.source_node_id.clone(),
            post_start_command: args.post_start_command.clone(),
            pre_stop_command: args.pre_stop_command.clone(),
            stop_on_shutdown: args.stop_source_on_shutdown,
            ..SourceHostConfig::default()
        };
        if let Some(address) = &args.address {
            config.address = address.clone();
        }

        Ok(config)
    }
}

/// Runtime configuration for a worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pipeline settings
    pub executor: ExecutorConfig,
    /// Loop timing
    pub node: WorkerNodeConfig,
    /// Timeout for one local command
    pub command_timeout: Duration,
    /// Local archive base directory
    pub archive_dir: PathBuf,
    /// Worker ID
    pub worker_id: String,
    /// Registry key
    pub address: String,
}

impl WorkerConfig {
    /// Create from CLI args
    pub fn from_worker_args(args: &WorkerArgs) -> Result<Self, ConfigError> {
        if args.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(args.max_attempts));
        }
        let source_root = existing_dir(Some(&args.source_root), "--source-root")?;

        let mut executor = ExecutorConfig::new(source_root, args.target_root.clone());
        executor.owner = args.owner.clone();
        executor.permissions = args.permissions.clone();
        executor.max_attempts = args.max_attempts;
        executor.retry_pause = Duration::from_millis(args.retry_pause_ms);

        let node = WorkerNodeConfig {
            poll_timeout: Duration::from_millis(args.poll_timeout_ms.max(1)),
            idle_polls_to_finish: args.idle_polls.max(1),
            summary_interval: Duration::from_secs(args.summary_interval.max(1)),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
            log_dir: args.log_dir.clone(),
        };

        Ok(Self {
            executor,
            node,
            command_timeout: Duration::from_secs(args.command_timeout.max(1)),
            archive_dir: args.archive_dir.clone(),
            worker_id: args.worker_id.clone().unwrap_or_else(generate_process_id),
            address: args.address.clone().unwrap_or_else(hostname),
        })
    }
}

/// Queue settings shared by every subcommand
pub fn queue_config(args: &CliArgs) -> RedisQueueConfig {
    let mut config = RedisQueueConfig::with_url(&args.redis);
    config.key_prefix = args.queue_prefix.clone();
    config
}
