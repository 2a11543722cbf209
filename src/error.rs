//! Error types for bucket-loader
//!
//! This module defines the error hierarchy for the whole run:
//! - Configuration errors (fatal at startup, before any node is provisioned)
//! - Control channel and work queue transport errors (logged, call treated as failed)
//! - Manifest generation errors (fatal, tear the orchestrator down)
//! - Compute node provider and archival errors (best effort during cleanup)
//!
//! Local operation failures on a worker are NOT errors at this level: they are
//! recorded as [`PathOperationResult`](crate::worker::PathOperationResult)
//! failures and never cross the work item boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for bucket-loader
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control channel errors
    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    /// Work queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Manifest generation errors
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Compute node provider errors
    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    /// Log archival errors
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Payload encoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Source root does not exist
    #[error("Source root '{path}' does not exist")]
    SourceRootMissing { path: PathBuf },

    /// Invalid dispatch thread count
    #[error("Invalid dispatch thread count {count}: must be between 1 and {max}")]
    InvalidDispatchThreads { count: usize, max: usize },

    /// Invalid expected worker count
    #[error("Invalid expected worker count {0}: must be at least 1")]
    InvalidWorkerCount(usize),

    /// Invalid retry attempt count
    #[error("Invalid max attempts {0}: must be at least 1")]
    InvalidMaxAttempts(u32),

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Invalid date filter
    #[error("Invalid date '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    /// Invalid manifest source selection
    #[error("Invalid manifest source: {0}")]
    InvalidManifestSource(String),
}

/// Control channel (broadcast transport) errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Connection to the broker failed
    #[error("Failed to connect to control channel at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Publish failed
    #[error("Failed to publish control message: {0}")]
    PublishFailed(String),

    /// Subscription failed
    #[error("Failed to subscribe to control channel '{channel}': {reason}")]
    SubscribeFailed { channel: String, reason: String },

    /// Message could not be (de)serialized
    #[error("Malformed control message: {0}")]
    Malformed(String),

    /// The channel has been stopped
    #[error("Control channel is closed")]
    Closed,
}

impl From<redis::RedisError> for ControlError {
    fn from(err: redis::RedisError) -> Self {
        ControlError::PublishFailed(err.to_string())
    }
}

/// Work queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection failed
    #[error("Failed to connect to Redis at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Redis operation failed
    #[error("Redis operation failed: {0}")]
    OperationFailed(String),

    /// Serialization error
    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(String),

    /// The queue has been closed
    #[error("Queue is closed")]
    Closed,

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Redis(err.to_string())
    }
}

/// Manifest generation errors
#[derive(Error, Debug, Clone)]
pub enum GenerationError {
    /// Source root missing or unreadable
    #[error("Source root '{path}' is not readable: {reason}")]
    SourceUnreadable { path: String, reason: String },

    /// Enumeration failed part way through
    #[error("Enumeration failed at '{path}': {reason}")]
    ScanFailed { path: String, reason: String },

    /// Manifest file could not be read
    #[error("Failed to read manifest file '{path}': {reason}")]
    ManifestUnreadable { path: String, reason: String },

    /// Object listing failed
    #[error("Failed to list bucket '{bucket}': {reason}")]
    ListingFailed { bucket: String, reason: String },

    /// Generation task panicked or was cancelled
    #[error("Generation aborted: {0}")]
    Aborted(String),
}

/// Compute node provider errors
#[derive(Error, Debug)]
pub enum FleetError {
    /// Launch request failed
    #[error("Failed to launch {count} nodes: {reason}")]
    LaunchFailed { count: usize, reason: String },

    /// Node operation failed
    #[error("Operation '{operation}' on node '{node_id}' failed: {reason}")]
    NodeOperation {
        operation: String,
        node_id: String,
        reason: String,
    },

    /// Node did not reach the running state in time
    #[error("Node '{node_id}' not running after {waited_secs}s")]
    StartTimeout { node_id: String, waited_secs: u64 },

    /// Host hook command failed
    #[error("Host command '{command}' failed with exit code {exit_code}")]
    HookFailed { command: String, exit_code: i32 },
}

/// Archival store errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Upload destination could not be prepared
    #[error("Failed to prepare archive destination '{path}': {reason}")]
    Destination { path: PathBuf, reason: String },

    /// Copying a file failed
    #[error("Failed to archive '{path}': {reason}")]
    UploadFailed { path: PathBuf, reason: String },
}

/// Payload encoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Base64 decode failed
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Decompressed bytes were not UTF-8
    #[error("Payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for LoaderError
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Result type for control channel operations
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type for fleet operations
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Result type for payload encoding
pub type CodecResult<T> = std::result::Result<T, CodecError>;
