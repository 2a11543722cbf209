//! Work queue for distributing work items to workers
//!
//! Multi-consumer, at-least-once, unordered. An item popped but never
//! acknowledged may be delivered again (to the same or another worker), so
//! executing an item must be safe to repeat.

mod memory;
mod redis_queue;

pub use memory::MemoryWorkQueue;
pub use redis_queue::{RedisQueueConfig, RedisWorkQueue};

use crate::error::QueueResult;
use crate::manifest::WorkItem;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A popped item and the receipt needed to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    /// Transport-specific delivery id
    pub receipt: String,
    /// The work item
    pub item: WorkItem,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items pushed so far
    pub submitted: u64,
    /// Items acknowledged so far
    pub completed: u64,
    /// Items pushed but not yet acknowledged
    pub outstanding: u64,
    /// Items removed by purges
    pub purged: u64,
}

/// Trait for queue implementations
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    /// Push an item onto the queue
    async fn push(&self, item: WorkItem) -> QueueResult<()>;

    /// Pop an item (blocking with timeout)
    async fn pop(&self, consumer: &str, timeout: Duration) -> QueueResult<Option<QueuedItem>>;

    /// Acknowledge an item so it is not delivered again
    async fn ack(&self, receipt: &str) -> QueueResult<()>;

    /// Number of items pushed but not yet acknowledged
    async fn pending_count(&self) -> QueueResult<u64>;

    /// Get queue statistics
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Drop every queued item; returns how many were removed (0 on an empty queue)
    async fn purge(&self) -> QueueResult<u64>;

    /// Stop serving pops; later calls fail with `Closed`
    async fn close(&self) -> QueueResult<()>;

    /// Check if queue is empty
    async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.pending_count().await? == 0)
    }
}

// Re-export async_trait for consumers
pub use async_trait::async_trait;
