//! In-process work queue
//!
//! Same contract as the Redis queue for a single process: items are popped
//! in FIFO order, held in flight until acknowledged, and `pop` waits on a
//! `Notify` until an item arrives or the timeout passes.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{QueueError, QueueResult};
use crate::manifest::WorkItem;
use crate::queue::{QueueStats, QueuedItem, WorkQueue};

#[derive(Default)]
struct Inner {
    queued: VecDeque<(String, WorkItem)>,
    in_flight: HashMap<String, WorkItem>,
    stats: QueueStats,
}

/// Work queue held in memory
#[derive(Default)]
pub struct MemoryWorkQueue {
    inner: Mutex<Inner>,
    next_receipt: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every queued (not yet popped) item
    pub fn queued_items(&self) -> Vec<WorkItem> {
        self.inner.lock().queued.iter().map(|(_, item)| item.clone()).collect()
    }

    fn try_pop(&self) -> Option<QueuedItem> {
        let mut inner = self.inner.lock();
        let (receipt, item) = inner.queued.pop_front()?;
        inner.in_flight.insert(receipt.clone(), item.clone());
        Some(QueuedItem { receipt, item })
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, item: WorkItem) -> QueueResult<()> {
        self.ensure_open()?;
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        {
            let mut inner = self.inner.lock();
            inner.queued.push_back((receipt, item));
            inner.stats.submitted += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, _consumer: &str, timeout: Duration) -> QueueResult<Option<QueuedItem>> {
        self.ensure_open()?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so a concurrent push is not missed
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop());
            }
            self.ensure_open()?;
        }
    }

    async fn ack(&self, receipt: &str) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if inner.in_flight.remove(receipt).is_some() {
            inner.stats.completed += 1;
        }
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        let inner = self.inner.lock();
        Ok((inner.queued.len() + inner.in_flight.len()) as u64)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.outstanding = (inner.queued.len() + inner.in_flight.len()) as u64;
        Ok(stats)
    }

    async fn purge(&self) -> QueueResult<u64> {
        let mut inner = self.inner.lock();
        let removed = inner.queued.len() as u64;
        inner.queued.clear();
        inner.stats.purged += removed;
        Ok(removed)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}
