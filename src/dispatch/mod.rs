//! Work item generation and dispatch
//!
//! The dispatcher turns a manifest into work items for one phase and fans them
//! out across a fixed pool of dispatch tasks, each pushing onto the work
//! queue. Item `i` goes to dispatch task `i % threads`.
//!
//! The manifest is either produced by a [`ManifestSource`] (WRITE) or reused
//! unchanged from an earlier dispatch (VALIDATE). The outcome is delivered
//! exactly once through the [`DispatchHandle`] completion receiver:
//! a [`DispatchReport`] carrying the manifest, or the [`GenerationError`]
//! that stopped generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::manifest::{ItemMode, Manifest, ManifestSource};
use crate::queue::WorkQueue;

/// Where the manifest for a dispatch comes from
#[derive(Clone)]
pub enum ManifestInput {
    /// Enumerate entries from a source
    Generate(Arc<dyn ManifestSource>),
    /// Reuse a manifest produced by an earlier dispatch
    Reuse(Manifest),
}

/// Outcome of a completed dispatch
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Phase the items were tagged with
    pub mode: ItemMode,
    /// The manifest that was dispatched
    pub manifest: Manifest,
    /// Items successfully enqueued
    pub enqueued: u64,
    /// Items whose enqueue failed
    pub enqueue_failures: u64,
    /// Wall time from request to last push
    pub elapsed: Duration,
}

/// Handle to one in-flight dispatch
pub struct DispatchHandle {
    completion: oneshot::Receiver<Result<DispatchReport, GenerationError>>,
    cancel: CancellationToken,
}

impl DispatchHandle {
    /// Token that stops this dispatch only
    ///
    /// Once cancelled no further items are pushed and the completion resolves
    /// with [`GenerationError::Aborted`].
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the dispatch outcome
    pub async fn completion(self) -> Result<DispatchReport, GenerationError> {
        self.completion
            .await
            .unwrap_or_else(|_| Err(GenerationError::Aborted("dispatch task dropped".into())))
    }
}

/// Generates manifests and pushes work items onto the queue
pub struct ManifestDispatcher {
    queue: Arc<dyn WorkQueue>,
    threads: usize,
    cancel: CancellationToken,
}

impl ManifestDispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>, threads: usize) -> Self {
        Self {
            queue,
            threads: threads.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Start dispatching `input` as `mode` items
    pub fn dispatch(&self, mode: ItemMode, input: ManifestInput) -> DispatchHandle {
        let (tx, rx) = oneshot::channel();
        let queue = Arc::clone(&self.queue);
        let threads = self.threads;
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let outcome = run_dispatch(queue, threads, mode, input, task_cancel).await;
            // Receiver gone means nobody cares about the outcome any more
            let _ = tx.send(outcome);
        });

        DispatchHandle { completion: rx, cancel }
    }

    /// Cancel every in-flight dispatch
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run_dispatch(
    queue: Arc<dyn WorkQueue>,
    threads: usize,
    mode: ItemMode,
    input: ManifestInput,
    cancel: CancellationToken,
) -> Result<DispatchReport, GenerationError> {
    let start = Instant::now();

    let manifest = match input {
        ManifestInput::Reuse(manifest) => {
            tracing::info!(mode = %mode, entries = manifest.len(), "Reusing manifest");
            manifest
        }
        ManifestInput::Generate(source) => {
            tracing::info!(mode = %mode, source = %source.describe(), "Generating manifest");
            let entries = tokio::select! {
                () = cancel.cancelled() => return Err(GenerationError::Aborted("dispatcher stopped".into())),
                produced = source.produce() => produced?,
            };
            let manifest = Manifest::from_entries(entries);
            tracing::info!(
                entries = manifest.len(),
                files = manifest.stats().file_count,
                containers = manifest.stats().container_count,
                bytes = manifest.stats().total_bytes,
                "Manifest generated"
            );
            manifest
        }
    };

    let enqueued = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));
    let mut tasks = Vec::with_capacity(threads);

    for slot in 0..threads {
        let manifest = manifest.clone();
        let queue = Arc::clone(&queue);
        let enqueued = Arc::clone(&enqueued);
        let failures = Arc::clone(&failures);
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            for entry in manifest.entries().iter().skip(slot).step_by(threads) {
                let item = crate::manifest::WorkItem::from_entry(entry, mode);
                let pushed = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    pushed = queue.push(item) => pushed,
                };
                match pushed {
                    Ok(()) => {
                        enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(path = %entry.path, slot, "Failed to enqueue work item: {}", e);
                    }
                }
            }
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Dispatch task failed: {}", e);
        }
    }

    if cancel.is_cancelled() {
        return Err(GenerationError::Aborted("dispatcher stopped".into()));
    }

    let report = DispatchReport {
        mode,
        manifest,
        enqueued: enqueued.load(Ordering::Relaxed),
        enqueue_failures: failures.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    };

    tracing::info!(
        mode = %mode,
        enqueued = report.enqueued,
        failures = report.enqueue_failures,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Dispatch complete"
    );
    Ok(report)
}
