//! Ordered best-effort cleanup
//!
//! Teardown is a list of independent steps. Every step runs regardless of how
//! earlier steps went; a failing step is logged and recorded, never
//! propagated.

use futures::future::BoxFuture;
use std::future::Future;

use crate::error::Result;

/// Outcome of running a cleanup plan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

/// Cleanup steps, run in insertion order
#[derive(Default)]
pub struct CleanupPlan<'a> {
    steps: Vec<(&'static str, BoxFuture<'a, Result<()>>)>,
}

impl<'a> CleanupPlan<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step
    pub fn step<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'a,
    {
        self.steps.push((name, Box::pin(action)));
        self
    }

    /// Run every step
    pub async fn run(self) -> CleanupReport {
        let mut report = CleanupReport::default();

        for (name, action) in self.steps {
            match action.await {
                Ok(()) => {
                    tracing::debug!(step = name, "Cleanup step done");
                    report.completed.push(name);
                }
                Err(e) => {
                    tracing::warn!(step = name, "Cleanup step failed: {}", e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report
    }
}
