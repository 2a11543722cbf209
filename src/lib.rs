//! bucket-loader - Coordinated two-phase replication
//!
//! Replicates a large, enumerable set of files and directories from a source
//! to a target using a fleet of independent workers. A single master drives
//! the run through globally synchronized phases; workers never talk to each
//! other.
//!
//! # Features
//!
//! - **Two phases**: every manifest entry is copied (WRITE), then every copy
//!   is verified (VALIDATE) against the same manifest.
//!
//! - **Unreliable transports tolerated**: the control channel and work queue
//!   are at-least-once and unordered. The master evaluates aggregate worker
//!   state on every message, so duplicated or reordered delivery converges.
//!
//! - **Bounded retries**: each step of an item's pipeline is retried on its
//!   own, with the evidence of every attempt kept for the error report.
//!
//! - **Fleet resilience**: nodes that are impaired or never register are
//!   retired so the registration barrier can still complete.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────────┐
//!                       │       Orchestrator       │
//!                       │  phase state machine     │
//!                       │  worker registry         │
//!                       │  fleet monitor           │
//!                       └────┬───────────────▲─────┘
//!              phase, dispatch│               │summaries, error reports
//!              complete,      │               │
//!              shutdown       ▼               │
//!                ┌───────────────────────────────────┐
//!                │   Control channel (Redis pub/sub) │
//!                └───────────────────────────────────┘
//!                             │               ▲
//!   ┌──────────────┐          ▼               │
//!   │  Dispatcher  │   ┌──────────┐   ┌──────────┐        ┌──────────┐
//!   │ N push tasks ├──►│  Queue   ├──►│ Worker 1 │  ...   │ Worker N │
//!   └──────────────┘   │ (stream) │   │ executor │        │ executor │
//!                      └──────────┘   └──────────┘        └──────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Master for a fleet of 3 workers
//! bucket-loader master -n 3 --source-root /mnt/src --error-report-log errors.json
//!
//! # On each worker node
//! bucket-loader worker --source-root /mnt/src --target-root /mnt/dst --owner app:app
//! ```

pub mod archive;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod queue;
pub mod worker;
