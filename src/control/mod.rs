//! Control channel: the broadcast pub/sub transport shared by the orchestrator and every worker
//!
//! Delivery contract:
//! - at-least-once: a message may arrive zero or more times
//! - unordered relative to other participants' messages
//! - every participant receives every message; a targeted message carries an
//!   address filter and non-matching participants ignore it
//! - handlers may be invoked concurrently, one task per delivered message
//!
//! Two transports are provided: [`RedisControlChannel`] (Redis pub/sub) for
//! real fleets and [`MemoryControlChannel`] for single-host runs and tests.

pub mod codec;
mod memory;
mod message;
mod redis_channel;

pub use memory::{MemoryControlBus, MemoryControlChannel};
pub use message::{ControlMessage, MessageType, Phase, ShutdownDirective, WorkerSummary};
pub use redis_channel::{RedisControlChannel, DEFAULT_CONTROL_CHANNEL};

use crate::error::ControlResult;
use std::sync::Arc;

/// Who is publishing on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// True for the orchestrator
    pub from_orchestrator: bool,
    /// Process identifier
    pub source_id: String,
    /// Network address, the key the registry stores workers under
    pub address: String,
}

impl Identity {
    /// Identity for the orchestrator process
    pub fn orchestrator(source_id: &str, address: &str) -> Self {
        Self {
            from_orchestrator: true,
            source_id: source_id.to_string(),
            address: address.to_string(),
        }
    }

    /// Identity for a worker process
    pub fn worker(source_id: &str, address: &str) -> Self {
        Self {
            from_orchestrator: false,
            source_id: source_id.to_string(),
            address: address.to_string(),
        }
    }
}

/// Receives control messages delivered by a transport
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync {
    /// Handle one delivered message; must tolerate duplicates
    async fn handle(&self, message: ControlMessage);
}

/// Broadcast transport contract
#[async_trait::async_trait]
pub trait ControlChannel: Send + Sync {
    /// Identity stamped on every message this channel publishes
    fn identity(&self) -> &Identity;

    /// Publish a fully built message
    async fn publish(&self, message: ControlMessage) -> ControlResult<()>;

    /// Start delivering inbound messages to `handler`
    async fn listen(&self, handler: Arc<dyn ControlHandler>) -> ControlResult<()>;

    /// Stop listening; publishing afterwards fails with `Closed`
    async fn stop(&self) -> ControlResult<()>;

    /// Broadcast to every participant
    async fn send(&self, message_type: MessageType, value: String) -> ControlResult<()> {
        let id = self.identity();
        let message = ControlMessage::new(
            id.from_orchestrator,
            &id.source_id,
            &id.address,
            message_type,
            value,
        );
        self.publish(message).await
    }

    /// Broadcast, but only the worker at `address` acts on it
    async fn send_to(&self, address: &str, message_type: MessageType, value: String) -> ControlResult<()> {
        let id = self.identity();
        let message = ControlMessage::new(
            id.from_orchestrator,
            &id.source_id,
            &id.address,
            message_type,
            value,
        )
        .targeted(address);
        self.publish(message).await
    }
}

// Re-export async_trait for implementors
pub use async_trait::async_trait;
