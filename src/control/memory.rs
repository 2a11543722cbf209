//! In-process control channel built on a tokio broadcast channel
//!
//! Every participant created from the same [`MemoryControlBus`] sees every
//! message, mirroring the Redis pub/sub fan-out. The bus also keeps a log of
//! everything published so callers can inspect traffic after the fact.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{ControlChannel, ControlHandler, ControlMessage, Identity, MessageType};
use crate::error::{ControlError, ControlResult};

/// Capacity of the broadcast ring buffer
const BUS_CAPACITY: usize = 4096;

/// Shared in-process broadcast medium
pub struct MemoryControlBus {
    sender: broadcast::Sender<ControlMessage>,
    published: Mutex<Vec<ControlMessage>>,
}

impl MemoryControlBus {
    /// Create a new bus
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new(Self {
            sender,
            published: Mutex::new(Vec::new()),
        })
    }

    /// Attach a participant to this bus
    pub fn channel(self: &Arc<Self>, identity: Identity) -> MemoryControlChannel {
        MemoryControlChannel {
            bus: Arc::clone(self),
            identity,
            cancel: CancellationToken::new(),
        }
    }

    /// Every message published so far, in publish order
    pub fn published(&self) -> Vec<ControlMessage> {
        self.published.lock().clone()
    }

    /// Published messages of one type
    pub fn published_of(&self, message_type: MessageType) -> Vec<ControlMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.message_type == message_type)
            .cloned()
            .collect()
    }

    fn publish(&self, message: ControlMessage) {
        self.published.lock().push(message.clone());
        // No receivers is fine: broadcast semantics drop the message
        let _ = self.sender.send(message);
    }
}

/// One participant's view of a [`MemoryControlBus`]
pub struct MemoryControlChannel {
    bus: Arc<MemoryControlBus>,
    identity: Identity,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl ControlChannel for MemoryControlChannel {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn publish(&self, message: ControlMessage) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ControlError::Closed);
        }
        self.bus.publish(message);
        Ok(())
    }

    async fn listen(&self, handler: Arc<dyn ControlHandler>) -> ControlResult<()> {
        let mut receiver = self.bus.sender.subscribe();
        let cancel = self.cancel.clone();
        let address = self.identity.address.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move { handler.handle(message).await });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(address = %address, skipped, "Control listener lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> ControlResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}
