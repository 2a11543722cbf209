//! Redis pub/sub control channel
//!
//! All participants PUBLISH JSON-encoded [`ControlMessage`]s to one Redis
//! channel and SUBSCRIBE to it. Redis pub/sub is fire-and-forget, which the
//! protocol tolerates: workers re-announce their state periodically.
//!
//! A dropped subscription (Redis restart, broken connection) is re-established
//! with exponential backoff until the channel is stopped. Messages published
//! during the gap are lost; the periodic re-announcements cover them.

use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, Msg};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ControlChannel, ControlHandler, ControlMessage, Identity};
use crate::error::{ControlError, ControlResult};

/// Default Redis channel name
pub const DEFAULT_CONTROL_CHANNEL: &str = "bucket-loader:control";

/// Upper bound on the pause between re-subscribe attempts
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff: 100ms, 200ms, 400ms, ... capped
fn resubscribe_delay(attempt: u32) -> Duration {
    let delay = Duration::from_millis(100u64 << attempt.min(16));
    delay.min(MAX_RESUBSCRIBE_DELAY)
}

async fn subscribe(client: &Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

/// Decode one delivery and hand it to the handler on its own task
fn deliver(msg: Msg, handler: &Arc<dyn ControlHandler>) {
    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Dropping unreadable control payload: {}", e);
            return;
        }
    };

    match ControlMessage::from_json(&payload) {
        Ok(message) => {
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler.handle(message).await });
        }
        Err(e) => tracing::warn!("Dropping malformed control message: {}", e),
    }
}

/// Control channel backed by Redis pub/sub
pub struct RedisControlChannel {
    client: Client,
    channel: String,
    identity: Identity,
    /// Multiplexed: each publish works on its own clone
    connection: MultiplexedConnection,
    cancel: CancellationToken,
}

impl RedisControlChannel {
    /// Connect to Redis for publishing; subscribing happens in [`listen`](ControlChannel::listen)
    pub async fn connect(url: &str, channel: &str, identity: Identity) -> ControlResult<Self> {
        let client = Client::open(url).map_err(|e| ControlError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ControlError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            channel: channel.to_string(),
            identity,
            connection,
            cancel: CancellationToken::new(),
        })
    }
}

#[async_trait::async_trait]
impl ControlChannel for RedisControlChannel {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn publish(&self, message: ControlMessage) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ControlError::Closed);
        }

        let payload = message.to_json()?;
        let mut conn = self.connection.clone();
        let _receivers: i64 = conn.publish(&self.channel, payload).await?;

        tracing::trace!(
            message_type = ?message.message_type,
            target = ?message.target_address_filter,
            "Published control message"
        );
        Ok(())
    }

    async fn listen(&self, handler: Arc<dyn ControlHandler>) -> ControlResult<()> {
        let pubsub = subscribe(&self.client, &self.channel)
            .await
            .map_err(|e| ControlError::SubscribeFailed {
                channel: self.channel.clone(),
                reason: e.to_string(),
            })?;

        let client = self.client.clone();
        let cancel = self.cancel.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            let mut attempt = 0u32;

            loop {
                let current = match pubsub.take() {
                    Some(current) => current,
                    None => {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(resubscribe_delay(attempt)) => {}
                        }
                        match subscribe(&client, &channel).await {
                            Ok(current) => {
                                tracing::info!(channel = %channel, attempt, "Control subscription restored");
                                attempt = 0;
                                current
                            }
                            Err(e) => {
                                attempt = attempt.saturating_add(1);
                                tracing::warn!(channel = %channel, attempt, "Re-subscribe failed: {}", e);
                                continue;
                            }
                        }
                    }
                };

                let mut messages = current.into_on_message();
                let dropped = loop {
                    tokio::select! {
                        () = cancel.cancelled() => break false,
                        next = messages.next() => match next {
                            Some(msg) => deliver(msg, &handler),
                            None => break true,
                        },
                    }
                };

                if !dropped {
                    break;
                }
                tracing::warn!(channel = %channel, "Control subscription ended, re-subscribing");
            }
            tracing::debug!(channel = %channel, "Control listener stopped");
        });

        tracing::debug!(channel = %self.channel, "Listening on control channel");
        Ok(())
    }

    async fn stop(&self) -> ControlResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resubscribe_delay_backs_off_and_caps() {
        assert_eq!(resubscribe_delay(0), Duration::from_millis(100));
        assert_eq!(resubscribe_delay(1), Duration::from_millis(200));
        assert_eq!(resubscribe_delay(3), Duration::from_millis(800));
        assert_eq!(resubscribe_delay(9), MAX_RESUBSCRIBE_DELAY);
        assert_eq!(resubscribe_delay(u32::MAX), MAX_RESUBSCRIBE_DELAY);
    }
}
