//! Redis-backed distributed queue implementation
//!
//! Uses Redis Streams for reliable message delivery with:
//! - At-least-once delivery semantics
//! - Consumer groups for parallel workers
//! - Automatic redelivery of abandoned messages
//!
//! Each stream entry carries the work item JSON inline. Acknowledged entries
//! are deleted, so the stream length is the number of outstanding items.

use crate::error::{QueueError, QueueResult};
use crate::manifest::WorkItem;
use crate::queue::{QueueStats, QueuedItem, WorkQueue};

use redis::{
    aio::MultiplexedConnection,
    streams::{StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client, RedisResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Stream field holding the item JSON
const ITEM_FIELD: &str = "item";

/// Consumer group name
const CONSUMER_GROUP: &str = "bucket-loader-workers";

/// Configuration for Redis queue
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// Claim timeout for abandoned messages
    pub claim_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "bucket-loader".to_string(),
            claim_timeout: Duration::from_secs(120),
        }
    }
}

impl RedisQueueConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Stream holding queued items
    pub fn stream_key(&self) -> String {
        format!("{}:items:queue", self.key_prefix)
    }

    /// Hash holding counters
    pub fn stats_key(&self) -> String {
        format!("{}:stats", self.key_prefix)
    }
}

/// Redis-backed distributed queue
pub struct RedisWorkQueue {
    connection: RwLock<MultiplexedConnection>,
    config: RedisQueueConfig,
    stream_key: String,
    stats_key: String,
    closed: AtomicBool,
}

impl RedisWorkQueue {
    /// Connect and make sure the consumer group exists
    pub async fn new(config: RedisQueueConfig) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| QueueError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        let queue = Self {
            connection: RwLock::new(connection),
            stream_key: config.stream_key(),
            stats_key: config.stats_key(),
            config,
            closed: AtomicBool::new(false),
        };

        queue.init_consumer_group().await?;

        Ok(queue)
    }

    /// Initialize the consumer group
    async fn init_consumer_group(&self) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        // MKSTREAM creates the stream if it doesn't exist
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        // BUSYGROUP: group already exists
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::OperationFailed(e.to_string())),
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn decode(receipt: String, json: Option<String>) -> QueueResult<QueuedItem> {
        let json = json.ok_or_else(|| {
            QueueError::Serialization(format!("stream entry {} has no '{}' field", receipt, ITEM_FIELD))
        })?;
        let item = WorkItem::from_json(&json).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(QueuedItem { receipt, item })
    }

    /// Claim pending messages from dead workers
    async fn claim_abandoned(&self, consumer: &str) -> QueueResult<Option<QueuedItem>> {
        let mut conn = self.connection.write().await;
        let claim_ms = self.config.claim_timeout.as_millis() as usize;

        let result: RedisResult<StreamAutoClaimReply> = conn
            .xautoclaim_options(
                &self.stream_key,
                CONSUMER_GROUP,
                consumer,
                claim_ms,
                "0-0",
                StreamAutoClaimOptions::default().count(1),
            )
            .await;

        match result {
            Ok(reply) => match reply.claimed.into_iter().next() {
                Some(entry) => {
                    tracing::debug!(receipt = %entry.id, consumer, "Claimed abandoned item");
                    let json = entry.get::<String>(ITEM_FIELD);
                    Self::decode(entry.id, json).map(Some)
                }
                None => Ok(None),
            },
            Err(e) if e.to_string().contains("NOGROUP") => Ok(None),
            Err(e) => Err(QueueError::OperationFailed(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn push(&self, item: WorkItem) -> QueueResult<()> {
        self.ensure_open()?;
        let json = item.to_json().map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.connection.write().await;
        let _: String = conn.xadd(&self.stream_key, "*", &[(ITEM_FIELD, json)]).await?;
        conn.hincr::<_, _, _, i64>(&self.stats_key, "submitted", 1).await?;

        Ok(())
    }

    async fn pop(&self, consumer: &str, timeout: Duration) -> QueueResult<Option<QueuedItem>> {
        self.ensure_open()?;

        // Abandoned items first
        if let Some(item) = self.claim_abandoned(consumer).await? {
            return Ok(Some(item));
        }

        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(timeout.as_millis() as usize);

        let mut conn = self.connection.write().await;
        let reply: StreamReadReply = conn.xread_options(&[&self.stream_key], &[">"], &opts).await?;

        let entry = reply.keys.into_iter().next().and_then(|stream| stream.ids.into_iter().next());

        match entry {
            Some(entry) => {
                let json = entry.get::<String>(ITEM_FIELD);
                Self::decode(entry.id, json).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, receipt: &str) -> QueueResult<()> {
        let mut conn = self.connection.write().await;
        let acked: i64 = conn.xack(&self.stream_key, CONSUMER_GROUP, &[receipt]).await?;
        let _: i64 = conn.xdel(&self.stream_key, &[receipt]).await?;

        if acked > 0 {
            conn.hincr::<_, _, _, i64>(&self.stats_key, "completed", 1).await?;
        }
        Ok(())
    }

    async fn pending_count(&self) -> QueueResult<u64> {
        let mut conn = self.connection.write().await;
        let len: u64 = conn.xlen(&self.stream_key).await?;
        Ok(len)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.connection.write().await;

        let values: Vec<Option<i64>> = redis::cmd("HMGET")
            .arg(&self.stats_key)
            .arg("submitted")
            .arg("completed")
            .arg("purged")
            .query_async(&mut *conn)
            .await?;
        let outstanding: u64 = conn.xlen(&self.stream_key).await?;

        let field = |i: usize| values.get(i).copied().flatten().unwrap_or(0).max(0) as u64;
        Ok(QueueStats {
            submitted: field(0),
            completed: field(1),
            outstanding,
            purged: field(2),
        })
    }

    async fn purge(&self) -> QueueResult<u64> {
        let mut conn = self.connection.write().await;

        // An empty stream trims zero entries, which is not an error
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&self.stream_key)
            .arg("MAXLEN")
            .arg(0)
            .query_async(&mut *conn)
            .await?;

        if removed > 0 {
            conn.hincr::<_, _, _, i64>(&self.stats_key, "purged", removed as i64).await?;
        }
        tracing::info!(removed, stream = %self.stream_key, "Purged work queue");
        Ok(removed)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Anything touching the stream needs a running Redis instance

    #[test]
    fn test_config_defaults() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.claim_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_keys_use_prefix() {
        let mut config = RedisQueueConfig::with_url("redis://custom:6380");
        config.key_prefix = "run-7".into();
        assert_eq!(config.url, "redis://custom:6380");
        assert_eq!(config.stream_key(), "run-7:items:queue");
        assert_eq!(config.stats_key(), "run-7:stats");
    }

    #[test]
    fn test_decode_requires_item_field() {
        let err = RedisWorkQueue::decode("1-0".into(), None).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));

        let item = WorkItem::from_entry(
            &crate::manifest::ManifestEntry::file("/a", 3),
            crate::manifest::ItemMode::Write,
        );
        let decoded = RedisWorkQueue::decode("1-0".into(), Some(item.to_json().unwrap())).unwrap();
        assert_eq!(decoded.item, item);
        assert_eq!(decoded.receipt, "1-0");
    }
}
