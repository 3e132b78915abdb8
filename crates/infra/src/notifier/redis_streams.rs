//! Redis Streams transport for order status notifications.
//!
//! - **Producer**: `XADD <stream> * key <order_id> status <status> payload <json>`
//! - **Consumer group**: `XREADGROUP` / `XACK`; pending (delivered but not
//!   acknowledged) entries of this consumer are re-read before new ones
//! - **Dead-letter stream**: `<stream>:dlq`, fed by `dead_letter`

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tracing::{instrument, warn};

use loms_events::{Notifier, NotifyError, OrderStatusNotification};

use crate::notifications::{Delivery, NotificationStream, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

/// Publishes notifications to a Redis stream.
#[derive(Clone)]
pub struct RedisStreamsNotifier {
    conn: MultiplexedConnection,
    stream_key: String,
}

impl RedisStreamsNotifier {
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            stream_key: stream_key.into(),
        })
    }

    fn xadd(&self, notification: &OrderStatusNotification) -> Result<redis::Cmd, NotifyError> {
        let payload = notification.to_json()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key)
            .arg("*")
            .arg("key")
            .arg(notification.partition_key())
            .arg("status")
            .arg(notification.status.as_str())
            .arg("payload")
            .arg(payload);
        Ok(cmd)
    }
}

#[async_trait]
impl Notifier for RedisStreamsNotifier {
    #[instrument(
        skip(self, notification),
        fields(stream_key = %self.stream_key, order_id = %notification.order_id, status = %notification.status),
        err
    )]
    async fn send(&self, notification: OrderStatusNotification) -> Result<(), NotifyError> {
        let cmd = self.xadd(&notification)?;
        let mut conn = self.conn.clone();
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| NotifyError::Transport(format!("XADD failed: {e}")))?;
        Ok(())
    }

    /// One round trip for the whole batch.
    #[instrument(skip(self, notifications), fields(stream_key = %self.stream_key, count = notifications.len()), err)]
    async fn send_all(
        &self,
        notifications: Vec<OrderStatusNotification>,
    ) -> Result<(), NotifyError> {
        if notifications.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for notification in &notifications {
            pipe.add_command(self.xadd(notification)?);
        }

        let mut conn = self.conn.clone();
        let _: Vec<String> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| NotifyError::Transport(format!("XADD pipeline failed: {e}")))?;
        Ok(())
    }
}

/// Consumer-group reader used by the notification worker.
#[derive(Clone)]
pub struct RedisStreamsConsumer {
    conn: MultiplexedConnection,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block_ms: usize,
}

impl RedisStreamsConsumer {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        batch_size: usize,
        block_ms: usize,
    ) -> Result<Self, RedisStreamsError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let stream_key = stream_key.into();
        let consumer = Self {
            conn,
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: group.into(),
            consumer: consumer.into(),
            batch_size: batch_size.max(1),
            block_ms,
        };
        consumer.ensure_consumer_group().await?;
        Ok(consumer)
    }

    async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    /// `XREADGROUP ... STREAMS <key> <from>`; `0` re-reads own pending
    /// entries, `>` reads new ones.
    async fn read_group(&self, from: &str, block: bool) -> Result<Vec<Delivery>, StreamError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.batch_size);
        if block {
            cmd.arg("BLOCK").arg(self.block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(from);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_delivery)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Entries without a payload field come through empty; the worker treats
/// them as undecodable and acknowledges them.
fn to_delivery(entry: StreamId) -> Delivery {
    let payload = entry.get::<String>("payload").unwrap_or_else(|| {
        warn!(message_id = %entry.id, "stream entry without payload field");
        String::new()
    });
    Delivery {
        id: entry.id,
        payload,
    }
}

#[async_trait]
impl NotificationStream for RedisStreamsConsumer {
    async fn next_batch(&self) -> Result<Vec<Delivery>, StreamError> {
        let pending = self.read_group("0", false).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read_group(">", true).await
    }

    async fn ack(&self, ids: &[String]) -> Result<(), StreamError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.stream_key).arg(&self.group);
        for id in ids {
            cmd.arg(id);
        }

        let mut conn = self.conn.clone();
        let _: u64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&delivery.id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(message_id = %delivery.id, reason, "message sent to dead-letter stream");
        self.ack(std::slice::from_ref(&delivery.id)).await
    }
}
