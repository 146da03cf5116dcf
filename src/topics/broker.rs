//! Broker-backed topic on Redis Streams with consumer groups.
//!
//! Queue semantics layered on a stream:
//! - bounded length, enforced at publish time with fixed-delay retries,
//! - per-message TTL carried in an `expire_at` field and enforced on the
//!   consumer side (streams have no native per-message expiry),
//! - bounded redelivery via the pending-entries delivery count, overflow
//!   routed to a dead-letter stream when one is configured,
//! - unacknowledged entries survive consumer disconnects and are reclaimed
//!   after the ack deadline; the connection manager reconnects transparently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisResult};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Acknowledge, Topic, TopicDelivery};
use crate::error::TopicError;
use crate::schemas::TopicMessage;

const PAYLOAD_FIELD: &str = "payload";
const EXPIRE_AT_FIELD: &str = "expire_at";

fn default_group() -> String {
    "conveyor".to_string()
}

fn default_prefetch() -> usize {
    10
}

fn default_retry_publish_delay_ms() -> u64 {
    1_000
}

fn default_ack_deadline_ms() -> u64 {
    30_000
}

fn default_durable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerTopicOptions {
    pub url: String,
    /// Stream key; defaults to the topic name.
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default = "default_group")]
    pub consumer_group: String,
    /// Bounded queue length; publishes beyond it are back-pressured.
    #[serde(default)]
    pub max_length: Option<u64>,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: usize,
    /// Redeliveries allowed before a message is given up on.
    #[serde(default)]
    pub max_retry: Option<u32>,
    /// Stream receiving messages that exhausted their retries.
    #[serde(default)]
    pub dead_letter: Option<String>,
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default = "default_retry_publish_delay_ms")]
    pub retry_publish_delay_ms: u64,
    /// Idle time after which an unacknowledged delivery is reclaimed.
    #[serde(default = "default_ack_deadline_ms")]
    pub ack_deadline_ms: u64,
}

pub struct RedisStreamTopic {
    name: String,
    options: BrokerTopicOptions,
    stream: String,
    consumer: String,
    connection: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
}

impl RedisStreamTopic {
    pub fn from_options(name: impl Into<String>, options: BrokerTopicOptions) -> Self {
        let name = name.into();
        let stream = options.stream.clone().unwrap_or_else(|| name.clone());
        Self {
            consumer: format!("{}-{}", name, Uuid::new_v4()),
            name,
            stream,
            options,
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connection(&self) -> Result<ConnectionManager, TopicError> {
        self.open().await?;
        let guard = self.connection.lock().await;
        guard.clone().ok_or(TopicError::Closed)
    }

    async fn ensure_consumer_group(&self, conn: &mut ConnectionManager) -> Result<(), TopicError> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.options.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %self.stream, group = %self.options.consumer_group, "Declared queue");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Walks the pending entries: dead-letters the ones that exhausted their
    /// retries and reclaims the first idle one for redelivery.
    async fn reclaim_pending(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Option<TopicDelivery>, TopicError> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.stream,
                &self.options.consumer_group,
                "-",
                "+",
                self.options.prefetch_count,
            )
            .await?;

        for entry in pending.ids {
            if (entry.last_delivered_ms as u64) < self.options.ack_deadline_ms {
                continue;
            }

            let exhausted = self
                .options
                .max_retry
                .map(|max_retry| entry.times_delivered > max_retry as usize)
                .unwrap_or(false);
            if exhausted {
                self.dead_letter(conn, &entry.id).await?;
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.stream,
                    &self.options.consumer_group,
                    &self.consumer,
                    self.options.ack_deadline_ms as usize,
                    &[&entry.id],
                )
                .await?;
            for claimed_entry in claimed.ids {
                if let Some(delivery) = self.decode_entry(conn, &claimed_entry.id, &claimed_entry.map).await? {
                    return Ok(Some(delivery));
                }
            }
        }
        Ok(None)
    }

    async fn dead_letter(
        &self,
        conn: &mut ConnectionManager,
        entry_id: &str,
    ) -> Result<(), TopicError> {
        if let Some(dead_letter) = &self.options.dead_letter {
            let range: StreamRangeReply = conn.xrange(&self.stream, entry_id, entry_id).await?;
            for entry in range.ids {
                let fields: Vec<(String, Vec<u8>)> = entry
                    .map
                    .iter()
                    .filter_map(|(k, v)| match v {
                        redis::Value::BulkString(bytes) => Some((k.clone(), bytes.clone())),
                        _ => None,
                    })
                    .collect();
                let _: String = conn.xadd(dead_letter, "*", &fields).await?;
            }
            warn!(stream = %self.stream, entry = %entry_id, "Message routed to dead letter");
        } else {
            warn!(stream = %self.stream, entry = %entry_id, "Retries exhausted, dropping message");
        }
        let _: usize = conn
            .xack(&self.stream, &self.options.consumer_group, &[entry_id])
            .await?;
        Ok(())
    }

    /// Decodes one stream entry into a delivery. Expired entries are acked
    /// away and `None` is returned.
    async fn decode_entry(
        &self,
        conn: &mut ConnectionManager,
        entry_id: &str,
        fields: &std::collections::HashMap<String, redis::Value>,
    ) -> Result<Option<TopicDelivery>, TopicError> {
        if let Some(redis::Value::BulkString(bytes)) = fields.get(EXPIRE_AT_FIELD) {
            let expire_at: i64 = String::from_utf8_lossy(bytes).parse().unwrap_or(i64::MAX);
            if Utc::now().timestamp_millis() >= expire_at {
                debug!(stream = %self.stream, entry = %entry_id, "Message expired");
                let _: usize = conn
                    .xack(&self.stream, &self.options.consumer_group, &[entry_id])
                    .await?;
                return Ok(None);
            }
        }

        let payload = match fields.get(PAYLOAD_FIELD) {
            Some(redis::Value::BulkString(bytes)) => bytes.as_slice(),
            _ => {
                error!(stream = %self.stream, entry = %entry_id, "Entry without payload");
                let _: usize = conn
                    .xack(&self.stream, &self.options.consumer_group, &[entry_id])
                    .await?;
                return Ok(None);
            }
        };
        let message: TopicMessage = serde_json::from_slice(payload)?;

        Ok(Some(TopicDelivery::with_acker(
            message,
            Box::new(StreamAcker {
                conn: conn.clone(),
                stream: self.stream.clone(),
                group: self.options.consumer_group.clone(),
                entry_id: entry_id.to_string(),
            }),
        )))
    }
}

#[async_trait]
impl Topic for RedisStreamTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), TopicError> {
        if self.is_closed() {
            return Err(TopicError::Closed);
        }
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = Client::open(self.options.url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        self.ensure_consumer_group(&mut conn).await?;
        *guard = Some(conn);
        Ok(())
    }

    async fn publish(&self, message: &TopicMessage, wait: bool) -> Result<bool, TopicError> {
        if self.is_closed() {
            return Err(TopicError::Closed);
        }
        let mut conn = self.connection().await?;
        let payload = serde_json::to_vec(message)?;

        loop {
            if self.is_closed() {
                return Err(TopicError::Closed);
            }
            if let Some(max_length) = self.options.max_length {
                let length: u64 = conn.xlen(&self.stream).await?;
                if length >= max_length {
                    if !wait {
                        return Ok(false);
                    }
                    tokio::time::sleep(Duration::from_millis(self.options.retry_publish_delay_ms))
                        .await;
                    continue;
                }
            }

            let mut fields: Vec<(&str, Vec<u8>)> = vec![(PAYLOAD_FIELD, payload.clone())];
            if let Some(expire_after) = message.expire_after {
                let expire_at = Utc::now().timestamp_millis() + expire_after.as_millis() as i64;
                fields.push((EXPIRE_AT_FIELD, expire_at.to_string().into_bytes()));
            }
            let _: String = conn.xadd(&self.stream, "*", &fields).await?;
            return Ok(true);
        }
    }

    async fn next(&self) -> Result<Option<TopicDelivery>, TopicError> {
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            let mut conn = self.connection().await?;

            if let Some(delivery) = self.reclaim_pending(&mut conn).await? {
                return Ok(Some(delivery));
            }

            let opts = StreamReadOptions::default()
                .group(&self.options.consumer_group, &self.consumer)
                .count(1)
                .block(1_000);
            let reply: StreamReadReply = conn.xread_options(&[&self.stream], &[">"], &opts).await?;

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    if let Some(delivery) = self.decode_entry(&mut conn, &entry.id, &entry.map).await? {
                        return Ok(Some(delivery));
                    }
                }
            }
            // Block timed out with nothing to deliver; loop to re-check the
            // closed flag.
        }
    }

    async fn close(&self) -> Result<(), TopicError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.connection.lock().await;
        if let Some(mut conn) = guard.take() {
            // Redis has no broker-restart scoping: a non-durable stream is
            // dropped on close, same as auto-delete.
            if self.options.auto_delete || !self.options.durable {
                let _: RedisResult<usize> = conn.del(&self.stream).await;
            }
        }
        info!(topic = %self.name, "Topic closed");
        Ok(())
    }
}

struct StreamAcker {
    conn: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
}

#[async_trait]
impl Acknowledge for StreamAcker {
    async fn ack(mut self: Box<Self>) -> Result<(), TopicError> {
        let _: usize = self
            .conn
            .xack(&self.stream, &self.group, &[&self.entry_id])
            .await?;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TopicError> {
        // Leave the entry pending: it is reclaimed for redelivery once the
        // ack deadline elapses.
        Ok(())
    }
}
