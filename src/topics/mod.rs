//! Topic contract and transports.
//!
//! A topic is opened once, consumed as a lazy sequence of acknowledgeable
//! deliveries, published to with optional back-pressure, and closed
//! idempotently. Publishing on a closed topic is a distinct terminal error.

pub mod broker;
pub mod file;
pub mod memory;
pub mod null;

pub use broker::{BrokerTopicOptions, RedisStreamTopic};
pub use file::{FileMode, FileTopic};
pub use memory::MemoryTopic;
pub use null::NullTopic;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::TopicError;
use crate::schemas::{ComponentDefinition, TopicMessage};

/// One consumed message plus its acknowledgement handle.
///
/// Resolve with success to ack, with failure to nack (the transport retries
/// or dead-letters it). Dropping an unresolved delivery leaves it pending:
/// broker transports redeliver it after their idle deadline.
pub struct TopicDelivery {
    pub message: TopicMessage,
    acker: Option<Box<dyn Acknowledge>>,
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), TopicError>;
    async fn nack(self: Box<Self>) -> Result<(), TopicError>;
}

impl TopicDelivery {
    /// A delivery with no acknowledgement side effects.
    pub fn new(message: TopicMessage) -> Self {
        Self {
            message,
            acker: None,
        }
    }

    pub fn with_acker(message: TopicMessage, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            message,
            acker: Some(acker),
        }
    }

    /// Splits the delivery into its message and acknowledgement handle.
    pub fn into_parts(self) -> (TopicMessage, Option<Box<dyn Acknowledge>>) {
        (self.message, self.acker)
    }

    pub async fn resolve(mut self, success: bool) -> Result<(), TopicError> {
        match self.acker.take() {
            Some(acker) if success => acker.ack().await,
            Some(acker) => acker.nack().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent.
    async fn open(&self) -> Result<(), TopicError>;

    /// Publishes one message. With `wait = false` returns `Ok(false)`
    /// immediately on back-pressure; with `wait = true` blocks until the
    /// message is accepted. `TopicError::Closed` once the topic is closed.
    async fn publish(&self, message: &TopicMessage, wait: bool) -> Result<bool, TopicError>;

    /// Next delivery, or `Ok(None)` once the topic is exhausted or closed.
    async fn next(&self) -> Result<Option<TopicDelivery>, TopicError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), TopicError>;
}

/// Builds a topic from its catalog definition.
pub fn build_topic(definition: &ComponentDefinition) -> Result<Arc<dyn Topic>, TopicError> {
    let options = serde_json::to_value(&definition.options)?;
    match definition.kind.as_str() {
        "FileTopic" => Ok(Arc::new(FileTopic::from_options(
            &definition.name,
            serde_json::from_value(options)?,
        ))),
        "NullTopic" => Ok(Arc::new(NullTopic::new(&definition.name))),
        "MemoryTopic" => Ok(Arc::new(MemoryTopic::from_options(
            &definition.name,
            serde_json::from_value(options)?,
        ))),
        "RedisStreamTopic" => Ok(Arc::new(RedisStreamTopic::from_options(
            &definition.name,
            serde_json::from_value(options)?,
        ))),
        other => {
            warn!(topic = %definition.name, kind = %other, "Unknown topic kind");
            Err(TopicError::Unknown(other.to_string()))
        }
    }
}
