//! In-process topic backed by a named bounded queue.
//!
//! Channels live in a process-wide registry so that several topic instances
//! (and several jobs) can share one queue by name, mirroring how broker
//! queues behave. Nacked deliveries go back to the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

use super::{Acknowledge, Topic, TopicDelivery};
use crate::error::TopicError;
use crate::schemas::TopicMessage;

static CHANNELS: Lazy<Mutex<HashMap<String, Arc<Channel>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

struct Channel {
    queue: Mutex<VecDeque<TopicMessage>>,
    capacity: usize,
    publishers: Notify,
    consumers: Notify,
}

impl Channel {
    fn named(name: &str, capacity: usize) -> Arc<Channel> {
        CHANNELS
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Channel {
                    queue: Mutex::new(VecDeque::new()),
                    capacity,
                    publishers: Notify::new(),
                    consumers: Notify::new(),
                })
            })
            .clone()
    }
}

fn default_capacity() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryTopicOptions {
    /// Shared queue name; defaults to the topic name.
    pub queue: Option<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for MemoryTopicOptions {
    fn default() -> Self {
        Self {
            queue: None,
            capacity: default_capacity(),
        }
    }
}

pub struct MemoryTopic {
    name: String,
    channel: Arc<Channel>,
    closed: AtomicBool,
}

impl MemoryTopic {
    pub fn from_options(name: impl Into<String>, options: MemoryTopicOptions) -> Self {
        let name = name.into();
        let queue = options.queue.as_deref().unwrap_or(&name);
        Self {
            channel: Channel::named(queue, options.capacity),
            name,
            closed: AtomicBool::new(false),
        }
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self::from_options(name, MemoryTopicOptions::default())
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self::from_options(
            name,
            MemoryTopicOptions {
                queue: None,
                capacity,
            },
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<(), TopicError> {
        Ok(())
    }

    async fn publish(&self, message: &TopicMessage, wait: bool) -> Result<bool, TopicError> {
        loop {
            let consumed = self.channel.publishers.notified();
            tokio::pin!(consumed);
            // Register before probing so a concurrent consume or close
            // cannot slip between the probe and the wait.
            consumed.as_mut().enable();
            if self.is_closed() {
                return Err(TopicError::Closed);
            }
            {
                let mut queue = self.channel.queue.lock();
                if queue.len() < self.channel.capacity {
                    queue.push_back(message.clone());
                    self.channel.consumers.notify_one();
                    return Ok(true);
                }
            }
            if !wait {
                return Ok(false);
            }
            consumed.await;
        }
    }

    async fn next(&self) -> Result<Option<TopicDelivery>, TopicError> {
        loop {
            let published = self.channel.consumers.notified();
            tokio::pin!(published);
            published.as_mut().enable();
            let message = self.channel.queue.lock().pop_front();
            match message {
                Some(message) => {
                    self.channel.publishers.notify_one();
                    return Ok(Some(TopicDelivery::with_acker(
                        message.clone(),
                        Box::new(MemoryAcker {
                            channel: self.channel.clone(),
                            message,
                        }),
                    )));
                }
                // Close stops new items, but messages already accepted are
                // still delivered.
                None if self.is_closed() => return Ok(None),
                None => published.await,
            }
        }
    }

    async fn close(&self) -> Result<(), TopicError> {
        self.closed.store(true, Ordering::SeqCst);
        // Wake consumers blocked on an empty queue and publishers blocked on
        // a full one so they observe the closed flag.
        self.channel.consumers.notify_waiters();
        self.channel.publishers.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    channel: Arc<Channel>,
    message: TopicMessage,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), TopicError> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), TopicError> {
        self.channel.queue.lock().push_front(self.message);
        self.channel.consumers.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn unique_topic(capacity: usize) -> MemoryTopic {
        MemoryTopic::with_capacity(Uuid::new_v4().to_string(), capacity)
    }

    fn message(id: &str) -> TopicMessage {
        TopicMessage::new(id, HashMap::new())
    }

    #[tokio::test]
    async fn test_publish_consume_preserves_order() {
        let topic = unique_topic(10);
        for id in ["0", "1", "2"] {
            assert!(topic.publish(&message(id), true).await.unwrap());
        }
        for id in ["0", "1", "2"] {
            let delivery = topic.next().await.unwrap().unwrap();
            assert_eq!(delivery.message.id, id);
            delivery.resolve(true).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bounded_backpressure() {
        let topic = Arc::new(unique_topic(2));
        assert!(topic.publish(&message("0"), false).await.unwrap());
        assert!(topic.publish(&message("1"), false).await.unwrap());
        // Full: immediate publish reports back-pressure.
        assert!(!topic.publish(&message("2"), false).await.unwrap());

        // A waiting publish blocks until one message is consumed.
        let blocked = {
            let topic = topic.clone();
            tokio::spawn(async move { topic.publish(&message("2"), true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        let delivery = topic.next().await.unwrap().unwrap();
        delivery.resolve(true).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(100), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_nack_requeues_at_front() {
        let topic = unique_topic(10);
        topic.publish(&message("0"), true).await.unwrap();
        topic.publish(&message("1"), true).await.unwrap();

        let delivery = topic.next().await.unwrap().unwrap();
        assert_eq!(delivery.message.id, "0");
        delivery.resolve(false).await.unwrap();

        let delivery = topic.next().await.unwrap().unwrap();
        assert_eq!(delivery.message.id, "0");
    }

    #[tokio::test]
    async fn test_closed_topic() {
        let topic = unique_topic(10);
        topic.close().await.unwrap();
        topic.close().await.unwrap();
        assert!(matches!(
            topic.publish(&message("0"), true).await,
            Err(TopicError::Closed)
        ));
        assert!(topic.next().await.unwrap().is_none());
    }
}
