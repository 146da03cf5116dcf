//! Resumable inventories.
//!
//! An inventory is a lazy sequence of items, each carrying an opaque cursor.
//! `iterate(after)` resumes strictly after the given cursor; the item whose
//! cursor equals `after` is never re-emitted.

pub mod chained;
pub mod periodic;

pub use chained::ChainedInventory;
pub use periodic::PeriodicInventory;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

use crate::error::InventoryError;
use crate::schemas::{Cursor, MessageId, TopicMessage};

/// One item produced by an inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryItem {
    pub id: MessageId,
    pub args: HashMap<String, Value>,
    pub cursor: Option<Cursor>,
}

impl InventoryItem {
    pub fn as_topic_message(&self) -> TopicMessage {
        TopicMessage::new(self.id.clone(), self.args.clone())
    }
}

#[async_trait]
pub trait Inventory: Send + Sync {
    /// Returns the ready items strictly after `after`, bounded by the
    /// inventory's batch size, without sleeping. Empty means exhausted (or
    /// nothing ready yet for time-driven inventories).
    async fn next_batch(
        &self,
        after: Option<&Cursor>,
    ) -> Result<Vec<InventoryItem>, InventoryError>;

    /// Lazy iteration resuming strictly after `after`. The default drains
    /// batches until one comes back empty; time-driven inventories override
    /// this to sleep until their next item is due.
    fn iterate(
        &self,
        after: Option<Cursor>,
    ) -> BoxStream<'_, Result<InventoryItem, InventoryError>> {
        Box::pin(futures::stream::try_unfold(
            (after, VecDeque::new(), false),
            move |(mut cursor, mut buffer, mut done)| async move {
                loop {
                    if let Some(item) = buffer.pop_front() {
                        let item: InventoryItem = item;
                        if item.cursor.is_some() {
                            cursor = item.cursor.clone();
                        }
                        return Ok(Some((item, (cursor, buffer, done))));
                    }
                    if done {
                        return Ok(None);
                    }
                    let batch = self.next_batch(cursor.as_ref()).await?;
                    if batch.is_empty() {
                        done = true;
                    }
                    buffer.extend(batch);
                }
            },
        ))
    }
}

/// Wall-clock source for time-driven inventories. Injected so tests can run
/// on virtual time.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let delay = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;
    }
}

fn default_batch_size() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticInventoryOptions {
    pub items: Vec<HashMap<String, Value>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// A fixed list of items; cursors are item indexes.
pub struct StaticInventory {
    items: Vec<HashMap<String, Value>>,
    batch_size: usize,
}

impl StaticInventory {
    pub fn from_options(options: StaticInventoryOptions) -> Self {
        Self {
            items: options.items,
            batch_size: options.batch_size,
        }
    }

    pub fn new(items: Vec<HashMap<String, Value>>) -> Self {
        Self {
            items,
            batch_size: default_batch_size(),
        }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn next_batch(
        &self,
        after: Option<&Cursor>,
    ) -> Result<Vec<InventoryItem>, InventoryError> {
        let start = match after {
            Some(cursor) => {
                let index: usize = cursor
                    .parse()
                    .map_err(|_| InventoryError::InvalidCursor(cursor.clone()))?;
                index + 1
            }
            None => 0,
        };

        Ok(self
            .items
            .iter()
            .enumerate()
            .skip(start)
            .take(self.batch_size)
            .map(|(index, args)| InventoryItem {
                id: index.to_string(),
                args: args.clone(),
                cursor: Some(index.to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn inventory() -> StaticInventory {
        StaticInventory::new(vec![
            HashMap::from([("n".to_string(), json!(1))]),
            HashMap::from([("n".to_string(), json!(2))]),
            HashMap::from([("n".to_string(), json!(3))]),
        ])
    }

    #[tokio::test]
    async fn test_static_inventory_iterates_all() {
        let items: Vec<_> = inventory().iterate(None).try_collect().await.unwrap();
        assert_eq!(
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            ["0", "1", "2"]
        );
    }

    #[tokio::test]
    async fn test_cursor_is_not_reemitted() {
        let inventory = inventory();
        let items: Vec<InventoryItem> = inventory.iterate(None).try_collect().await.unwrap();
        let cursor = items[1].cursor.clone().unwrap();

        let resumed: Vec<InventoryItem> = inventory
            .iterate(Some(cursor))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            resumed.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            ["2"]
        );
    }

    #[tokio::test]
    async fn test_small_batches_preserve_sequence() {
        let mut inventory = inventory();
        inventory.batch_size = 1;
        let items: Vec<InventoryItem> = inventory.iterate(None).try_collect().await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].args["n"], json!(3));
    }
}
