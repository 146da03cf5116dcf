//! Sequential composition of named sub-inventories.
//!
//! The chained cursor is a one-entry mapping `{sub-name: sub-cursor}`.
//! Resumption skips every sub-inventory before the named one entirely and
//! resumes inside it strictly after the sub-cursor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Inventory, InventoryItem};
use crate::error::InventoryError;
use crate::schemas::Cursor;

pub struct ChainedInventory {
    inventories: Vec<(String, Arc<dyn Inventory>)>,
}

impl ChainedInventory {
    pub fn new(inventories: Vec<(String, Arc<dyn Inventory>)>) -> Self {
        Self { inventories }
    }

    fn wrap(&self, name: &str, item: InventoryItem) -> InventoryItem {
        InventoryItem {
            id: format!("{}:{}", name, item.id),
            args: HashMap::from([(
                name.to_string(),
                serde_json::to_value(&item.args).unwrap_or_default(),
            )]),
            cursor: item.cursor.map(|sub_cursor| {
                serde_json::to_string(&HashMap::from([(name.to_string(), sub_cursor)]))
                    .unwrap_or_default()
            }),
        }
    }

    fn resume_point(&self, after: Option<&Cursor>) -> Result<(usize, Option<Cursor>), InventoryError> {
        let Some(cursor) = after else {
            return Ok((0, None));
        };
        let map: HashMap<String, String> = serde_json::from_str(cursor)
            .map_err(|_| InventoryError::InvalidCursor(cursor.clone()))?;
        let (name, sub_cursor) = map
            .into_iter()
            .next()
            .ok_or_else(|| InventoryError::InvalidCursor(cursor.clone()))?;
        let index = self
            .inventories
            .iter()
            .position(|(n, _)| *n == name)
            .ok_or_else(|| InventoryError::InvalidCursor(cursor.clone()))?;
        Ok((index, Some(sub_cursor)))
    }
}

#[async_trait]
impl Inventory for ChainedInventory {
    async fn next_batch(
        &self,
        after: Option<&Cursor>,
    ) -> Result<Vec<InventoryItem>, InventoryError> {
        let (mut index, mut sub_after) = self.resume_point(after)?;

        while let Some((name, inventory)) = self.inventories.get(index) {
            let batch = inventory.next_batch(sub_after.as_ref()).await?;
            if batch.is_empty() {
                index += 1;
                sub_after = None;
                continue;
            }
            return Ok(batch
                .into_iter()
                .map(|item| self.wrap(name, item))
                .collect());
        }
        Ok(Vec::new())
    }
}
