//! Inventory emitting one item per tick of a cron-like interval.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::stream::BoxStream;
use serde::Deserialize;

use super::{Clock, Inventory, InventoryItem, SystemClock};
use crate::error::InventoryError;
use crate::schemas::Cursor;

fn default_batch_size() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodicInventoryOptions {
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Cron expression (5 or 6 fields) or an `@daily`-style shortcut.
    pub interval: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

pub struct PeriodicInventory {
    schedule: Schedule,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    batch_size: usize,
    clock: Arc<dyn Clock>,
}

impl PeriodicInventory {
    pub fn from_options(options: PeriodicInventoryOptions) -> Result<Self, InventoryError> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        options: PeriodicInventoryOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InventoryError> {
        let expression = normalize_interval(&options.interval);
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| InventoryError::InvalidSchedule(format!("{}: {}", options.interval, e)))?;
        Ok(Self {
            schedule,
            start_date: options.start_date,
            end_date: options.end_date,
            batch_size: options.batch_size,
            clock,
        })
    }

    fn resume_from(&self, after: Option<&Cursor>) -> Result<DateTime<Utc>, InventoryError> {
        match after {
            Some(cursor) => DateTime::parse_from_rfc3339(cursor)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| InventoryError::InvalidCursor(cursor.clone())),
            None => Ok(self.start_date),
        }
    }

    fn item(tick: DateTime<Utc>) -> InventoryItem {
        let id = tick.to_rfc3339();
        InventoryItem {
            id: id.clone(),
            args: HashMap::new(),
            cursor: Some(id),
        }
    }

    fn within_end(&self, tick: DateTime<Utc>) -> bool {
        self.end_date.map_or(true, |end| tick <= end)
    }
}

/// Expands `@daily`-style shortcuts and prepends the seconds field to
/// five-field expressions.
fn normalize_interval(interval: &str) -> String {
    match interval.trim() {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        other if other.split_whitespace().count() == 5 => format!("0 {}", other),
        other => other.to_string(),
    }
}

#[async_trait]
impl Inventory for PeriodicInventory {
    async fn next_batch(
        &self,
        after: Option<&Cursor>,
    ) -> Result<Vec<InventoryItem>, InventoryError> {
        let from = self.resume_from(after)?;
        let now = self.clock.now();
        Ok(self
            .schedule
            .after(&from)
            .take_while(|tick| *tick <= now && self.within_end(*tick))
            .take(self.batch_size)
            .map(Self::item)
            .collect())
    }

    /// Emits every due tick, then sleeps until the next one instead of
    /// ending. Ends only once `end_date` is crossed.
    fn iterate(
        &self,
        after: Option<Cursor>,
    ) -> BoxStream<'_, Result<InventoryItem, InventoryError>> {
        Box::pin(futures::stream::try_unfold(
            (after, VecDeque::new()),
            move |(mut cursor, mut buffer)| async move {
                loop {
                    if let Some(item) = buffer.pop_front() {
                        let item: InventoryItem = item;
                        cursor = item.cursor.clone();
                        return Ok(Some((item, (cursor, buffer))));
                    }

                    let batch = self.next_batch(cursor.as_ref()).await?;
                    if !batch.is_empty() {
                        buffer.extend(batch);
                        continue;
                    }

                    let from = self.resume_from(cursor.as_ref())?;
                    match self.schedule.after(&from).next() {
                        Some(tick) if self.within_end(tick) => {
                            self.clock.sleep_until(tick).await;
                        }
                        _ => return Ok(None),
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VirtualClock;
    use futures::{StreamExt, TryStreamExt};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn daily(clock: Arc<VirtualClock>, end_date: Option<DateTime<Utc>>) -> PeriodicInventory {
        PeriodicInventory::with_clock(
            PeriodicInventoryOptions {
                start_date: utc("1969-12-25T00:00:00+00:00"),
                end_date,
                interval: "@daily".to_string(),
                batch_size: 3,
            },
            clock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_catches_up_then_sleeps() {
        let clock = Arc::new(VirtualClock::new(utc("1970-01-01T00:00:00+00:00")));
        let inventory = daily(clock.clone(), None);

        let mut stream = inventory.iterate(None);
        for expected in [
            "1969-12-26T00:00:00+00:00",
            "1969-12-27T00:00:00+00:00",
            "1969-12-28T00:00:00+00:00",
            "1969-12-29T00:00:00+00:00",
            "1969-12-30T00:00:00+00:00",
            "1969-12-31T00:00:00+00:00",
            "1970-01-01T00:00:00+00:00",
        ] {
            assert_eq!(stream.next().await.unwrap().unwrap().id, expected);
        }
        // The whole backlog was ready: no sleeping needed.
        assert_eq!(clock.now(), utc("1970-01-01T00:00:00+00:00"));

        // The next item only becomes due a (virtual) day later.
        assert_eq!(
            stream.next().await.unwrap().unwrap().id,
            "1970-01-02T00:00:00+00:00"
        );
        assert_eq!(clock.now(), utc("1970-01-02T00:00:00+00:00"));

        drop(stream);
        // next_batch returns ready items only, without sleeping.
        let batch = inventory.next_batch(None).await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_end_date_stops_iteration() {
        let clock = Arc::new(VirtualClock::new(utc("1970-01-01T00:00:00+00:00")));
        let inventory = daily(clock, Some(utc("1969-12-31T00:00:00+00:00")));

        let items: Vec<InventoryItem> = inventory.iterate(None).try_collect().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "1969-12-26T00:00:00+00:00",
                "1969-12-27T00:00:00+00:00",
                "1969-12-28T00:00:00+00:00",
                "1969-12-29T00:00:00+00:00",
                "1969-12-30T00:00:00+00:00",
                "1969-12-31T00:00:00+00:00",
            ]
        );
    }

    #[test]
    fn test_normalize_interval() {
        assert_eq!(normalize_interval("@daily"), "0 0 0 * * *");
        assert_eq!(normalize_interval("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_interval("0 0 0 * * *"), "0 0 0 * * *");
    }
}
