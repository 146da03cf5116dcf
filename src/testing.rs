//! Test support: virtual time sources and in-memory stand-ins for the
//! external stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ExecutorError;
use crate::executor::HealthStore;
use crate::inventory::Clock;
use crate::schemas::TopicMessage;

/// A clock that only moves when something sleeps on it. `sleep_until` jumps
/// straight to the deadline, so schedule-driven code can be tested without
/// waiting.
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_to(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock();
        if to > *now {
            *now = to;
        }
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        self.advance_to(deadline);
        // Yield so concurrent tasks observe the new time.
        tokio::task::yield_now().await;
    }
}

/// In-memory liveness keys with TTLs on the tokio clock, so paused-time
/// tests can expire them deterministically.
pub struct MemoryHealthStore {
    keys: Mutex<HashMap<String, Instant>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn remove(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

impl Default for MemoryHealthStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthStore for MemoryHealthStore {
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), ExecutorError> {
        self.keys
            .lock()
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn is_alive(&self, key: &str) -> Result<bool, ExecutorError> {
        Ok(self
            .keys
            .lock()
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false))
    }
}

/// Shorthand for building messages in tests.
pub fn message(id: &str, args: &[(&str, Value)]) -> TopicMessage {
    TopicMessage::new(
        id,
        args.iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

/// A clock shared between test code and the component under test.
pub fn shared_clock(start: DateTime<Utc>) -> Arc<VirtualClock> {
    Arc::new(VirtualClock::new(start))
}
