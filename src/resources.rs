//! Shared resource pools with exclusive leases.
//!
//! Resources are keyed by type. `acquire` blocks until every required type
//! has an available resource and takes them all under a single lock, so a
//! cancelled acquisition never leaks a partial hold. Pipelines may rewrite a
//! resource's state or defer its next availability through the lease; both
//! are applied when the lease returns to the pool. A resource may also carry
//! a default cooldown, applied on every release that has no explicit
//! deferral.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::schemas::{ResourceItem, ResourceUsed};

/// One pooled resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,
    pub resource_type: String,
    pub state: Option<Value>,
    pub data: HashMap<String, Value>,
    /// Cooldown before the resource is handed out again after a release
    /// without an explicit deferral.
    pub default_delay: Option<Duration>,
}

impl Resource {
    pub fn from_item(item: &ResourceItem) -> Self {
        Self {
            name: item.name.clone(),
            resource_type: item.resource_type.clone(),
            state: None,
            data: item.data.clone(),
            default_delay: item.default_delay.map(Duration::from_secs_f64),
        }
    }

    /// The argument object injected into pipelines: name and state merged
    /// with the resource's own data.
    pub fn as_args(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert("state".into(), self.state.clone().unwrap_or(Value::Null));
        for (k, v) in &self.data {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

struct PoolEntry {
    resource: Resource,
    available_at: Option<Instant>,
}

struct Inner {
    pools: Mutex<HashMap<String, Vec<PoolEntry>>>,
    released: Notify,
}

/// The single source of truth for resource availability and state.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pools: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    pub fn add(&self, resource: Resource) {
        let mut pools = self.inner.pools.lock();
        pools
            .entry(resource.resource_type.clone())
            .or_default()
            .push(PoolEntry {
                resource,
                available_at: None,
            });
        drop(pools);
        self.inner.released.notify_waiters();
    }

    /// Acquires one resource for every required `param-name -> type` entry.
    ///
    /// Blocks until all types are simultaneously available; acquisition is
    /// all-or-nothing, so nothing is held while waiting.
    pub async fn acquire(&self, needs: &HashMap<String, String>) -> ResourcesContext {
        if needs.is_empty() {
            return ResourcesContext::default();
        }

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // Register before probing the pools so a concurrent release
            // cannot slip between the probe and the wait.
            released.as_mut().enable();

            let next_available = {
                let mut pools = self.inner.pools.lock();
                match try_take_all(&mut pools, needs) {
                    Ok(taken) => {
                        debug!(count = taken.len(), "Resources acquired");
                        return ResourcesContext {
                            leases: taken
                                .into_iter()
                                .map(|(param, resource)| {
                                    (
                                        param,
                                        ResourceLease {
                                            resource,
                                            release_at: None,
                                            inner: self.inner.clone(),
                                        },
                                    )
                                })
                                .collect(),
                        };
                    }
                    Err(next_available) => next_available,
                }
            };

            match next_available {
                Some(at) => {
                    tokio::select! {
                        _ = &mut released => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => released.await,
            }
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempts to take one available resource per needed param. On failure
/// returns the earliest deferred availability among the needed types, if any.
fn try_take_all(
    pools: &mut HashMap<String, Vec<PoolEntry>>,
    needs: &HashMap<String, String>,
) -> Result<Vec<(String, Resource)>, Option<Instant>> {
    let now = Instant::now();
    let mut picked: Vec<(String, usize)> = Vec::with_capacity(needs.len());
    let mut next_available: Option<Instant> = None;

    for (param, resource_type) in needs {
        let pool = pools.get(resource_type).map(Vec::as_slice).unwrap_or(&[]);
        let mut found = None;
        for (index, entry) in pool.iter().enumerate() {
            // One resource can satisfy only one param at a time.
            if picked
                .iter()
                .any(|(p, i)| *i == index && needs[p] == *resource_type)
            {
                continue;
            }
            match entry.available_at {
                Some(at) if at > now => {
                    next_available = Some(next_available.map_or(at, |cur| cur.min(at)));
                }
                _ => {
                    found = Some(index);
                    break;
                }
            }
        }
        match found {
            Some(index) => picked.push((param.clone(), index)),
            None => return Err(next_available),
        }
    }

    // All needs satisfied: remove the picked entries. Highest index first so
    // earlier removals do not shift later ones.
    picked.sort_by(|a, b| b.1.cmp(&a.1));
    let mut taken = Vec::with_capacity(picked.len());
    for (param, index) in picked {
        let resource_type = &needs[&param];
        let entry = pools
            .get_mut(resource_type)
            .map(|pool| pool.swap_remove(index));
        match entry {
            Some(entry) => taken.push((param, entry.resource)),
            None => unreachable!("picked index comes from the same pool"),
        }
    }
    Ok(taken)
}

/// A scoped lease over the resources acquired for one message.
#[derive(Default)]
pub struct ResourcesContext {
    leases: HashMap<String, ResourceLease>,
}

impl ResourcesContext {
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn leases(&self) -> &HashMap<String, ResourceLease> {
        &self.leases
    }

    /// Argument objects for injection, keyed by param name.
    pub fn as_args(&self) -> HashMap<String, Value> {
        self.leases
            .iter()
            .map(|(param, lease)| (param.clone(), lease.resource.as_args()))
            .collect()
    }

    /// Applies the state rewrites and deferred releases reported by a
    /// pipeline result. Reports against types not held are logged and
    /// ignored.
    pub fn apply_used(&mut self, used: &[ResourceUsed]) {
        for resource_used in used {
            let lease = self
                .leases
                .values_mut()
                .find(|lease| lease.resource.resource_type == resource_used.resource_type);
            match lease {
                Some(lease) => {
                    if let Some(at) = resource_used.release_at {
                        lease.release_later(at);
                    }
                    if let Some(state) = &resource_used.state {
                        lease.update_state(state.clone());
                    }
                }
                None => {
                    warn!(
                        resource_type = %resource_used.resource_type,
                        "Resource used but not held"
                    );
                }
            }
        }
    }
}

/// Exclusive lease over a single resource. Returns it to the pool on drop,
/// deferred to `release_at` when one was requested.
pub struct ResourceLease {
    resource: Resource,
    release_at: Option<DateTime<Utc>>,
    inner: Arc<Inner>,
}

impl ResourceLease {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Defers the resource's next availability. Best-effort precision but
    /// monotone: the resource will not be handed out before `at`.
    pub fn release_later(&mut self, at: DateTime<Utc>) {
        self.release_at = Some(at);
    }

    /// Rewrites the stored state; visible to the next acquirer.
    pub fn update_state(&mut self, state: Value) {
        self.resource.state = Some(state);
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let available_at = match self.release_at {
            Some(at) => {
                let delay = (at - Utc::now()).to_std().unwrap_or_default();
                Some(Instant::now() + delay)
            }
            None => self
                .resource
                .default_delay
                .map(|delay| Instant::now() + delay),
        };
        let resource = Resource {
            name: std::mem::take(&mut self.resource.name),
            resource_type: std::mem::take(&mut self.resource.resource_type),
            state: self.resource.state.take(),
            data: std::mem::take(&mut self.resource.data),
            default_delay: self.resource.default_delay,
        };
        let mut pools = self.inner.pools.lock();
        pools
            .entry(resource.resource_type.clone())
            .or_default()
            .push(PoolEntry {
                resource,
                available_at,
            });
        drop(pools);
        self.inner.released.notify_waiters();
    }
}
