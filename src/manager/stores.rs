//! Store ports used by the manager services, with in-memory implementations.
//!
//! The SQL-backed variants live behind the same traits in the deployment
//! that carries a database.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::schemas::{
    ComponentDefinition, QueueItem, ResourceItem, ResourcesProviderItem, TopologyPatch,
};

/// Assignment state of one queue item.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub name: String,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assigned_to: Option<String>,
    /// Name of the job instance currently bound to this queue, if any.
    pub job_name: Option<String>,
}

impl QueueRow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assigned_at: None,
            assigned_to: None,
            job_name: None,
        }
    }
}

pub trait QueuesStore: Send + Sync {
    /// Queues already assigned to this worker with an assignment newer than
    /// `assigned_after`.
    fn get_assigned(
        &self,
        worker_id: &str,
        selector: Option<&str>,
        assigned_after: DateTime<Utc>,
    ) -> Vec<QueueRow>;

    /// Unassigned queues, or queues whose assignment expired before
    /// `assigned_before`.
    fn get_unassigned(
        &self,
        assigned_before: DateTime<Utc>,
        limit: Option<usize>,
        selector: Option<&str>,
    ) -> Vec<QueueRow>;

    fn update_assignment(
        &self,
        name: &str,
        assigned_at: Option<DateTime<Utc>>,
        assigned_to: Option<&str>,
    );
}

pub trait JobsStore: Send + Sync {
    fn set_failed(&self, job_name: &str, error: &str);
}

pub trait TopologyStore: Send + Sync {
    /// Upsert keyed by `(kind, name)`; only `data` changes on conflict.
    fn patch(&self, patch: TopologyPatch);

    fn get_patches(&self) -> Vec<TopologyPatch>;
}

fn matches_selector(name: &str, selector: Option<&str>) -> bool {
    selector.map_or(true, |selector| name.starts_with(selector))
}

// ============================================
// IN-MEMORY STORES
// ============================================

#[derive(Default)]
pub struct MemoryQueuesStore {
    rows: Mutex<Vec<QueueRow>>,
}

impl MemoryQueuesStore {
    pub fn new(rows: Vec<QueueRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn rows(&self) -> Vec<QueueRow> {
        self.rows.lock().clone()
    }
}

impl QueuesStore for MemoryQueuesStore {
    fn get_assigned(
        &self,
        worker_id: &str,
        selector: Option<&str>,
        assigned_after: DateTime<Utc>,
    ) -> Vec<QueueRow> {
        self.rows
            .lock()
            .iter()
            .filter(|row| {
                row.assigned_to.as_deref() == Some(worker_id)
                    && row.assigned_at.map_or(false, |at| at > assigned_after)
                    && matches_selector(&row.name, selector)
            })
            .cloned()
            .collect()
    }

    fn get_unassigned(
        &self,
        assigned_before: DateTime<Utc>,
        limit: Option<usize>,
        selector: Option<&str>,
    ) -> Vec<QueueRow> {
        let rows = self.rows.lock();
        let unassigned = rows.iter().filter(|row| {
            (row.assigned_at.is_none() || row.assigned_at.map_or(false, |at| at < assigned_before))
                && matches_selector(&row.name, selector)
        });
        match limit {
            Some(limit) => unassigned.take(limit).cloned().collect(),
            None => unassigned.cloned().collect(),
        }
    }

    fn update_assignment(
        &self,
        name: &str,
        assigned_at: Option<DateTime<Utc>>,
        assigned_to: Option<&str>,
    ) {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().find(|row| row.name == name) {
            row.assigned_at = assigned_at;
            row.assigned_to = assigned_to.map(str::to_string);
        }
    }
}

#[derive(Default)]
pub struct MemoryJobsStore {
    failed: Mutex<HashMap<String, String>>,
}

impl MemoryJobsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed_jobs(&self) -> HashMap<String, String> {
        self.failed.lock().clone()
    }
}

impl JobsStore for MemoryJobsStore {
    fn set_failed(&self, job_name: &str, error: &str) {
        self.failed
            .lock()
            .insert(job_name.to_string(), error.to_string());
    }
}

#[derive(Default)]
pub struct MemoryTopologyStore {
    patches: Mutex<HashMap<(String, String), TopologyPatch>>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TopologyStore for MemoryTopologyStore {
    fn patch(&self, patch: TopologyPatch) {
        let key = (patch.kind.clone(), patch.name.clone());
        self.patches
            .lock()
            .entry(key)
            .and_modify(|existing| existing.data = patch.data.clone())
            .or_insert(patch);
    }

    fn get_patches(&self) -> Vec<TopologyPatch> {
        let mut patches: Vec<_> = self.patches.lock().values().cloned().collect();
        patches.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        patches
    }
}

// ============================================
// STATIC DEFINITIONS
// ============================================

/// The catalog joined against queue rows when building a lease.
#[derive(Default)]
pub struct StaticDefinitions {
    pub queues: HashMap<String, QueueItem>,
    pub topics: HashMap<String, ComponentDefinition>,
    pub inventories: HashMap<String, ComponentDefinition>,
    pub executors: HashMap<String, ComponentDefinition>,
    pub resources_by_type: HashMap<String, Vec<ResourceItem>>,
    pub resources_providers_by_type: HashMap<String, Vec<ResourcesProviderItem>>,
}

impl StaticDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queue(&mut self, item: QueueItem) {
        self.queues.insert(item.name.clone(), item);
    }

    pub fn add_topic(&mut self, definition: ComponentDefinition) {
        self.topics.insert(definition.name.clone(), definition);
    }

    pub fn add_executor(&mut self, definition: ComponentDefinition) {
        self.executors.insert(definition.name.clone(), definition);
    }

    pub fn add_resource(&mut self, item: ResourceItem) {
        self.resources_by_type
            .entry(item.resource_type.clone())
            .or_default()
            .push(item);
    }

    pub fn add_resources_provider(&mut self, item: ResourcesProviderItem) {
        self.resources_providers_by_type
            .entry(item.resource_type.clone())
            .or_default()
            .push(item);
    }
}
