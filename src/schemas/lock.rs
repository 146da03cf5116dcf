//! Wire types for the manager lease protocol and read APIs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::QueueItem;

/// Worker request for a batch of work assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInput {
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// When set, only jobs bound to one of these executors are offered, and
    /// the unassigned fill is not capped (filtering happens afterwards).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executors: Option<Vec<String>>,
}

/// A resource definition from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceItem {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_delay: Option<f64>,
}

/// A provider that can mint resources of a given type on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesProviderItem {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

/// A named component (executor, topic, inventory) and its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

/// Manager response to a lock request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockResponse {
    #[serde(default)]
    pub items: Vec<QueueItem>,
    #[serde(default)]
    pub resources: Vec<ResourceItem>,
    #[serde(default)]
    pub resources_providers: Vec<ResourcesProviderItem>,
    #[serde(default)]
    pub executors: Vec<ComponentDefinition>,
}

/// Common shape of the manager read APIs (`GET /api/topics`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsResponse<T> {
    pub items: Vec<T>,
}

/// An upsert against the persisted topology, keyed by `(kind, name)`.
/// Only `data` is overwritten on conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyPatch {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}
