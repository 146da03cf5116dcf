//! Job definitions leased from the manager.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::PipelineInfo;

/// Reference to a topic in the manager's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicRef {
    pub name: String,
}

impl TopicRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The pipeline bound to a job: its schema plus job-level argument defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub info: PipelineInfo,
    #[serde(default)]
    pub args: HashMap<String, Value>,
}

/// A named instance of a pipeline bound to an input topic, output topics and
/// an executor. This is the unit of work leased to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub name: String,
    pub pipeline: PipelineSpec,
    pub input: TopicRef,
    #[serde(default)]
    pub output: HashMap<String, Vec<TopicRef>>,
    pub executor: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Layered configuration, keyed by namespace (`"job"` holds JobOptions).
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl QueueItem {
    /// Parses the `"job"` namespace of the layered config. Unknown or
    /// missing namespaces fall back to defaults.
    pub fn job_options(&self) -> JobOptions {
        self.config
            .get(JOB_NAMESPACE)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

pub const JOB_NAMESPACE: &str = "job";

/// Recognized per-job options.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct JobOptions {
    /// Group polled items before emission.
    pub batching_enabled: bool,
    /// Max items per batch.
    pub buffer_size: usize,
    /// Max seconds to wait before emitting an incomplete batch.
    pub buffer_flush_after: f64,
    /// Ceiling on simultaneously in-flight messages from this job.
    pub max_concurrency: Option<usize>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            batching_enabled: false,
            buffer_size: 10,
            buffer_flush_after: 5.0,
            max_concurrency: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue_item(config: HashMap<String, Value>) -> QueueItem {
        QueueItem {
            name: "job-1".into(),
            pipeline: PipelineSpec {
                info: PipelineInfo {
                    name: "normalize".into(),
                    resources: HashMap::new(),
                },
                args: HashMap::new(),
            },
            input: TopicRef::new("in"),
            output: HashMap::new(),
            executor: "default".into(),
            labels: HashMap::new(),
            config,
        }
    }

    #[test]
    fn test_job_options_defaults() {
        let options = queue_item(HashMap::new()).job_options();
        assert!(!options.batching_enabled);
        assert_eq!(options.buffer_size, 10);
        assert_eq!(options.buffer_flush_after, 5.0);
        assert_eq!(options.max_concurrency, None);
    }

    #[test]
    fn test_job_options_from_config() {
        let mut config = HashMap::new();
        config.insert(
            "job".to_string(),
            json!({"batching_enabled": true, "buffer_size": 3, "max_concurrency": 2}),
        );

        let options = queue_item(config).job_options();
        assert!(options.batching_enabled);
        assert_eq!(options.buffer_size, 3);
        assert_eq!(options.max_concurrency, Some(2));
        // Unset keys keep their defaults.
        assert_eq!(options.buffer_flush_after, 5.0);
    }
}
