//! Messages flowing through topics and pipelines.
//!
//! A `TopicMessage` is the immutable unit read from an input topic. Before
//! execution it is wrapped into a `PipelineMessage` carrying the pipeline
//! schema and the resource arguments injected by the worker.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Opaque message identifier.
pub type MessageId = String;

/// Opaque resume marker produced by an inventory. Equality-based.
pub type Cursor = String;

/// A message consumed from or published to a topic.
///
/// `metadata` is mutable-by-pipeline and used by cross-cutting concerns
/// (tracing context propagation, batching markers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub id: MessageId,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<Duration>,
}

impl TopicMessage {
    pub fn new(id: impl Into<MessageId>, args: HashMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            args,
            tags: HashMap::new(),
            metadata: HashMap::new(),
            expire_after: None,
        }
    }

    /// Returns a copy extended with pipeline-level argument defaults.
    /// Keys already present in the message win over the defaults.
    pub fn extend(mut self, defaults: &HashMap<String, Value>) -> Self {
        for (k, v) in defaults {
            self.args.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }
}

/// Schema of the callable at the far end of the executor boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    /// Parameter name to resource type.
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// A `TopicMessage` bound to a pipeline schema, with the resource arguments
/// injected by the worker before submission. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub info: PipelineInfo,
    pub message: TopicMessage,
    #[serde(default)]
    pub resource_args: HashMap<String, Value>,
}

impl PipelineMessage {
    pub fn new(info: PipelineInfo, message: TopicMessage) -> Self {
        Self {
            info,
            message,
            resource_args: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// Injects acquired resource data under their parameter names.
    pub fn update_with_resources(&mut self, resources: &HashMap<String, Value>) {
        for (param, data) in resources {
            self.resource_args.insert(param.clone(), data.clone());
        }
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resource_args
            .values()
            .filter_map(|v| v.get("name").and_then(Value::as_str))
    }
}

/// One message routed to an output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub channel: String,
    pub message: TopicMessage,
}

impl PipelineOutput {
    pub fn new(channel: impl Into<String>, message: TopicMessage) -> Self {
        Self {
            channel: channel.into(),
            message,
        }
    }
}

/// Resource usage reported by a pipeline: optional state rewrite and
/// deferred release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsed {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Opaque downstream signal emitted by a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// One element produced by a pipeline, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineResult {
    Output(PipelineOutput),
    Message(TopicMessage),
    Resource(ResourceUsed),
    Event(PipelineEvent),
}

/// Classified pipeline results, as returned over the executor boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResults {
    #[serde(default)]
    pub outputs: Vec<PipelineOutput>,
    #[serde(default)]
    pub resources: Vec<ResourceUsed>,
    #[serde(default)]
    pub events: Vec<PipelineEvent>,
}

impl PipelineResults {
    /// Sorts produced elements into their buckets. A bare `TopicMessage` is
    /// promoted to a `PipelineOutput` on the `"default"` channel.
    pub fn classify(results: impl IntoIterator<Item = PipelineResult>) -> Self {
        let mut classified = Self::default();
        for result in results {
            match result {
                PipelineResult::Output(output) => classified.outputs.push(output),
                PipelineResult::Message(message) => classified
                    .outputs
                    .push(PipelineOutput::new("default", message)),
                PipelineResult::Resource(resource) => classified.resources.push(resource),
                PipelineResult::Event(event) => classified.events.push(event),
            }
        }
        classified
    }

    /// Classifies raw wire elements. Elements that do not parse as a known
    /// result kind are logged and dropped; the others proceed.
    pub fn classify_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::classify(values.into_iter().filter_map(|value| {
            match serde_json::from_value::<PipelineResult>(value) {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(error = %e, "Invalid result type");
                    None
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_extend_keeps_caller_args() {
        let message = TopicMessage::new("0", args(&[("x", json!(1))]));
        let defaults = args(&[("x", json!(99)), ("y", json!("default"))]);

        let extended = message.extend(&defaults);
        assert_eq!(extended.args["x"], json!(1));
        assert_eq!(extended.args["y"], json!("default"));
    }

    #[test]
    fn test_classify_promotes_bare_message() {
        let message = TopicMessage::new("0", HashMap::new());
        let results = PipelineResults::classify([
            PipelineResult::Message(message.clone()),
            PipelineResult::Resource(ResourceUsed {
                resource_type: "api-key".into(),
                state: Some(json!({"cursor": 3})),
                release_at: None,
            }),
            PipelineResult::Event(PipelineEvent {
                name: "done".into(),
                data: Value::Null,
            }),
        ]);

        assert_eq!(results.outputs.len(), 1);
        assert_eq!(results.outputs[0].channel, "default");
        assert_eq!(results.outputs[0].message, message);
        assert_eq!(results.resources.len(), 1);
        assert_eq!(results.events.len(), 1);
    }

    #[test]
    fn test_classify_values_drops_unknown_kinds() {
        let results = PipelineResults::classify_values([
            json!({"kind": "message", "id": "0", "args": {}}),
            json!({"kind": "garbage", "payload": 1}),
            json!(42),
        ]);

        assert_eq!(results.outputs.len(), 1);
        assert!(results.resources.is_empty());
        assert!(results.events.is_empty());
    }

    #[test]
    fn test_message_roundtrip() {
        let mut message = TopicMessage::new("42", args(&[("n", json!(1))]));
        message.tags.insert("team".into(), "data".into());
        message
            .metadata
            .insert("tracing".into(), json!({"traceparent": "00-aa-bb-01"}));
        message.expire_after = Some(Duration::from_secs(30));

        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: TopicMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
