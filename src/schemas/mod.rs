//! Core data model shared between the worker, the executors and the manager.

pub mod job;
pub mod lock;
pub mod message;

pub use job::{JobOptions, PipelineSpec, QueueItem, TopicRef};
pub use lock::{
    ComponentDefinition, ItemsResponse, LockInput, LockResponse, ResourceItem,
    ResourcesProviderItem, TopologyPatch,
};
pub use message::{
    Cursor, MessageId, PipelineEvent, PipelineInfo, PipelineMessage, PipelineOutput,
    PipelineResult, PipelineResults, ResourceUsed, TopicMessage,
};
