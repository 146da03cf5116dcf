//! Error types for the worker engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

#[derive(Error, Debug)]
pub enum TopicError {
    /// Terminal: publishing on a closed topic is fatal for that message.
    #[error("Topic is closed")]
    Closed,

    #[error("Unknown topic: {0}")]
    Unknown(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The remote side reported a pipeline failure with its serialized stack.
    #[error("{0}")]
    Remote(#[from] crate::executor::bootstrap::RemoteError),

    /// Liveness was lost on either side of the executor boundary.
    #[error("Job Cancelled")]
    JobCancelled,

    #[error("Job timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The executor stopped answering healthchecks and the job was given up.
    #[error("Job lost after {attempts} dispatch attempts")]
    JobLost { attempts: u32 },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Executor is not running")]
    NotRunning,
}

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConveyorError>;
