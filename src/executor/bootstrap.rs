//! Executor-side pipeline bootstrap.
//!
//! Resolves the pipeline callable, runs it through the executor-side hook
//! chain and classifies whatever it returned into `PipelineResults`. Every
//! escaping error is wrapped as a `RemoteError` carrying a serialized cause
//! chain so the worker can render a faithful remote stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info_span};

use super::CancellationToken;
use crate::hooks::{SyncContextHandler, SyncContextHook, SyncEventHandler, SyncEventHook};
use crate::schemas::{PipelineMessage, PipelineResult, PipelineResults, TopicMessage};

/// What a pipeline callable may hand back, before classification.
pub enum PipelineOutcome {
    Empty,
    Single(PipelineResult),
    Many(Vec<PipelineResult>),
}

/// Everything a pipeline callable receives: the raw topic message, the
/// merged arguments, the injected resource arguments and the cancellation
/// token.
pub struct PipelineContext {
    pub message: TopicMessage,
    pub args: HashMap<String, Value>,
    pub resources: HashMap<String, Value>,
    pub cancellation: CancellationToken,
}

#[derive(Error, Debug)]
pub enum PipelineRunError {
    /// Argument validation failed; re-raised so the executor records it.
    #[error("Failed to deserialize message: {0}")]
    InvalidArguments(String),

    #[error("Job Cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type PipelineFn =
    Arc<dyn Fn(PipelineContext) -> Result<PipelineOutcome, PipelineRunError> + Send + Sync>;

/// Named pipeline callables. Append-only after startup.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    pipelines: Arc<RwLock<HashMap<String, PipelineFn>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, pipeline: F)
    where
        F: Fn(PipelineContext) -> Result<PipelineOutcome, PipelineRunError>
            + Send
            + Sync
            + 'static,
    {
        self.pipelines
            .write()
            .insert(name.into(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<PipelineFn> {
        self.pipelines.read().get(name).cloned()
    }
}

pub type PipelineHook = SyncContextHook<PipelineMessage, PipelineResults>;

/// Fired once per worker slot, right after the slot's bootstrap is built.
/// Handlers typically register middleware on `pipeline_hook`.
pub type InitializedHook = SyncEventHook<PipelineBootstrap>;

/// A handler registered on the initialized hook.
pub type Initializer = SyncEventHandler<PipelineBootstrap>;

/// Per-slot execution state, built once when the slot starts.
pub struct PipelineBootstrap {
    registry: PipelineRegistry,
    pub pipeline_hook: PipelineHook,
}

impl PipelineBootstrap {
    pub fn new(registry: PipelineRegistry, initialized_hook: &InitializedHook) -> Self {
        let bootstrap = Self {
            registry,
            pipeline_hook: SyncContextHook::new("pipeline"),
        };
        initialized_hook.emit(&bootstrap);
        bootstrap
    }

    /// Runs one message through the hook chain and the resolved callable.
    pub fn bootstrap_pipeline(
        &self,
        message: &PipelineMessage,
        token: &CancellationToken,
    ) -> Result<PipelineResults, RemoteError> {
        let span = info_span!(
            "pipeline",
            pipeline = %message.info.name,
            message_id = %message.id(),
        );
        let _entered = span.enter();

        self.pipeline_hook
            .call(message, |message| {
                self.run_pipeline(message, token).map_err(anyhow::Error::from)
            })
            .map_err(|e| RemoteError::from_anyhow(&e))
    }

    fn run_pipeline(
        &self,
        message: &PipelineMessage,
        token: &CancellationToken,
    ) -> Result<PipelineResults, PipelineRunError> {
        let pipeline = self.registry.get(&message.info.name).ok_or_else(|| {
            PipelineRunError::Failed(anyhow::anyhow!(
                "Unknown pipeline: {}",
                message.info.name
            ))
        })?;

        let context = PipelineContext {
            message: message.message.clone(),
            args: message.message.args.clone(),
            resources: message.resource_args.clone(),
            cancellation: token.clone(),
        };

        let outcome = pipeline(context).map_err(|e| {
            if let PipelineRunError::InvalidArguments(_) = &e {
                error!(
                    message_args = %serde_json::to_string(&message.message.args)
                        .unwrap_or_default(),
                    "Failed to deserialize message"
                );
            }
            e
        })?;

        Ok(match outcome {
            PipelineOutcome::Empty => PipelineResults::default(),
            PipelineOutcome::Single(result) => PipelineResults::classify([result]),
            PipelineOutcome::Many(results) => PipelineResults::classify(results),
        })
    }
}

/// A pipeline failure serialized for transport back to the worker: error
/// kind, message and the cause chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub frames: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let kind = match error.downcast_ref::<PipelineRunError>() {
            Some(PipelineRunError::InvalidArguments(_)) => "InvalidArguments",
            Some(PipelineRunError::Cancelled) => "Cancelled",
            _ => "PipelineError",
        };
        Self {
            kind: kind.to_string(),
            message: error.to_string(),
            frames: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteError[{}]({})", self.kind, self.message)?;
        for frame in &self.frames {
            write!(f, "\n  caused by: {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
