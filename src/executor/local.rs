//! Executor running pipelines on an in-process pool.

use std::sync::Arc;

use async_trait::async_trait;

use super::pool::ExecutionPool;
use super::{CancellationToken, Executor, TIMEOUT};
use crate::error::ExecutorError;
use crate::schemas::{PipelineMessage, PipelineResults};

pub struct InProcessExecutor {
    name: String,
    pool: Arc<ExecutionPool>,
}

impl InProcessExecutor {
    pub fn new(name: impl Into<String>, pool: Arc<ExecutionPool>) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrency(&self) -> usize {
        self.pool.concurrency()
    }

    async fn submit(&self, message: PipelineMessage) -> Result<PipelineResults, ExecutorError> {
        let token = CancellationToken::new();
        match tokio::time::timeout(TIMEOUT, self.pool.submit(message, token.clone())).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(remote)) => Err(ExecutorError::Remote(remote)),
            Err(_) => {
                token.cancel();
                Err(ExecutorError::Timeout(TIMEOUT))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::bootstrap::{
        PipelineContext, PipelineOutcome, PipelineRegistry, PipelineRunError,
    };
    use crate::executor::pool::PoolOptions;
    use crate::schemas::{PipelineInfo, PipelineResult, TopicMessage};
    use std::collections::HashMap;

    fn executor_with(registry: PipelineRegistry) -> InProcessExecutor {
        let pool = ExecutionPool::start(&PoolOptions::default(), registry, Vec::new()).unwrap();
        InProcessExecutor::new("local", Arc::new(pool))
    }

    fn message(pipeline: &str) -> PipelineMessage {
        PipelineMessage::new(
            PipelineInfo {
                name: pipeline.into(),
                resources: HashMap::new(),
            },
            TopicMessage::new("0", HashMap::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_returns_results() {
        let registry = PipelineRegistry::new();
        registry.register("echo", |ctx: PipelineContext| {
            Ok(PipelineOutcome::Single(PipelineResult::Message(
                ctx.message,
            )))
        });

        let executor = executor_with(registry);
        let results = executor.submit(message("echo")).await.unwrap();
        assert_eq!(results.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_surfaces_remote_failure() {
        let registry = PipelineRegistry::new();
        registry.register("boom", |_| {
            Err(PipelineRunError::Failed(anyhow::anyhow!("exploded")))
        });

        let executor = executor_with(registry);
        let err = executor.submit(message("boom")).await.unwrap_err();
        match err {
            ExecutorError::Remote(remote) => assert!(remote.message.contains("exploded")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
