//! The executor boundary: pipeline bootstrap, worker pools and the
//! queue-backed remote protocol.

pub mod bootstrap;
pub mod local;
pub mod pool;
pub mod queue;

pub use bootstrap::{InitializedHook, Initializer, PipelineBootstrap, PipelineRegistry, RemoteError};
pub use local::InProcessExecutor;
pub use pool::{ExecutionPool, PoolOptions, WorkerType};
pub use queue::{HealthStore, RedisHealthStore, RedisQueueExecutor};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::ExecutorError;
use crate::schemas::{PipelineMessage, PipelineResults};

/// Hard ceiling per execution.
pub const TIMEOUT: Duration = Duration::from_secs(1200);
/// Grace window before forced reclamation after a soft timeout.
pub const TIMEOUT_DELAY: Duration = Duration::from_secs(60);
/// Cadence of the liveness keys on both sides of the boundary.
pub const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Function name registered with the queue-backed executor.
pub const EXECUTE_FUNC_NAME: &str = "remote_execute";

pub fn worker_healthcheck_key(prefix: &str, job_id: &str) -> String {
    format!("{}:{}:whealthcheck", prefix, job_id)
}

pub fn executor_healthcheck_key(prefix: &str, job_id: &str) -> String {
    format!("{}:{}:ehealthcheck", prefix, job_id)
}

/// Cooperative cancellation signal carried into pipeline execution.
///
/// Cancellation only sets a flag; long-running pipelines must poll it at
/// safe points. It never interrupts blocking calls by itself.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the check so a concurrent cancel cannot slip
            // between them.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side view of an executor: submit one message, get its results.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// How many messages this executor accepts concurrently; used to size
    /// the submission gate.
    fn concurrency(&self) -> usize;

    async fn submit(&self, message: PipelineMessage) -> Result<PipelineResults, ExecutorError>;
}
