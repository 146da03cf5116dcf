//! Queue-backed remote executor protocol over Redis.
//!
//! The worker enqueues serialized jobs; the executor process pops them, runs
//! `remote_execute` on its pool and pushes the outcome to a per-job result
//! list. Both sides maintain liveness keys on the healthcheck cadence:
//! losing the other side's key cancels the in-flight job within at most two
//! intervals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::bootstrap::RemoteError;
use super::pool::ExecutionPool;
use super::{
    executor_healthcheck_key, worker_healthcheck_key, CancellationToken, Executor,
    HEALTHCHECK_INTERVAL, TIMEOUT, TIMEOUT_DELAY,
};
use crate::error::ExecutorError;
use crate::schemas::{PipelineMessage, PipelineResults};

pub fn queue_key(prefix: &str) -> String {
    format!("{}:queue", prefix)
}

pub fn result_key(prefix: &str, job_id: &str) -> String {
    format!("{}:results:{}", prefix, job_id)
}

/// One dispatched job on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJob {
    pub job_id: String,
    pub message: PipelineMessage,
}

// ============================================
// HEALTH STORE
// ============================================

/// Liveness key storage. Redis in production; the in-memory variant backs
/// virtual-time tests.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Writes the key with the given TTL.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), ExecutorError>;

    /// Whether the key exists and its TTL has not elapsed.
    async fn is_alive(&self, key: &str) -> Result<bool, ExecutorError>;
}

pub struct RedisHealthStore {
    conn: ConnectionManager,
}

impl RedisHealthStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HealthStore for RedisHealthStore {
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), ExecutorError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PSETEX")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .arg("healthy")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_alive(&self, key: &str) -> Result<bool, ExecutorError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }
}

// ============================================
// EXECUTOR SIDE
// ============================================

/// Shared state of one executor process.
pub struct ExecutorContext {
    pub pool: Arc<ExecutionPool>,
    pub health: Arc<dyn HealthStore>,
    pub prefix: String,
    pub healthcheck_interval: Duration,
}

/// Runs one job: the execution races the liveness loop and the hard
/// timeout. Worker loss cancels the token and fails with `Job Cancelled`; a
/// timeout cancels the token, waits out the grace window and reports
/// timed-out.
pub async fn remote_execute(
    ctx: &ExecutorContext,
    job: RemoteJob,
) -> Result<PipelineResults, ExecutorError> {
    let token = CancellationToken::new();
    let execute = ctx.pool.submit(job.message, token.clone());
    tokio::pin!(execute);
    let liveness = executor_liveness(ctx, &job.job_id);
    tokio::pin!(liveness);

    tokio::select! {
        result = &mut execute => result.map_err(ExecutorError::Remote),
        _ = &mut liveness => {
            token.cancel();
            error!(job_id = %job.job_id, "Worker died");
            Err(ExecutorError::JobCancelled)
        }
        _ = tokio::time::sleep(TIMEOUT) => {
            token.cancel();
            let _ = tokio::time::timeout(TIMEOUT_DELAY, &mut execute).await;
            Err(ExecutorError::Timeout(TIMEOUT))
        }
    }
}

/// Refreshes the executor's liveness key, then checks the worker's on every
/// interval. Returns once the worker key is gone.
async fn executor_liveness(ctx: &ExecutorContext, job_id: &str) {
    let executor_key = executor_healthcheck_key(&ctx.prefix, job_id);
    let worker_key = worker_healthcheck_key(&ctx.prefix, job_id);
    loop {
        if let Err(e) = ctx.health.refresh(&executor_key, ctx.healthcheck_interval * 2).await {
            warn!(job_id = %job_id, error = %e, "Failed to refresh liveness key");
        }
        tokio::time::sleep(ctx.healthcheck_interval).await;
        match ctx.health.is_alive(&worker_key).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to read liveness key"),
        }
    }
}

/// The executor process loop: pops jobs, executes them and publishes the
/// outcomes.
pub async fn run_executor(
    url: &str,
    prefix: &str,
    pool: Arc<ExecutionPool>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    let ctx = Arc::new(ExecutorContext {
        pool,
        health: Arc::new(RedisHealthStore::new(conn.clone())),
        prefix: prefix.to_string(),
        healthcheck_interval: HEALTHCHECK_INTERVAL,
    });
    let queue = queue_key(prefix);
    info!(queue = %queue, function = super::EXECUTE_FUNC_NAME, "Executor started");

    loop {
        let mut pop_conn = conn.clone();
        let queue = queue.clone();
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Executor shutting down");
                ctx.pool.shutdown().await;
                return Ok(());
            }
            popped = async move {
                pop_conn
                    .blpop::<_, Option<(String, Vec<u8>)>>(&queue, 1.0)
                    .await
            } => {
                let Some((_, payload)) = popped? else {
                    continue;
                };
                let job: RemoteJob = match serde_json::from_slice(&payload) {
                    Ok(job) => job,
                    Err(e) => {
                        error!(error = %e, "Dropping undecodable job");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let mut result_conn = conn.clone();
                let prefix = prefix.to_string();
                tokio::spawn(async move {
                    let job_id = job.job_id.clone();
                    let outcome: Result<PipelineResults, RemoteError> =
                        match remote_execute(&ctx, job).await {
                            Ok(results) => Ok(results),
                            Err(ExecutorError::Remote(remote)) => Err(remote),
                            Err(ExecutorError::JobCancelled) => {
                                Err(RemoteError::new("Cancelled", "Job Cancelled"))
                            }
                            Err(e) => Err(RemoteError::new("ExecutorError", e.to_string())),
                        };
                    if let Err(e) = publish_result(&mut result_conn, &prefix, &job_id, &outcome).await {
                        error!(job_id = %job_id, error = %e, "Failed to publish job result");
                    }
                });
            }
        }
    }
}

async fn publish_result(
    conn: &mut ConnectionManager,
    prefix: &str,
    job_id: &str,
    outcome: &Result<PipelineResults, RemoteError>,
) -> Result<(), ExecutorError> {
    let key = result_key(prefix, job_id);
    let payload = serde_json::to_vec(outcome)?;
    let _: i64 = conn.lpush(&key, payload).await?;
    let _: bool = conn.expire(&key, 600).await?;
    Ok(())
}

// ============================================
// WORKER SIDE
// ============================================

fn default_prefix() -> String {
    "conveyor".to_string()
}

fn default_queue_concurrency() -> usize {
    4
}

fn default_max_dispatch_attempts() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueExecutorOptions {
    pub url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
    /// Dispatches attempted before a job is declared lost.
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
}

enum DispatchOutcome {
    Finished(Result<PipelineResults, RemoteError>),
    ExecutorLost,
}

/// Worker-side handle on the queue-backed executor.
pub struct RedisQueueExecutor {
    name: String,
    options: QueueExecutorOptions,
    conn: ConnectionManager,
    health: Arc<dyn HealthStore>,
    healthcheck_interval: Duration,
}

impl RedisQueueExecutor {
    pub async fn connect(
        name: impl Into<String>,
        options: QueueExecutorOptions,
    ) -> Result<Self, ExecutorError> {
        let client = redis::Client::open(options.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            name: name.into(),
            health: Arc::new(RedisHealthStore::new(conn.clone())),
            conn,
            options,
            healthcheck_interval: HEALTHCHECK_INTERVAL,
        })
    }

    /// Waits for the job result while keeping this worker's liveness key
    /// fresh and watching the executor's.
    async fn await_result(&self, job_id: &str) -> Result<DispatchOutcome, ExecutorError> {
        let key = result_key(&self.options.prefix, job_id);
        let deadline = Instant::now() + TIMEOUT + TIMEOUT_DELAY + self.healthcheck_interval * 2;
        let liveness = self.watch_executor(job_id);
        tokio::pin!(liveness);

        loop {
            if Instant::now() > deadline {
                return Err(ExecutorError::Timeout(TIMEOUT));
            }
            let mut conn = self.conn.clone();
            let key = key.clone();
            tokio::select! {
                popped = async move {
                    conn.blpop::<_, Option<(String, Vec<u8>)>>(&key, 1.0).await
                } => {
                    if let Some((_, payload)) = popped? {
                        let outcome: Result<PipelineResults, RemoteError> =
                            serde_json::from_slice(&payload)?;
                        return Ok(DispatchOutcome::Finished(outcome));
                    }
                }
                _ = &mut liveness => {
                    return Ok(DispatchOutcome::ExecutorLost);
                }
            }
        }
    }

    /// Returns once the executor's liveness key goes missing after having
    /// been seen. A job that is never picked up is handled by the result
    /// deadline instead.
    async fn watch_executor(&self, job_id: &str) {
        let worker_key = worker_healthcheck_key(&self.options.prefix, job_id);
        let executor_key = executor_healthcheck_key(&self.options.prefix, job_id);
        let mut seen = false;
        loop {
            if let Err(e) = self
                .health
                .refresh(&worker_key, self.healthcheck_interval * 2)
                .await
            {
                warn!(job_id = %job_id, error = %e, "Failed to refresh liveness key");
            }
            tokio::time::sleep(self.healthcheck_interval).await;
            match self.health.is_alive(&executor_key).await {
                Ok(true) => seen = true,
                Ok(false) if seen => return,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to read liveness key"),
            }
        }
    }
}

#[async_trait]
impl Executor for RedisQueueExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrency(&self) -> usize {
        self.options.concurrency
    }

    async fn submit(&self, message: PipelineMessage) -> Result<PipelineResults, ExecutorError> {
        let attempts = self.options.max_dispatch_attempts.max(1);
        for attempt in 1..=attempts {
            let job_id = Uuid::new_v4().to_string();
            let job = RemoteJob {
                job_id: job_id.clone(),
                message: message.clone(),
            };
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .lpush(queue_key(&self.options.prefix), serde_json::to_vec(&job)?)
                .await?;

            match self.await_result(&job_id).await? {
                DispatchOutcome::Finished(outcome) => {
                    return outcome.map_err(ExecutorError::Remote)
                }
                DispatchOutcome::ExecutorLost => {
                    warn!(
                        job_id = %job_id,
                        attempt,
                        "Executor lost, re-dispatching job"
                    );
                }
            }
        }
        Err(ExecutorError::JobLost { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::bootstrap::{
        PipelineContext, PipelineOutcome, PipelineRegistry, PipelineRunError,
    };
    use crate::executor::pool::{PoolOptions, WorkerType};
    use crate::schemas::{PipelineInfo, PipelineResult, TopicMessage};
    use crate::testing::MemoryHealthStore;
    use std::collections::HashMap;

    fn context(registry: PipelineRegistry, health: Arc<MemoryHealthStore>) -> ExecutorContext {
        let pool = ExecutionPool::start(
            &PoolOptions {
                worker_type: WorkerType::Thread,
                worker_concurrency: 2,
            },
            registry,
            Vec::new(),
        )
        .unwrap();
        ExecutorContext {
            pool: Arc::new(pool),
            health,
            prefix: "conveyor".to_string(),
            healthcheck_interval: HEALTHCHECK_INTERVAL,
        }
    }

    fn job(pipeline: &str) -> RemoteJob {
        RemoteJob {
            job_id: "job-1".to_string(),
            message: PipelineMessage::new(
                PipelineInfo {
                    name: pipeline.into(),
                    resources: HashMap::new(),
                },
                TopicMessage::new("0", HashMap::new()),
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loss_cancels_job() {
        let registry = PipelineRegistry::new();
        registry.register("wait-for-cancel", |ctx: PipelineContext| {
            while !ctx.cancellation.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(PipelineRunError::Cancelled)
        });

        let health = Arc::new(MemoryHealthStore::new());
        let ctx = context(registry, health);

        // The worker key is never refreshed: the liveness loop exits on its
        // first check and the job fails as cancelled.
        let started = Instant::now();
        let err = remote_execute(&ctx, job("wait-for-cancel")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::JobCancelled));
        assert!(started.elapsed() <= HEALTHCHECK_INTERVAL * 2);
        assert_eq!(err.to_string(), "Job Cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_worker_gets_results() {
        let registry = PipelineRegistry::new();
        registry.register("echo", |ctx: PipelineContext| {
            Ok(PipelineOutcome::Single(PipelineResult::Message(
                ctx.message,
            )))
        });

        let health = Arc::new(MemoryHealthStore::new());
        let ctx = context(registry, health.clone());

        // Keep the worker side alive for the whole run.
        let refresher = {
            let health = health.clone();
            tokio::spawn(async move {
                loop {
                    health
                        .refresh(
                            &worker_healthcheck_key("conveyor", "job-1"),
                            HEALTHCHECK_INTERVAL * 2,
                        )
                        .await
                        .unwrap();
                    tokio::time::sleep(HEALTHCHECK_INTERVAL).await;
                }
            })
        };

        let results = remote_execute(&ctx, job("echo")).await.unwrap();
        assert_eq!(results.outputs.len(), 1);
        refresher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_liveness_key_is_written() {
        let registry = PipelineRegistry::new();
        registry.register("echo", |ctx: PipelineContext| {
            Ok(PipelineOutcome::Single(PipelineResult::Message(
                ctx.message,
            )))
        });

        let health = Arc::new(MemoryHealthStore::new());
        let ctx = context(registry, health.clone());
        let _ = remote_execute(&ctx, job("echo")).await;

        assert!(health
            .is_alive(&executor_healthcheck_key("conveyor", "job-1"))
            .await
            .unwrap());
    }
}
