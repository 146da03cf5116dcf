//! The worker: leases jobs from the manager and runs them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ConveyorError, Result};
use crate::executor::pool::{ExecutionPool, PoolOptions};
use crate::executor::queue::QueueExecutorOptions;
use crate::executor::{Executor, InProcessExecutor, PipelineRegistry, RedisQueueExecutor};
use crate::pipeline::{ExecutableQueue, StageScheduler};
use crate::resources::Resource;
use crate::schemas::{ComponentDefinition, ItemsResponse, LockInput, LockResponse, QueueItem};
use crate::services::Services;
use crate::topics::{build_topic, Topic};

// ============================================
// MANAGER CLIENT
// ============================================

/// Thin HTTP client for the manager's lease and read APIs.
pub struct ManagerClient {
    base_url: String,
    client: reqwest::Client,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn lock(&self, input: &LockInput) -> Result<LockResponse> {
        let response = self
            .client
            .post(format!("{}/api/lock", self.base_url))
            .json(input)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn topics(&self) -> Result<ItemsResponse<ComponentDefinition>> {
        let response = self
            .client
            .get(format!("{}/api/topics", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

// ============================================
// WORKER
// ============================================

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub selector: Option<String>,
    pub executors: Option<Vec<String>>,
    pub sync_interval: Duration,
}

pub struct Worker {
    options: WorkerOptions,
    client: ManagerClient,
    services: Arc<Services>,
    registry: PipelineRegistry,
    scheduler: StageScheduler,
    topic_definitions: HashMap<String, ComponentDefinition>,
    executors: Mutex<HashMap<String, Arc<dyn Executor>>>,
    known_resources: Mutex<HashSet<String>>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        options: WorkerOptions,
        client: ManagerClient,
        services: Arc<Services>,
        registry: PipelineRegistry,
        topic_definitions: HashMap<String, ComponentDefinition>,
    ) -> Self {
        let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
        Self {
            options,
            client,
            services,
            registry,
            scheduler,
            topic_definitions,
            executors: Mutex::new(HashMap::new()),
            known_resources: Mutex::new(HashSet::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// One lease round: fetch assignments, feed the resource pools, build
    /// executors, start newly-assigned jobs and stop released ones.
    pub async fn sync_once(&self) -> Result<()> {
        let input = LockInput {
            worker_id: self.options.worker_id.clone(),
            selector: self.options.selector.clone(),
            executors: self.options.executors.clone(),
        };
        let response = self.client.lock(&input).await?;
        info!(
            items = response.items.len(),
            resources = response.resources.len(),
            "Lease received"
        );

        {
            let mut known = self.known_resources.lock().await;
            for item in &response.resources {
                if known.insert(item.name.clone()) {
                    self.services.resources.add(Resource::from_item(item));
                }
            }
        }

        for definition in &response.executors {
            if let Err(e) = self.ensure_executor(definition).await {
                error!(executor = %definition.name, error = %e, "Failed to build executor");
            }
        }

        let assigned: HashSet<&str> = response.items.iter().map(|i| i.name.as_str()).collect();
        let mut jobs = self.jobs.lock().await;

        jobs.retain(|name, handle| {
            if handle.is_finished() {
                return false;
            }
            if assigned.contains(name.as_str()) {
                return true;
            }
            warn!(job = %name, "Job released by manager, stopping");
            handle.abort();
            false
        });

        for item in response.items {
            if jobs.contains_key(&item.name) {
                continue;
            }
            match self.start_job(&item).await {
                Ok(handle) => {
                    jobs.insert(item.name.clone(), handle);
                }
                Err(e) => error!(job = %item.name, error = %e, "Failed to start job"),
            }
        }
        Ok(())
    }

    async fn start_job(&self, item: &QueueItem) -> Result<JoinHandle<()>> {
        let executor = self
            .executors
            .lock()
            .await
            .get(&item.executor)
            .cloned()
            .ok_or_else(|| ConveyorError::UnknownComponent(item.executor.clone()))?;

        let input = self.build_topic(&item.input.name)?;
        let mut output: HashMap<String, Vec<Arc<dyn Topic>>> = HashMap::new();
        for (channel, refs) in &item.output {
            let mut topics = Vec::with_capacity(refs.len());
            for topic_ref in refs {
                topics.push(self.build_topic(&topic_ref.name)?);
            }
            output.insert(channel.clone(), topics);
        }

        let queue = ExecutableQueue::new(
            item.clone(),
            input,
            output,
            self.services.hooks.clone(),
        );
        let scheduler = self.scheduler.clone();
        Ok(tokio::spawn(async move {
            scheduler.run_job(queue, executor).await;
        }))
    }

    fn build_topic(&self, name: &str) -> Result<Arc<dyn Topic>> {
        let definition = self
            .topic_definitions
            .get(name)
            .ok_or_else(|| ConveyorError::UnknownComponent(name.to_string()))?;
        Ok(build_topic(definition)?)
    }

    async fn ensure_executor(&self, definition: &ComponentDefinition) -> Result<()> {
        let mut executors = self.executors.lock().await;
        if executors.contains_key(&definition.name) {
            return Ok(());
        }
        let options = serde_json::to_value(&definition.options)?;
        let executor: Arc<dyn Executor> = match definition.kind.as_str() {
            "InProcessExecutor" => {
                let pool_options: PoolOptions = serde_json::from_value(options)?;
                // Slots rebuild the initialized hook from these handlers.
                let pool = ExecutionPool::start(
                    &pool_options,
                    self.registry.clone(),
                    self.services.hooks.executor_initialized.handlers(),
                )?;
                Arc::new(InProcessExecutor::new(&definition.name, Arc::new(pool)))
            }
            "RedisQueueExecutor" => {
                let queue_options: QueueExecutorOptions = serde_json::from_value(options)?;
                Arc::new(RedisQueueExecutor::connect(&definition.name, queue_options).await?)
            }
            other => return Err(ConveyorError::UnknownComponent(other.to_string())),
        };
        executors.insert(definition.name.clone(), executor);
        Ok(())
    }

    /// Leases on an interval (with jitter) until shutdown; running jobs are
    /// aborted on the way out.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if let Err(e) = self.sync_once().await {
                error!(error = %e, "Job sync failed");
            }
            let jitter = rand::thread_rng()
                .gen_range(Duration::ZERO..self.options.sync_interval / 10 + Duration::from_millis(1));
            tokio::select! {
                _ = tokio::time::sleep(self.options.sync_interval + jitter) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Worker shutting down");
        for (name, handle) in self.jobs.lock().await.drain() {
            warn!(job = %name, "Aborting job");
            handle.abort();
        }
    }
}
