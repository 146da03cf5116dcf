//! Per-stage time accounting.
//!
//! Each stage holds the set of messages currently resident in it, keyed by
//! `(executor, pipeline, job labels)`. Every push/pop flushes the running
//! integral `elapsed × residents` into a nanosecond accumulator; `collect`
//! divides by the collection interval, yielding the mean number of resident
//! messages, and resets.
//!
//! A message is in at most one stage at a time. The publish pair is the one
//! deliberate exception: `output_blocked` pops `publishing` and pushes
//! `waiting_publish`, so blocked time is not double-counted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::hooks::{
    ContextHandler, HandlerState, Hooks, MessagePublished, MessageTag,
};
use crate::metrics;
use crate::schemas::PipelineResults;

pub const STAGE_POLLING: &str = "polling";
pub const STAGE_SCHEDULING: &str = "scheduling";
pub const STAGE_SUBMITTING: &str = "submitting";
pub const STAGE_EXECUTING: &str = "executing";
pub const STAGE_PROCESSING_RESULTS: &str = "processing_results";
pub const STAGE_PUBLISHING: &str = "publishing";
pub const STAGE_WAITING_PUBLISH: &str = "waiting_publish";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub executor: String,
    pub pipeline: String,
    pub labels: BTreeMap<String, String>,
}

impl PipelineKey {
    fn from_tag(tag: &MessageTag) -> Self {
        Self {
            executor: tag.executor().to_string(),
            pipeline: tag.pipeline().to_string(),
            labels: tag.labels().clone(),
        }
    }
}

/// Mean residency of one pipeline in one stage over a collection interval.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineUsage {
    pub stage: &'static str,
    pub executor: String,
    pub pipeline: String,
    pub labels: BTreeMap<String, String>,
    pub usage: f64,
}

struct PipelineState {
    residents: HashSet<Uuid>,
    last_flushed_at: Instant,
    last_collected_at: Instant,
    usage_nanos: u128,
}

impl PipelineState {
    fn new(now: Instant) -> Self {
        Self {
            residents: HashSet::new(),
            last_flushed_at: now,
            last_collected_at: now,
            usage_nanos: 0,
        }
    }

    fn flush(&mut self, now: Instant) {
        let since_flush = now.saturating_duration_since(self.last_flushed_at);
        self.usage_nanos += since_flush.as_nanos() * self.residents.len() as u128;
        self.last_flushed_at = now;
    }

    fn add(&mut self, id: Uuid) {
        self.flush(Instant::now());
        self.residents.insert(id);
    }

    fn pop(&mut self, id: Uuid) {
        if self.residents.contains(&id) {
            self.flush(Instant::now());
            self.residents.remove(&id);
        }
    }

    fn collect(&mut self, now: Instant) -> f64 {
        self.flush(now);
        let interval = now.saturating_duration_since(self.last_collected_at);
        let usage = if interval.is_zero() {
            0.0
        } else {
            self.usage_nanos as f64 / interval.as_nanos() as f64
        };
        self.last_collected_at = now;
        self.usage_nanos = 0;
        usage
    }
}

#[derive(Default)]
struct StageState {
    pipelines: HashMap<PipelineKey, PipelineState>,
}

impl StageState {
    fn push(&mut self, tag: &MessageTag) {
        self.pipelines
            .entry(PipelineKey::from_tag(tag))
            .or_insert_with(|| PipelineState::new(Instant::now()))
            .add(tag.execution_id());
    }

    fn pop(&mut self, tag: &MessageTag) {
        if let Some(state) = self.pipelines.get_mut(&PipelineKey::from_tag(tag)) {
            state.pop(tag.execution_id());
        }
    }

    fn collect(&mut self, stage: &'static str, now: Instant, out: &mut Vec<PipelineUsage>) {
        for (key, state) in &mut self.pipelines {
            out.push(PipelineUsage {
                stage,
                executor: key.executor.clone(),
                pipeline: key.pipeline.clone(),
                labels: key.labels.clone(),
                usage: state.collect(now),
            });
        }
    }
}

#[derive(Default)]
struct StagesState {
    polling: StageState,
    scheduling: StageState,
    submitting: StageState,
    executing: StageState,
    processing_results: StageState,
    publishing: StageState,
    waiting_publish: StageState,
}

/// Hook-driven stage residency tracker.
#[derive(Clone)]
pub struct UsageMetrics {
    stages: Arc<Mutex<StagesState>>,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self {
            stages: Arc::new(Mutex::new(StagesState::default())),
        }
    }

    /// Registers on every stage hook. Call once, before the worker starts.
    pub fn register(&self, hooks: &Hooks) {
        let stages = self.stages.clone();
        hooks.message_polled.register(move |tag: MessageTag| {
            let stages = stages.clone();
            async move {
                stages.lock().polling.push(&tag);
                Ok(())
            }
        });

        let stages = self.stages.clone();
        hooks.message_scheduled.register(move |tag: MessageTag| {
            let stages = stages.clone();
            async move {
                let mut stages = stages.lock();
                stages.polling.pop(&tag);
                stages.scheduling.push(&tag);
                Ok(())
            }
        });

        let stages = self.stages.clone();
        hooks.message_submitted.register(move |tag: MessageTag| {
            let stages = stages.clone();
            async move {
                let mut stages = stages.lock();
                stages.scheduling.pop(&tag);
                stages.submitting.push(&tag);
                Ok(())
            }
        });

        hooks.message_executed.register(Arc::new(ExecutedHandler {
            stages: self.stages.clone(),
        }));
        hooks
            .results_processed
            .register(Arc::new(ResultsProcessedHandler {
                stages: self.stages.clone(),
            }));
        hooks
            .message_published
            .register(Arc::new(PublishedHandler {
                stages: self.stages.clone(),
            }));
        hooks.output_blocked.register(Arc::new(BlockedHandler {
            stages: self.stages.clone(),
        }));
    }

    /// Flushes every stage and returns the mean residency per pipeline over
    /// the interval since the previous collection.
    pub fn collect(&self, now: Instant) -> Vec<PipelineUsage> {
        let mut stages = self.stages.lock();
        let mut usages = Vec::new();
        stages.polling.collect(STAGE_POLLING, now, &mut usages);
        stages.scheduling.collect(STAGE_SCHEDULING, now, &mut usages);
        stages.submitting.collect(STAGE_SUBMITTING, now, &mut usages);
        stages.executing.collect(STAGE_EXECUTING, now, &mut usages);
        stages
            .processing_results
            .collect(STAGE_PROCESSING_RESULTS, now, &mut usages);
        stages.publishing.collect(STAGE_PUBLISHING, now, &mut usages);
        stages
            .waiting_publish
            .collect(STAGE_WAITING_PUBLISH, now, &mut usages);
        usages
    }

    /// Periodically exports collected usage to the prometheus gauge.
    pub fn start_reporter(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for usage in collector.collect(Instant::now()) {
                    let labels = usage
                        .labels
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect::<Vec<_>>()
                        .join(",");
                    metrics::set_pipeline_usage(
                        usage.stage,
                        &usage.executor,
                        &usage.pipeline,
                        &labels,
                        usage.usage,
                    );
                }
            }
        })
    }
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct ExecutedHandler {
    stages: Arc<Mutex<StagesState>>,
}

#[async_trait]
impl ContextHandler<MessageTag, PipelineResults> for ExecutedHandler {
    async fn on_enter(&self, tag: &MessageTag) -> anyhow::Result<HandlerState> {
        let mut stages = self.stages.lock();
        stages.submitting.pop(tag);
        stages.executing.push(tag);
        Ok(Box::new(()))
    }

    async fn on_exit(
        &self,
        _state: HandlerState,
        tag: &MessageTag,
        _result: &mut anyhow::Result<PipelineResults>,
    ) -> anyhow::Result<()> {
        self.stages.lock().executing.pop(tag);
        Ok(())
    }
}

struct ResultsProcessedHandler {
    stages: Arc<Mutex<StagesState>>,
}

#[async_trait]
impl ContextHandler<MessageTag, ()> for ResultsProcessedHandler {
    async fn on_enter(&self, tag: &MessageTag) -> anyhow::Result<HandlerState> {
        self.stages.lock().processing_results.push(tag);
        Ok(Box::new(()))
    }

    async fn on_exit(
        &self,
        _state: HandlerState,
        tag: &MessageTag,
        _result: &mut anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.stages.lock().processing_results.pop(tag);
        Ok(())
    }
}

struct PublishedHandler {
    stages: Arc<Mutex<StagesState>>,
}

#[async_trait]
impl ContextHandler<MessagePublished, ()> for PublishedHandler {
    async fn on_enter(&self, published: &MessagePublished) -> anyhow::Result<HandlerState> {
        let mut stages = self.stages.lock();
        stages.processing_results.pop(&published.tag);
        stages.publishing.push(&published.tag);
        Ok(Box::new(()))
    }

    async fn on_exit(
        &self,
        _state: HandlerState,
        published: &MessagePublished,
        _result: &mut anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut stages = self.stages.lock();
        stages.publishing.pop(&published.tag);
        stages.processing_results.push(&published.tag);
        Ok(())
    }
}

struct BlockedHandler {
    stages: Arc<Mutex<StagesState>>,
}

#[async_trait]
impl ContextHandler<MessagePublished, ()> for BlockedHandler {
    async fn on_enter(&self, published: &MessagePublished) -> anyhow::Result<HandlerState> {
        let mut stages = self.stages.lock();
        stages.publishing.pop(&published.tag);
        stages.waiting_publish.push(&published.tag);
        Ok(Box::new(()))
    }

    async fn on_exit(
        &self,
        _state: HandlerState,
        published: &MessagePublished,
        _result: &mut anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.stages.lock().waiting_publish.pop(&published.tag);
        Ok(())
    }
}
