//! Per-job execution pipeline.
//!
//! An `ExecutableQueue` turns an input topic into a lazy sequence of
//! `ExecutableMessage`s, applying back-pressure (parkers), per-job
//! concurrency limits and optional batching on the way. The
//! `StageScheduler` then drives each message through
//! scheduled → submitted → executed → results-processed → published.

pub mod message;
pub mod scheduler;

pub use message::ExecutableMessage;
pub use scheduler::StageScheduler;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info};

use crate::hooks::{Hooks, ItemsBatch, MessageTag};
use crate::parkers::Parkers;
use crate::schemas::{JobOptions, PipelineMessage, QueueItem};
use crate::topics::{Topic, TopicDelivery};

// ============================================
// PENDING-MESSAGE ACCOUNTING
// ============================================

/// Counts in-flight messages of one job. Close waits on it reaching zero.
pub struct PendingCounter {
    count_tx: watch::Sender<usize>,
}

impl PendingCounter {
    fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self { count_tx }
    }

    pub fn count(&self) -> usize {
        *self.count_tx.borrow()
    }

    fn increment(&self) {
        self.count_tx.send_modify(|count| *count += 1);
    }

    fn decrement(&self) {
        self.count_tx.send_modify(|count| {
            *count = count.saturating_sub(1);
        });
    }

    async fn wait_zero(&self) {
        let mut count_rx = self.count_tx.subscribe();
        while *count_rx.borrow_and_update() != 0 {
            if count_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Guard for one pending message. The decrement happens exactly once, on
/// drop, so it survives every exit path including cancellation.
pub struct PendingGuard {
    counter: Arc<PendingCounter>,
}

impl PendingGuard {
    fn enter(counter: Arc<PendingCounter>) -> Self {
        counter.increment();
        Self { counter }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}

/// Queue internals shared with its in-flight messages.
pub(crate) struct QueueShared {
    pub definition: QueueItem,
    pub options: JobOptions,
}

// ============================================
// EXECUTABLE QUEUE
// ============================================

pub struct ExecutableQueue {
    shared: Arc<QueueShared>,
    input: Arc<dyn Topic>,
    output: HashMap<String, Vec<Arc<dyn Topic>>>,
    hooks: Arc<Hooks>,
    parkers: Arc<Parkers>,
    pending: Arc<PendingCounter>,
    semaphore: Option<Arc<Semaphore>>,
    batch_buffer: VecDeque<TopicDelivery>,
    input_exhausted: bool,
    is_opened: bool,
    is_closed: bool,
}

impl ExecutableQueue {
    pub fn new(
        definition: QueueItem,
        input: Arc<dyn Topic>,
        output: HashMap<String, Vec<Arc<dyn Topic>>>,
        hooks: Arc<Hooks>,
    ) -> Self {
        let options = definition.job_options();
        let semaphore = options
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            shared: Arc::new(QueueShared {
                definition,
                options,
            }),
            input,
            output,
            hooks,
            parkers: Arc::new(Parkers::new()),
            pending: Arc::new(PendingCounter::new()),
            semaphore,
            batch_buffer: VecDeque::new(),
            input_exhausted: false,
            is_opened: false,
            is_closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.definition.name
    }

    pub fn definition(&self) -> &QueueItem {
        &self.shared.definition
    }

    pub fn parkers(&self) -> Arc<Parkers> {
        self.parkers.clone()
    }

    pub fn pending_messages_count(&self) -> usize {
        self.pending.count()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Opens the input topic and every output topic. Idempotent.
    pub async fn open(&mut self) -> Result<(), crate::error::TopicError> {
        if self.is_opened {
            return Ok(());
        }
        self.input.open().await?;
        for topics in self.output.values() {
            for topic in topics {
                topic.open().await?;
            }
        }
        self.is_opened = true;
        Ok(())
    }

    /// Yields the next in-flight message. Returns `None` once the input is
    /// exhausted or the queue closed; the queue closes itself on the way
    /// out.
    pub async fn next(&mut self) -> Option<ExecutableMessage> {
        if let Err(e) = self.open().await {
            error!(job = %self.name(), error = %e, "Failed to open topics");
            self.close().await;
            return None;
        }

        loop {
            if self.is_closed {
                return None;
            }
            let Some(delivery) = self.next_delivery().await else {
                self.close().await;
                return None;
            };

            let permit = match &self.semaphore {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return None,
                },
                None => None,
            };

            let definition = &self.shared.definition;
            let (message, acker) = delivery.into_parts();
            let pipeline_message = PipelineMessage::new(
                definition.pipeline.info.clone(),
                message.extend(&definition.pipeline.args),
            );
            let tag = MessageTag::new(
                pipeline_message.id().to_string(),
                &definition.name,
                &definition.pipeline.info.name,
                &definition.executor,
                &definition.labels,
            );

            self.hooks.message_polled.emit(tag.clone()).await;
            self.parkers.wait().await;

            return Some(ExecutableMessage::new(
                tag,
                pipeline_message,
                Arc::downgrade(&self.shared),
                self.output.clone(),
                self.parkers.clone(),
                acker,
                permit,
                PendingGuard::enter(self.pending.clone()),
            ));
        }
    }

    /// Marks closed, closes the input, waits for all pending messages, then
    /// closes the outputs. Safe to call twice.
    pub async fn close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;

        if let Err(e) = self.input.close().await {
            error!(job = %self.name(), error = %e, "Failed to close input topic");
        }

        self.pending.wait_zero().await;

        for topics in self.output.values() {
            for topic in topics {
                if let Err(e) = topic.close().await {
                    error!(job = %self.name(), topic = %topic.name(), error = %e,
                        "Failed to close output topic");
                }
            }
        }
        info!(job = %self.name(), "Job closed");
    }

    /// Next raw delivery: straight from the topic, or through the buffering
    /// stage when batching is enabled. Topic errors are logged and the
    /// message dropped.
    async fn next_delivery(&mut self) -> Option<TopicDelivery> {
        if let Some(delivery) = self.batch_buffer.pop_front() {
            return Some(delivery);
        }
        if self.input_exhausted {
            return None;
        }
        if !self.shared.options.batching_enabled {
            return self.poll_input().await;
        }

        // Buffering stage: group up to `buffer_size` items or flush after
        // `buffer_flush_after`, whichever comes first.
        let first = self.poll_input().await?;
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs_f64(self.shared.options.buffer_flush_after);

        while batch.len() < self.shared.options.buffer_size {
            tokio::select! {
                delivery = self.input.next() => match delivery {
                    Ok(Some(delivery)) => batch.push(delivery),
                    Ok(None) => {
                        self.input_exhausted = true;
                        break;
                    }
                    Err(e) => {
                        error!(job = %self.shared.definition.name, error = %e,
                            "Failed to process message");
                    }
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        debug!(job = %self.shared.definition.name, size = batch.len(), "Batch ready");
        self.hooks
            .items_batched
            .emit(ItemsBatch {
                job: self.shared.definition.name.clone(),
                items: batch.iter().map(|d| d.message.clone()).collect(),
            })
            .await;
        self.batch_buffer.extend(batch);
        self.batch_buffer.pop_front()
    }

    async fn poll_input(&mut self) -> Option<TopicDelivery> {
        loop {
            match self.input.next().await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {
                    self.input_exhausted = true;
                    return None;
                }
                Err(e) => {
                    error!(job = %self.shared.definition.name, error = %e,
                        "Failed to process message");
                }
            }
        }
    }
}
