//! Drives in-flight messages through the execution stages.
//!
//! For each message: `message_scheduled` → resource acquisition →
//! `message_submitted` (gated on executor capacity, parking the queue when
//! full) → execution inside the `message_executed` hook → result processing
//! and publication inside `results_processed` → per-output
//! `message_published`, flipping to `output_blocked` on back-pressure.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ExecutableMessage, ExecutableQueue};
use crate::executor::Executor;
use crate::hooks::{Hooks, MessagePublished};
use crate::resources::ResourceManager;
use crate::schemas::{PipelineOutput, PipelineResults};

#[derive(Clone)]
pub struct StageScheduler {
    hooks: Arc<Hooks>,
    resources: ResourceManager,
}

impl StageScheduler {
    pub fn new(hooks: Arc<Hooks>, resources: ResourceManager) -> Self {
        Self { hooks, resources }
    }

    /// Consumes the queue until it closes, processing each message
    /// concurrently up to the executor's capacity.
    pub async fn run_job(&self, mut queue: ExecutableQueue, executor: Arc<dyn Executor>) {
        let gate = Arc::new(Semaphore::new(executor.concurrency().max(1)));
        let mut tasks = JoinSet::new();
        info!(job = %queue.name(), executor = %executor.name(), "Job started");

        while let Some(mut xmsg) = queue.next().await {
            let tag = xmsg.tag().clone();
            self.hooks.message_scheduled.emit(tag.clone()).await;

            let needs = xmsg.message.info.resources.clone();
            let resources = self.resources.acquire(&needs).await;
            xmsg.attach_resources(resources);

            // Submission is bounded by the executor's capacity; a full
            // executor parks the queue instead of dropping the message.
            let permit = match gate.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    crate::metrics::record_backpressure(tag.job(), "executor_full");
                    xmsg.park();
                    let permit = gate.clone().acquire_owned().await;
                    xmsg.unpark();
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };
            self.hooks.message_submitted.emit(tag).await;

            let scheduler = self.clone();
            let executor = executor.clone();
            tasks.spawn(async move {
                scheduler.process(xmsg, executor).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message task failed");
            }
        }
        info!(job = %queue.name(), "Job drained");
    }

    /// Executes one message and publishes its results. Every exit path
    /// finishes the message.
    pub async fn process(&self, mut xmsg: ExecutableMessage, executor: Arc<dyn Executor>) {
        let tag = xmsg.tag().clone();
        let message = xmsg.message.clone();

        let executed = self
            .hooks
            .message_executed
            .call(&tag, || async {
                executor
                    .submit(message)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await;

        let results = match executed {
            Ok(results) => results,
            Err(e) => {
                error!(
                    job = tag.job(),
                    message_id = tag.message_id(),
                    error = format!("{e:#}"),
                    "Pipeline execution failed"
                );
                crate::metrics::record_message_processed(tag.job(), tag.pipeline(), false);
                xmsg.finish(false).await;
                return;
            }
        };

        let mut all_published = true;
        let processed = self
            .hooks
            .results_processed
            .call(&tag, || async {
                xmsg.update_resources_used(&results.resources);
                xmsg.release_resources();
                for event in &results.events {
                    debug!(
                        job = tag.job(),
                        event = %event.name,
                        "Pipeline event"
                    );
                }
                all_published = self.publish_outputs(&xmsg, &results).await;
                Ok(())
            })
            .await;

        match processed {
            Ok(()) => {
                crate::metrics::record_message_processed(
                    tag.job(),
                    tag.pipeline(),
                    all_published,
                );
                xmsg.finish(all_published).await;
            }
            Err(e) => {
                error!(
                    job = tag.job(),
                    message_id = tag.message_id(),
                    error = format!("{e:#}"),
                    "Result processing failed"
                );
                crate::metrics::record_message_processed(tag.job(), tag.pipeline(), false);
                xmsg.finish(false).await;
            }
        }
    }

    /// Publishes every output to every topic bound to its channel. Unknown
    /// channels are logged and dropped; a closed topic fails the message.
    async fn publish_outputs(&self, xmsg: &ExecutableMessage, results: &PipelineResults) -> bool {
        let mut all_published = true;
        for output in &results.outputs {
            let Some(topics) = xmsg.output_topics(&output.channel) else {
                warn!(
                    job = xmsg.tag().job(),
                    channel = %output.channel,
                    "No topic bound to output channel"
                );
                all_published = false;
                continue;
            };
            for topic in topics {
                match self.publish_one(xmsg, topic.as_ref(), output).await {
                    Ok(()) => crate::metrics::record_publish(topic.name(), true),
                    Err(e) => {
                        error!(
                            job = xmsg.tag().job(),
                            topic = topic.name(),
                            error = format!("{e:#}"),
                            "Failed to publish message"
                        );
                        crate::metrics::record_publish(topic.name(), false);
                        all_published = false;
                    }
                }
            }
        }
        all_published
    }

    async fn publish_one(
        &self,
        xmsg: &ExecutableMessage,
        topic: &dyn crate::topics::Topic,
        output: &PipelineOutput,
    ) -> anyhow::Result<()> {
        let published = MessagePublished {
            tag: xmsg.tag().clone(),
            channel: output.channel.clone(),
            topic: topic.name().to_string(),
        };

        self.hooks
            .message_published
            .call(&published, || async {
                if topic.publish(&output.message, false).await? {
                    return Ok(());
                }
                // Output back-pressure: park the queue and wait it out.
                self.hooks
                    .output_blocked
                    .call(&published, || async {
                        xmsg.park();
                        let result = topic.publish(&output.message, true).await;
                        xmsg.unpark();
                        result.map(|_| ()).map_err(anyhow::Error::from)
                    })
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::bootstrap::{PipelineContext, PipelineOutcome, PipelineRegistry};
    use crate::executor::pool::PoolOptions;
    use crate::executor::{ExecutionPool, InProcessExecutor};
    use crate::hooks::MessageTag;
    use crate::schemas::{
        PipelineInfo, PipelineResult, PipelineSpec, QueueItem, TopicRef,
    };
    use crate::topics::{MemoryTopic, Topic};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn echo_executor() -> Arc<dyn Executor> {
        let registry = PipelineRegistry::new();
        registry.register("echo", |ctx: PipelineContext| {
            Ok(PipelineOutcome::Single(PipelineResult::Message(
                ctx.message,
            )))
        });
        let pool = ExecutionPool::start(&PoolOptions::default(), registry, Vec::new()).unwrap();
        Arc::new(InProcessExecutor::new("local", Arc::new(pool)))
    }

    fn queue_with(
        input: Arc<MemoryTopic>,
        output: Arc<MemoryTopic>,
        hooks: Arc<Hooks>,
    ) -> ExecutableQueue {
        ExecutableQueue::new(
            QueueItem {
                name: "job-1".into(),
                pipeline: PipelineSpec {
                    info: PipelineInfo {
                        name: "echo".into(),
                        resources: HashMap::new(),
                    },
                    args: HashMap::new(),
                },
                input: TopicRef::new("in"),
                output: HashMap::from([(
                    "default".to_string(),
                    vec![TopicRef::new("out")],
                )]),
                executor: "local".into(),
                labels: HashMap::new(),
                config: HashMap::new(),
            },
            input,
            HashMap::from([(
                "default".to_string(),
                vec![output as Arc<dyn Topic>],
            )]),
            hooks,
        )
    }

    #[tokio::test]
    async fn test_messages_flow_to_output_topic() {
        let out_name = Uuid::new_v4().to_string();
        let input = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
        let output = Arc::new(MemoryTopic::new(out_name.clone()));
        for id in ["0", "1", "2"] {
            input
                .publish(&crate::testing::message(id, &[]), true)
                .await
                .unwrap();
        }
        input.close().await.unwrap();

        let hooks = Arc::new(Hooks::new());
        let scheduler = StageScheduler::new(hooks.clone(), ResourceManager::new());
        let queue = queue_with(input, output, hooks);

        scheduler.run_job(queue, echo_executor()).await;

        // Drain through a fresh handle on the same queue; the job closed its
        // own output handle on the way out.
        let reader = MemoryTopic::new(out_name);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = reader.next().await.unwrap().unwrap();
            seen.push(delivery.message.id.clone());
        }
        seen.sort();
        assert_eq!(seen, ["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_stage_hooks_fire_in_order() {
        let input = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
        let output = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
        input
            .publish(&crate::testing::message("0", &[]), true)
            .await
            .unwrap();
        input.close().await.unwrap();

        let hooks = Arc::new(Hooks::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (name, hook) in [
            ("polled", &hooks.message_polled),
            ("scheduled", &hooks.message_scheduled),
            ("submitted", &hooks.message_submitted),
        ] {
            let log = log.clone();
            hook.register(move |_: MessageTag| {
                let log = log.clone();
                async move {
                    log.lock().push(name);
                    Ok(())
                }
            });
        }

        let scheduler = StageScheduler::new(hooks.clone(), ResourceManager::new());
        let queue = queue_with(input, output, hooks);
        scheduler.run_job(queue, echo_executor()).await;

        assert_eq!(*log.lock(), vec!["polled", "scheduled", "submitted"]);
    }
}
