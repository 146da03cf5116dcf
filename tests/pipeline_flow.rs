//! End-to-end pipeline tests over in-memory topics and the local executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use conveyor::executor::bootstrap::{PipelineContext, PipelineOutcome, PipelineRegistry};
use conveyor::executor::pool::{ExecutionPool, PoolOptions};
use conveyor::executor::{Executor, InProcessExecutor};
use conveyor::hooks::MessagePublished;
use conveyor::pipeline::{ExecutableQueue, StageScheduler};
use conveyor::resources::Resource;
use conveyor::schemas::{
    PipelineInfo, PipelineResult, PipelineSpec, QueueItem, ResourceUsed, TopicMessage, TopicRef,
};
use conveyor::services::Services;
use conveyor::topics::{MemoryTopic, Topic};

fn executor_with(registry: PipelineRegistry, concurrency: usize) -> Arc<dyn Executor> {
    let pool = ExecutionPool::start(
        &PoolOptions {
            worker_concurrency: concurrency,
            ..PoolOptions::default()
        },
        registry,
        Vec::new(),
    )
    .unwrap();
    Arc::new(InProcessExecutor::new("local", Arc::new(pool)))
}

fn queue_item(
    pipeline: &str,
    resources: &[(&str, &str)],
    config: HashMap<String, serde_json::Value>,
) -> QueueItem {
    QueueItem {
        name: "job-1".into(),
        pipeline: PipelineSpec {
            info: PipelineInfo {
                name: pipeline.into(),
                resources: resources
                    .iter()
                    .map(|(param, ty)| (param.to_string(), ty.to_string()))
                    .collect(),
            },
            args: HashMap::new(),
        },
        input: TopicRef::new("in"),
        output: HashMap::from([("default".to_string(), vec![TopicRef::new("out")])]),
        executor: "local".into(),
        labels: HashMap::new(),
        config,
    }
}

async fn seeded_input(ids: &[&str]) -> Arc<MemoryTopic> {
    let topic = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
    for id in ids {
        topic
            .publish(&TopicMessage::new(*id, HashMap::new()), true)
            .await
            .unwrap();
    }
    topic.close().await.unwrap();
    topic
}

#[tokio::test(start_paused = true)]
async fn test_resource_state_carries_over_to_next_acquirer() {
    let registry = PipelineRegistry::new();
    registry.register("rotate-key", |ctx: PipelineContext| {
        assert_eq!(ctx.resources["key"]["name"], json!("key-1"));
        Ok(PipelineOutcome::Single(PipelineResult::Resource(
            ResourceUsed {
                resource_type: "api-key".into(),
                state: Some(json!({"cursor": 7})),
                release_at: Some(chrono::Utc::now() + chrono::Duration::seconds(60)),
            },
        )))
    });

    let services = Services::new();
    services.resources.add(Resource {
        name: "key-1".into(),
        resource_type: "api-key".into(),
        state: None,
        data: HashMap::new(),
        default_delay: None,
    });

    let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
    let queue = ExecutableQueue::new(
        queue_item("rotate-key", &[("key", "api-key")], HashMap::new()),
        seeded_input(&["0"]).await,
        HashMap::new(),
        services.hooks.clone(),
    );
    scheduler.run_job(queue, executor_with(registry, 2)).await;

    // The resource is deferred for 60s and the rewritten state must be
    // visible to whoever acquires it next.
    let needs = HashMap::from([("key".to_string(), "api-key".to_string())]);
    let blocked =
        tokio::time::timeout(Duration::from_secs(50), services.resources.acquire(&needs)).await;
    assert!(blocked.is_err(), "resource must stay deferred");

    let lease = tokio::time::timeout(Duration::from_secs(30), services.resources.acquire(&needs))
        .await
        .expect("resource must become available after the deferral");
    assert_eq!(
        lease.leases()["key"].resource().state,
        Some(json!({"cursor": 7}))
    );
}

#[tokio::test]
async fn test_max_concurrency_is_never_exceeded() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let registry = PipelineRegistry::new();
    {
        let current = current.clone();
        let peak = peak.clone();
        registry.register("slow", move |_ctx: PipelineContext| {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(PipelineOutcome::Empty)
        });
    }

    let services = Services::new();
    let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
    let config = HashMap::from([("job".to_string(), json!({"max_concurrency": 2}))]);
    let queue = ExecutableQueue::new(
        queue_item("slow", &[], config),
        seeded_input(&["0", "1", "2", "3", "4", "5"]).await,
        HashMap::new(),
        services.hooks.clone(),
    );

    scheduler.run_job(queue, executor_with(registry, 4)).await;
    assert!(peak.load(Ordering::SeqCst) <= 2, "at most two in flight");
}

#[tokio::test]
async fn test_blocked_output_parks_and_recovers() {
    let registry = PipelineRegistry::new();
    registry.register("echo", |ctx: PipelineContext| {
        Ok(PipelineOutcome::Single(PipelineResult::Message(ctx.message)))
    });

    let services = Services::new();
    let blocked_events = Arc::new(AtomicUsize::new(0));
    {
        struct CountBlocked(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl conveyor::hooks::ContextHandler<MessagePublished, ()> for CountBlocked {
            async fn on_enter(
                &self,
                _input: &MessagePublished,
            ) -> anyhow::Result<conveyor::hooks::HandlerState> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(()))
            }

            async fn on_exit(
                &self,
                _state: conveyor::hooks::HandlerState,
                _input: &MessagePublished,
                _result: &mut anyhow::Result<()>,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }
        services
            .hooks
            .output_blocked
            .register(Arc::new(CountBlocked(blocked_events.clone())));
    }

    let out_name = Uuid::new_v4().to_string();
    let output = Arc::new(MemoryTopic::with_capacity(out_name.clone(), 1));
    let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
    let queue = ExecutableQueue::new(
        queue_item("echo", &[], HashMap::new()),
        seeded_input(&["0", "1", "2"]).await,
        HashMap::from([("default".to_string(), vec![output.clone() as Arc<dyn Topic>])]),
        services.hooks.clone(),
    );

    // Slow consumer on a second handle of the same queue.
    let reader = Arc::new(MemoryTopic::new(out_name));
    let drained = {
        let reader = reader.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let delivery = reader.next().await.unwrap().unwrap();
                seen.push(delivery.message.id.clone());
                delivery.resolve(true).await.unwrap();
            }
            seen
        })
    };

    scheduler.run_job(queue, executor_with(registry, 1)).await;

    let mut seen = drained.await.unwrap();
    seen.sort();
    assert_eq!(seen, ["0", "1", "2"]);
    assert!(
        blocked_events.load(Ordering::SeqCst) >= 1,
        "the bounded output must have blocked at least once"
    );
}

#[tokio::test]
async fn test_close_leaves_no_pending_and_closes_outputs() {
    let registry = PipelineRegistry::new();
    registry.register("echo", |ctx: PipelineContext| {
        Ok(PipelineOutcome::Single(PipelineResult::Message(ctx.message)))
    });

    let services = Services::new();
    let output = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
    let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
    let queue = ExecutableQueue::new(
        queue_item("echo", &[], HashMap::new()),
        seeded_input(&["0", "1"]).await,
        HashMap::from([("default".to_string(), vec![output.clone() as Arc<dyn Topic>])]),
        services.hooks.clone(),
    );

    scheduler.run_job(queue, executor_with(registry, 2)).await;

    // The job closed its output topic on the way out: this very instance
    // now rejects publishes.
    let result = output.publish(&TopicMessage::new("x", HashMap::new()), true).await;
    assert!(matches!(result, Err(conveyor::error::TopicError::Closed)));
}

#[tokio::test]
async fn test_usage_metrics_observe_the_flow() {
    let registry = PipelineRegistry::new();
    registry.register("echo", |ctx: PipelineContext| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(PipelineOutcome::Single(PipelineResult::Message(ctx.message)))
    });

    let services = Services::new();
    let output = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
    let scheduler = StageScheduler::new(services.hooks.clone(), services.resources.clone());
    let queue = ExecutableQueue::new(
        queue_item("echo", &[], HashMap::new()),
        seeded_input(&["0", "1", "2"]).await,
        HashMap::from([("default".to_string(), vec![output as Arc<dyn Topic>])]),
        services.hooks.clone(),
    );

    scheduler.run_job(queue, executor_with(registry, 2)).await;

    let usages = services.usage_metrics.collect(tokio::time::Instant::now());
    let executing: f64 = usages
        .iter()
        .filter(|u| u.stage == "executing")
        .map(|u| u.usage)
        .sum();
    assert!(executing > 0.0, "execution time must be attributed");
    // Everything drained: a second collection over an idle interval reports
    // zero residency everywhere.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let idle = services.usage_metrics.collect(tokio::time::Instant::now());
    assert!(idle.iter().all(|u| u.usage < 0.2));
}
