//! One in-flight unit of work, owned by exactly one queue.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use super::{PendingGuard, QueueShared};
use crate::hooks::MessageTag;
use crate::parkers::{ParkToken, Parkers};
use crate::resources::ResourcesContext;
use crate::schemas::{JobOptions, PipelineMessage, ResourceUsed};
use crate::topics::{Acknowledge, Topic};

type Cleanup = Box<dyn FnOnce() + Send + Sync>;

/// An in-flight message: the pipeline message, its acquired resources, the
/// delivery acknowledgement and a cleanup stack that runs exactly once, in
/// reverse order, on every exit path.
///
/// The queue back-pointer is non-owning and used for configuration lookup
/// only; it never extends the queue's lifetime.
pub struct ExecutableMessage {
    tag: MessageTag,
    pub message: PipelineMessage,
    queue: Weak<QueueShared>,
    output: HashMap<String, Vec<Arc<dyn Topic>>>,
    parkers: Arc<Parkers>,
    park_token: ParkToken,
    resources: Option<ResourcesContext>,
    acker: Option<Box<dyn Acknowledge>>,
    permit: Option<OwnedSemaphorePermit>,
    pending: Option<PendingGuard>,
    cleanups: Vec<Cleanup>,
}

impl ExecutableMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tag: MessageTag,
        message: PipelineMessage,
        queue: Weak<QueueShared>,
        output: HashMap<String, Vec<Arc<dyn Topic>>>,
        parkers: Arc<Parkers>,
        acker: Option<Box<dyn Acknowledge>>,
        permit: Option<OwnedSemaphorePermit>,
        pending: PendingGuard,
    ) -> Self {
        Self {
            tag,
            message,
            queue,
            output,
            parkers,
            park_token: ParkToken::new(),
            resources: None,
            acker,
            permit,
            pending: Some(pending),
            cleanups: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn tag(&self) -> &MessageTag {
        &self.tag
    }

    /// The owning job's options, when the queue is still around.
    pub fn job_options(&self) -> Option<JobOptions> {
        self.queue.upgrade().map(|queue| queue.options.clone())
    }

    /// Stalls the owning queue's polling until `unpark`.
    pub fn park(&self) {
        self.parkers.park(self.park_token);
    }

    pub fn unpark(&self) {
        self.parkers.unpark(self.park_token);
    }

    pub fn output_topics(&self, channel: &str) -> Option<&[Arc<dyn Topic>]> {
        self.output.get(channel).map(Vec::as_slice)
    }

    /// Takes ownership of acquired resources and injects their argument
    /// objects into the pipeline message.
    pub fn attach_resources(&mut self, resources: ResourcesContext) {
        let args = resources.as_args();
        self.message.update_with_resources(&args);
        self.resources = Some(resources);
    }

    /// Applies reported state rewrites and deferred releases to the held
    /// leases.
    pub fn update_resources_used(&mut self, used: &[ResourceUsed]) {
        if let Some(resources) = &mut self.resources {
            resources.apply_used(used);
        }
    }

    /// Returns the leases to the pool now instead of at the end of the
    /// message's life.
    pub fn release_resources(&mut self) {
        self.resources.take();
    }

    /// Registers a cleanup; cleanups run in reverse registration order.
    pub fn push_cleanup(&mut self, cleanup: impl FnOnce() + Send + Sync + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Terminates the message: resolves the delivery (ack on success, nack
    /// on failure), releases resources, runs the cleanup stack and
    /// decrements the pending counter.
    pub async fn finish(mut self, success: bool) {
        if let Some(acker) = self.acker.take() {
            let resolved = if success {
                acker.ack().await
            } else {
                acker.nack().await
            };
            if let Err(e) = resolved {
                warn!(message_id = %self.message.id(), error = %e,
                    "Failed to resolve message delivery");
            }
        }
        self.unwind();
        // resources, pending guard and permit drop here
    }

    fn unwind(&mut self) {
        self.unpark();
        self.resources.take();
        for cleanup in self.cleanups.drain(..).rev() {
            cleanup();
        }
        self.pending.take();
        self.permit.take();
    }
}

impl Drop for ExecutableMessage {
    fn drop(&mut self) {
        // Cancellation safety: a dropped message still runs its cleanup
        // stack and releases its pending slot. An unresolved acker is
        // dropped as-is; the transport redelivers.
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::pipeline::ExecutableQueue;
    use crate::resources::{Resource, ResourceManager};
    use crate::schemas::{PipelineInfo, PipelineSpec, QueueItem, TopicRef};
    use crate::topics::MemoryTopic;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    async fn one_message_queue() -> ExecutableQueue {
        let input = Arc::new(MemoryTopic::new(Uuid::new_v4().to_string()));
        input
            .publish(&crate::testing::message("0", &[]), true)
            .await
            .unwrap();
        input.close().await.unwrap();

        ExecutableQueue::new(
            QueueItem {
                name: "job-1".into(),
                pipeline: PipelineSpec {
                    info: PipelineInfo {
                        name: "normalize".into(),
                        resources: HashMap::from([(
                            "key".to_string(),
                            "api-key".to_string(),
                        )]),
                    },
                    args: HashMap::new(),
                },
                input: TopicRef::new("in"),
                output: HashMap::new(),
                executor: "default".into(),
                labels: HashMap::new(),
                config: HashMap::new(),
            },
            input,
            HashMap::new(),
            Arc::new(Hooks::new()),
        )
    }

    #[tokio::test]
    async fn test_cleanups_run_in_reverse_order() {
        let mut queue = one_message_queue().await;
        let mut xmsg = queue.next().await.unwrap();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            xmsg.push_cleanup(move || order.lock().push(label));
        }
        xmsg.finish(true).await;
        assert_eq!(*order.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_drop_runs_cleanups_once() {
        let mut queue = one_message_queue().await;
        let mut xmsg = queue.next().await.unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        xmsg.push_cleanup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(xmsg);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_messages_count(), 0);
    }

    #[tokio::test]
    async fn test_attach_resources_injects_args() {
        let manager = ResourceManager::new();
        manager.add(Resource {
            name: "key-1".into(),
            resource_type: "api-key".into(),
            state: Some(json!({"cursor": 3})),
            data: HashMap::from([("token".to_string(), json!("secret"))]),
            default_delay: None,
        });

        let mut queue = one_message_queue().await;
        let mut xmsg = queue.next().await.unwrap();

        let needs = xmsg.message.info.resources.clone();
        xmsg.attach_resources(manager.acquire(&needs).await);

        let injected = &xmsg.message.resource_args["key"];
        assert_eq!(injected["name"], json!("key-1"));
        assert_eq!(injected["state"], json!({"cursor": 3}));
        assert_eq!(injected["token"], json!("secret"));
        xmsg.finish(true).await;
    }
}
