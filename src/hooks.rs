//! Hook points surrounding every pipeline stage.
//!
//! Two shapes:
//! - `EventHook<T>`: fire-and-forget; every handler runs, handler errors are
//!   logged and isolated.
//! - `ContextHook<T, R>`: middleware chain wrapping an inner call; each
//!   handler splits into an enter phase and an exit phase. Enter runs in
//!   registration order, exit in reverse (classic middleware stack).
//!
//! The registry is append-only after service start.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::schemas::{MessageId, TopicMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================
// HOOK PAYLOADS
// ============================================

/// Identity of one in-flight message, cheap to clone into hook handlers.
///
/// `execution_id` is unique per `ExecutableMessage`; message ids may repeat
/// across retries.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MessageTag(Arc<MessageTagInner>);

#[derive(PartialEq, Eq, Hash)]
struct MessageTagInner {
    execution_id: Uuid,
    message_id: MessageId,
    job: String,
    pipeline: String,
    executor: String,
    labels: BTreeMap<String, String>,
}

impl MessageTag {
    pub fn new(
        message_id: MessageId,
        job: impl Into<String>,
        pipeline: impl Into<String>,
        executor: impl Into<String>,
        labels: &HashMap<String, String>,
    ) -> Self {
        Self(Arc::new(MessageTagInner {
            execution_id: Uuid::new_v4(),
            message_id,
            job: job.into(),
            pipeline: pipeline.into(),
            executor: executor.into(),
            labels: labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }))
    }

    pub fn execution_id(&self) -> Uuid {
        self.0.execution_id
    }

    pub fn message_id(&self) -> &str {
        &self.0.message_id
    }

    pub fn job(&self) -> &str {
        &self.0.job
    }

    pub fn pipeline(&self) -> &str {
        &self.0.pipeline
    }

    pub fn executor(&self) -> &str {
        &self.0.executor
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.0.labels
    }
}

impl fmt::Debug for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTag")
            .field("message_id", &self.0.message_id)
            .field("job", &self.0.job)
            .field("pipeline", &self.0.pipeline)
            .finish()
    }
}

/// A batch of polled items grouped by the buffering stage.
#[derive(Debug, Clone)]
pub struct ItemsBatch {
    pub job: String,
    pub items: Vec<TopicMessage>,
}

/// Payload of the publish hooks.
#[derive(Debug, Clone)]
pub struct MessagePublished {
    pub tag: MessageTag,
    pub channel: String,
    pub topic: String,
}

// ============================================
// EVENT HOOK
// ============================================

type EventHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct EventHook<T> {
    name: &'static str,
    handlers: RwLock<Vec<EventHandler<T>>>,
}

impl<T: Clone + Send + 'static> EventHook<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .write()
            .push(Arc::new(move |payload| Box::pin(handler(payload))));
    }

    /// Invokes every handler in registration order. Handler errors are
    /// logged, never raised.
    pub async fn emit(&self, payload: T) {
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler(payload.clone()).await {
                error!(hook = self.name, error = %e, "Hook handler failed");
            }
        }
    }
}

// ============================================
// CONTEXT HOOK
// ============================================

/// State handed from a handler's enter phase to its exit phase.
pub type HandlerState = Box<dyn Any + Send>;

/// One middleware layer around an inner call.
#[async_trait]
pub trait ContextHandler<T, R>: Send + Sync {
    /// Pre-phase. An error aborts the whole chain: inner never runs and the
    /// already-entered handlers never see an exit.
    async fn on_enter(&self, input: &T) -> anyhow::Result<HandlerState>;

    /// Post-phase, run in reverse registration order. May observe the result
    /// or the error. Errors here are captured by the hook's error handler
    /// and do not corrupt the result.
    async fn on_exit(
        &self,
        state: HandlerState,
        input: &T,
        result: &mut anyhow::Result<R>,
    ) -> anyhow::Result<()>;
}

pub struct ContextHook<T, R> {
    name: &'static str,
    handlers: RwLock<Vec<Arc<dyn ContextHandler<T, R>>>>,
}

impl<T: Send + Sync, R: Send> ContextHook<T, R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn ContextHandler<T, R>>) {
        self.handlers.write().push(handler);
    }

    /// Runs `inner` wrapped by every registered handler.
    pub async fn call<F, Fut>(&self, input: &T, inner: F) -> anyhow::Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let handlers: Vec<_> = self.handlers.read().clone();

        let mut entered: Vec<(Arc<dyn ContextHandler<T, R>>, HandlerState)> =
            Vec::with_capacity(handlers.len());
        for handler in handlers {
            let state = handler.on_enter(input).await?;
            entered.push((handler, state));
        }

        let mut result = inner().await;

        for (handler, state) in entered.into_iter().rev() {
            if let Err(e) = handler.on_exit(state, input, &mut result).await {
                self.handle_error(e);
            }
        }

        result
    }

    fn handle_error(&self, error: anyhow::Error) {
        error!(hook = self.name, error = %error, "Error while handling hook");
    }
}

// ============================================
// SYNC EVENT HOOK
// ============================================

pub type SyncEventHandler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Fire-and-forget hook for synchronous contexts (executor pool slots).
/// Handlers receive the payload by reference; errors are logged, never
/// raised.
pub struct SyncEventHook<T> {
    name: &'static str,
    handlers: RwLock<Vec<SyncEventHandler<T>>>,
}

impl<T> SyncEventHook<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn register_handler(&self, handler: SyncEventHandler<T>) {
        self.handlers.write().push(handler);
    }

    /// Snapshot of the registered handlers, for carrying them across the
    /// executor boundary into per-slot hooks.
    pub fn handlers(&self) -> Vec<SyncEventHandler<T>> {
        self.handlers.read().clone()
    }

    pub fn emit(&self, payload: &T) {
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(e) = handler(payload) {
                error!(hook = self.name, error = %e, "Hook handler failed");
            }
        }
    }
}

// ============================================
// SYNC CONTEXT HOOK
// ============================================

/// One synchronous middleware layer; used on executor pool slots where no
/// async runtime is available.
pub trait SyncContextHandler<T, R>: Send + Sync {
    fn on_enter(&self, input: &T) -> anyhow::Result<HandlerState>;

    fn on_exit(
        &self,
        state: HandlerState,
        input: &T,
        result: &mut anyhow::Result<R>,
    ) -> anyhow::Result<()>;
}

pub struct SyncContextHook<T, R> {
    name: &'static str,
    handlers: RwLock<Vec<Arc<dyn SyncContextHandler<T, R>>>>,
}

impl<T, R> SyncContextHook<T, R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn SyncContextHandler<T, R>>) {
        self.handlers.write().push(handler);
    }

    /// Same chain semantics as [`ContextHook::call`], synchronously.
    pub fn call<F>(&self, input: &T, inner: F) -> anyhow::Result<R>
    where
        F: FnOnce(&T) -> anyhow::Result<R>,
    {
        let handlers: Vec<_> = self.handlers.read().clone();

        let mut entered: Vec<(Arc<dyn SyncContextHandler<T, R>>, HandlerState)> =
            Vec::with_capacity(handlers.len());
        for handler in handlers {
            let state = handler.on_enter(input)?;
            entered.push((handler, state));
        }

        let mut result = inner(input);

        for (handler, state) in entered.into_iter().rev() {
            if let Err(e) = handler.on_exit(state, input, &mut result) {
                error!(hook = self.name, error = %e, "Error while handling hook");
            }
        }

        result
    }
}

// ============================================
// HOOK REGISTRY
// ============================================

/// Every hook point of the stage pipeline. `executor_initialized` is the
/// one executor-side entry: it fires once per worker slot, when the slot's
/// bootstrap is built.
pub struct Hooks {
    pub message_polled: EventHook<MessageTag>,
    pub items_batched: EventHook<ItemsBatch>,
    pub message_scheduled: EventHook<MessageTag>,
    pub message_submitted: EventHook<MessageTag>,
    pub message_executed: ContextHook<MessageTag, crate::schemas::PipelineResults>,
    pub results_processed: ContextHook<MessageTag, ()>,
    pub message_published: ContextHook<MessagePublished, ()>,
    pub output_blocked: ContextHook<MessagePublished, ()>,
    pub executor_initialized: SyncEventHook<crate::executor::bootstrap::PipelineBootstrap>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            message_polled: EventHook::new("message_polled"),
            items_batched: EventHook::new("items_batched"),
            message_scheduled: EventHook::new("message_scheduled"),
            message_submitted: EventHook::new("message_submitted"),
            message_executed: ContextHook::new("message_executed"),
            results_processed: ContextHook::new("results_processed"),
            message_published: ContextHook::new("message_published"),
            output_blocked: ContextHook::new("output_blocked"),
            executor_initialized: SyncEventHook::new("executor_initialized"),
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_event_hook_isolates_errors() {
        let hook: EventHook<u32> = EventHook::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        hook.register(|_| async { anyhow::bail!("first handler fails") });
        let calls2 = calls.clone();
        hook.register(move |n| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(n as usize, Ordering::SeqCst);
                Ok(())
            }
        });

        hook.emit(3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sync_event_hook_isolates_errors() {
        let hook: SyncEventHook<u32> = SyncEventHook::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        hook.register(|_: &u32| anyhow::bail!("first handler fails"));
        let calls2 = calls.clone();
        hook.register(move |n: &u32| {
            calls2.fetch_add(*n as usize, Ordering::SeqCst);
            Ok(())
        });

        hook.emit(&3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(hook.handlers().len(), 2);
    }

    struct Recorder {
        id: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_enter: bool,
        fail_exit: bool,
    }

    #[async_trait]
    impl ContextHandler<u32, u32> for Recorder {
        async fn on_enter(&self, input: &u32) -> anyhow::Result<HandlerState> {
            self.log.lock().unwrap().push(format!("enter:{}", self.id));
            if self.fail_enter {
                anyhow::bail!("enter failed");
            }
            Ok(Box::new(*input))
        }

        async fn on_exit(
            &self,
            state: HandlerState,
            _input: &u32,
            result: &mut anyhow::Result<u32>,
        ) -> anyhow::Result<()> {
            let seen = *state.downcast::<u32>().unwrap();
            self.log
                .lock()
                .unwrap()
                .push(format!("exit:{}:{}", self.id, seen));
            if self.fail_exit {
                anyhow::bail!("exit failed");
            }
            if let Ok(value) = result {
                *value += 1;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_context_hook_middleware_order() {
        let hook: ContextHook<u32, u32> = ContextHook::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in ["a", "b"] {
            hook.register(Arc::new(Recorder {
                id,
                log: log.clone(),
                fail_enter: false,
                fail_exit: false,
            }));
        }

        let result = hook.call(&7, || async { Ok(7 * 10) }).await.unwrap();
        // Both exit handlers observed and incremented the result.
        assert_eq!(result, 72);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter:a", "enter:b", "exit:b:7", "exit:a:7"]
        );
    }

    #[tokio::test]
    async fn test_context_hook_enter_error_aborts() {
        let hook: ContextHook<u32, u32> = ContextHook::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        hook.register(Arc::new(Recorder {
            id: "a",
            log: log.clone(),
            fail_enter: true,
            fail_exit: false,
        }));

        let result = hook.call(&1, || async { Ok(1) }).await;
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["enter:a"]);
    }

    #[tokio::test]
    async fn test_context_hook_exit_error_captured() {
        let hook: ContextHook<u32, u32> = ContextHook::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        hook.register(Arc::new(Recorder {
            id: "a",
            log: log.clone(),
            fail_enter: false,
            fail_exit: true,
        }));

        // The exit-phase failure is captured; the result is untouched.
        let result = hook.call(&1, || async { Ok(41) }).await.unwrap();
        assert_eq!(result, 41);
    }
}
