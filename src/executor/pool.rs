//! Worker pools behind a single submit interface.
//!
//! Thread slots are dedicated OS threads; process slots are children running
//! this binary's `pipeline-slot` subcommand and speaking JSON lines on
//! stdio. Either way the slot initializer runs once per slot, when the slot
//! starts.

use std::io::{BufRead, Write};
use std::sync::{mpsc, Arc};
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{error, info, warn};

use super::bootstrap::{
    InitializedHook, Initializer, PipelineBootstrap, PipelineRegistry, RemoteError,
};
use super::{CancellationToken, TIMEOUT_DELAY};
use crate::schemas::{PipelineMessage, PipelineResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    #[default]
    Thread,
    Process,
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub worker_type: WorkerType,
    pub worker_concurrency: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::default(),
            worker_concurrency: default_concurrency(),
        }
    }
}

/// Stdio protocol of a process slot.
#[derive(Debug, Serialize, Deserialize)]
pub struct SlotRequest {
    pub message: PipelineMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlotResponse {
    pub result: Result<PipelineResults, RemoteError>,
}

struct ThreadJob {
    message: PipelineMessage,
    token: CancellationToken,
    reply: oneshot::Sender<Result<PipelineResults, RemoteError>>,
}

enum PoolKind {
    Thread {
        jobs: parking_lot::Mutex<Option<mpsc::Sender<ThreadJob>>>,
    },
    Process {
        slots: Mutex<Vec<ProcessSlot>>,
    },
}

/// A fixed-size pool of execution slots.
pub struct ExecutionPool {
    kind: PoolKind,
    concurrency: usize,
    permits: Arc<Semaphore>,
}

impl ExecutionPool {
    pub fn start(
        options: &PoolOptions,
        registry: PipelineRegistry,
        initializers: Vec<Initializer>,
    ) -> std::io::Result<Self> {
        let concurrency = options.worker_concurrency.max(1);
        let kind = match options.worker_type {
            WorkerType::Thread => {
                let (job_tx, job_rx) = mpsc::channel::<ThreadJob>();
                let job_rx = Arc::new(parking_lot::Mutex::new(job_rx));
                for slot in 0..concurrency {
                    let job_rx = job_rx.clone();
                    let registry = registry.clone();
                    let initializers = initializers.clone();
                    thread::Builder::new()
                        .name(format!("conveyor-slot-{}", slot))
                        .spawn(move || thread_slot(registry, initializers, job_rx))?;
                }
                info!(slots = concurrency, "Thread pool started");
                PoolKind::Thread {
                    jobs: parking_lot::Mutex::new(Some(job_tx)),
                }
            }
            WorkerType::Process => {
                let mut slots = Vec::with_capacity(concurrency);
                for _ in 0..concurrency {
                    slots.push(ProcessSlot::spawn()?);
                }
                info!(slots = concurrency, "Process pool started");
                PoolKind::Process {
                    slots: Mutex::new(slots),
                }
            }
        };
        Ok(Self {
            kind,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs one message on a free slot. Resolves with the pipeline results
    /// or the remote failure; for process slots a cancelled token reclaims
    /// the slot after the grace window.
    pub async fn submit(
        &self,
        message: PipelineMessage,
        token: CancellationToken,
    ) -> Result<PipelineResults, RemoteError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::new("PoolClosed", "Execution pool is shut down"))?;

        match &self.kind {
            PoolKind::Thread { jobs } => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sender = jobs
                    .lock()
                    .clone()
                    .ok_or_else(|| RemoteError::new("PoolClosed", "Execution pool is shut down"))?;
                sender
                    .send(ThreadJob {
                        message,
                        token,
                        reply: reply_tx,
                    })
                    .map_err(|_| RemoteError::new("PoolClosed", "Execution pool is shut down"))?;
                reply_rx
                    .await
                    .map_err(|_| RemoteError::new("SlotFailed", "Worker slot died"))?
            }
            PoolKind::Process { slots } => {
                let mut slot = {
                    let mut slots = slots.lock().await;
                    match slots.pop() {
                        Some(slot) => slot,
                        None => ProcessSlot::spawn()
                            .map_err(|e| RemoteError::new("SlotFailed", e.to_string()))?,
                    }
                };

                let raced = {
                    let execute = slot.execute(&message);
                    tokio::pin!(execute);
                    tokio::select! {
                        response = &mut execute => Some(response),
                        _ = token.cancelled() => None,
                    }
                };
                let outcome = match raced {
                    Some(response) => response,
                    // Cancelled: grace window for the in-flight job, then
                    // the slot is killed and replaced.
                    None => match tokio::time::timeout(TIMEOUT_DELAY, slot.read_response()).await {
                        Ok(response) => response,
                        Err(_) => {
                            warn!("Process slot unresponsive after cancel, killing");
                            slot.kill().await;
                            match ProcessSlot::spawn() {
                                Ok(replacement) => slots.lock().await.push(replacement),
                                Err(e) => error!(error = %e, "Failed to respawn slot"),
                            }
                            return Err(RemoteError::new("Cancelled", "Job Cancelled"));
                        }
                    },
                };

                match outcome {
                    Ok(result) => {
                        slots.lock().await.push(slot);
                        result
                    }
                    Err(e) => {
                        slot.kill().await;
                        if let Ok(replacement) = ProcessSlot::spawn() {
                            slots.lock().await.push(replacement);
                        }
                        Err(RemoteError::new("SlotFailed", e.to_string()))
                    }
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        match &self.kind {
            PoolKind::Thread { jobs } => {
                jobs.lock().take();
            }
            PoolKind::Process { slots } => {
                for mut slot in slots.lock().await.drain(..) {
                    slot.kill().await;
                }
            }
        }
    }
}

/// Rebuilds the initialized hook on the slot's side of the executor
/// boundary; the hook cannot be shipped across it, only its handlers.
fn slot_initialized_hook(initializers: &[Initializer]) -> InitializedHook {
    let hook = InitializedHook::new("executor_initialized");
    for initializer in initializers {
        hook.register_handler(initializer.clone());
    }
    hook
}

fn thread_slot(
    registry: PipelineRegistry,
    initializers: Vec<Initializer>,
    jobs: Arc<parking_lot::Mutex<mpsc::Receiver<ThreadJob>>>,
) {
    let bootstrap = PipelineBootstrap::new(registry, &slot_initialized_hook(&initializers));
    loop {
        let job = {
            let receiver = jobs.lock();
            receiver.recv()
        };
        let Ok(job) = job else {
            return;
        };
        let result = bootstrap.bootstrap_pipeline(&job.message, &job.token);
        // The submitter may have given up on a cancelled job already.
        let _ = job.reply.send(result);
    }
}

struct ProcessSlot {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessSlot {
    fn spawn() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("pipeline-slot")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "slot stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "slot stdout unavailable")
        })?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn execute(
        &mut self,
        message: &PipelineMessage,
    ) -> std::io::Result<Result<PipelineResults, RemoteError>> {
        let mut line = serde_json::to_vec(&SlotRequest {
            message: message.clone(),
        })?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        self.read_response().await
    }

    async fn read_response(
        &mut self,
    ) -> std::io::Result<Result<PipelineResults, RemoteError>> {
        match self.stdout.next_line().await? {
            Some(line) => {
                let response: SlotResponse = serde_json::from_str(&line)?;
                Ok(response.result)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "slot exited",
            )),
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Entry point of the `pipeline-slot` subcommand: serves slot requests from
/// stdin until it closes. Runs synchronously; the parent owns scheduling.
pub fn run_slot(registry: PipelineRegistry, initializers: Vec<Initializer>) -> std::io::Result<()> {
    let bootstrap = PipelineBootstrap::new(registry, &slot_initialized_hook(&initializers));
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<SlotRequest>(&line) {
            Ok(request) => {
                bootstrap.bootstrap_pipeline(&request.message, &CancellationToken::new())
            }
            Err(e) => Err(RemoteError::new("InvalidRequest", e.to_string())),
        };
        let mut response = serde_json::to_vec(&SlotResponse { result })?;
        response.push(b'\n');
        let mut out = stdout.lock();
        out.write_all(&response)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::bootstrap::{PipelineContext, PipelineOutcome};
    use crate::schemas::{PipelineInfo, PipelineResult, TopicMessage};
    use std::collections::HashMap;

    fn echo_registry() -> PipelineRegistry {
        let registry = PipelineRegistry::new();
        registry.register("echo", |ctx: PipelineContext| {
            Ok(PipelineOutcome::Single(PipelineResult::Message(
                ctx.message,
            )))
        });
        registry
    }

    fn message(id: &str) -> PipelineMessage {
        PipelineMessage::new(
            PipelineInfo {
                name: "echo".into(),
                resources: HashMap::new(),
            },
            TopicMessage::new(id, HashMap::new()),
        )
    }

    #[tokio::test]
    async fn test_thread_pool_executes() {
        let pool = ExecutionPool::start(
            &PoolOptions {
                worker_type: WorkerType::Thread,
                worker_concurrency: 2,
            },
            echo_registry(),
            Vec::new(),
        )
        .unwrap();

        let results = pool
            .submit(message("0"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.outputs[0].message.id, "0");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_initializer_runs_per_slot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        let initializer: Initializer = Arc::new(move |_: &PipelineBootstrap| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let pool = ExecutionPool::start(
            &PoolOptions {
                worker_type: WorkerType::Thread,
                worker_concurrency: 3,
            },
            echo_registry(),
            vec![initializer],
        )
        .unwrap();

        // Initializers run as the slots start.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(inits.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_rejects_after_shutdown() {
        let pool = ExecutionPool::start(&PoolOptions::default(), echo_registry(), Vec::new())
            .unwrap();
        pool.shutdown().await;

        let err = pool
            .submit(message("0"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, "PoolClosed");
    }
}
