//! Per-queue workers and their manager.

use crate::definition::JobDefinition;
use crate::engine::{JobHandle, JobRecord};
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;
use crate::job::JobContext;
use crate::manager::QueueManager;
use crate::metrics::{JobMetrics, WorkerMetrics};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Pause after the engine fails a fetch.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of the worker bound to one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Jobs completed.
    pub processed: u64,
    /// Failed attempts, retried or not.
    pub errored: u64,
    /// Jobs that failed for good.
    pub failed: u64,
    /// Jobs executing right now.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    errored: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
}

struct Runtime {
    id: String,
    queue: String,
    concurrency: usize,
    block_timeout: Duration,
    shutdown_timeout: Duration,
    manager: QueueManager,
    state: RwLock<WorkerState>,
    counters: Counters,
}

impl Runtime {
    fn state(&self) -> WorkerState {
        *self.state.read()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            errored: self.counters.errored.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<bool>) {
        info!(
            worker_id = %self.id,
            queue = %self.queue,
            concurrency = self.concurrency,
            "Worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        let force = loop {
            tokio::select! {
                signal = shutdown_rx.recv() => break signal.unwrap_or(false),

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(worker_id = %self.id, error = %e, "Job task ended abnormally");
                    }
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break false };
                    let token = Uuid::new_v4().to_string();

                    tokio::select! {
                        signal = shutdown_rx.recv() => break signal.unwrap_or(false),

                        fetched = self.manager.engine().fetch_next(&self.queue, &token, self.block_timeout) => {
                            match fetched {
                                Ok(Some(record)) => {
                                    let runtime = self.clone();
                                    in_flight.spawn(async move {
                                        runtime.process(record, token).await;
                                        drop(permit);
                                    });
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!(queue = %self.queue, error = %e, "Failed to fetch job");
                                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                                }
                            }
                        }
                    }
                }
            }
        };

        self.set_state(WorkerState::Draining);
        info!(worker_id = %self.id, force, in_flight = in_flight.len(), "Worker draining");

        if force {
            in_flight.abort_all();
        } else {
            let drained = timeout(self.shutdown_timeout, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    worker_id = %self.id,
                    remaining = in_flight.len(),
                    "Shutdown timeout reached, abandoning in-flight jobs"
                );
                in_flight.abort_all();
            }
        }
        while in_flight.join_next().await.is_some() {}

        self.set_state(WorkerState::Stopped);
        let stats = self.stats();
        info!(
            worker_id = %self.id,
            processed = stats.processed,
            failed = stats.failed,
            "Worker stopped"
        );
    }

    async fn process(self: Arc<Self>, record: JobRecord, token: String) {
        let _in_flight = InFlight::enter(&self);

        let span = info_span!(
            "job",
            job.name = %record.name,
            job.id = %record.id,
            queue = %record.queue,
            attempt = record.attempts_made + 1
        );
        self.execute(&record, &token, span.clone())
            .instrument(span)
            .await;
    }

    async fn execute(&self, record: &JobRecord, token: &str, span: Span) {
        let prepared = self
            .manager
            .registry()
            .resolve(&record.name)
            .and_then(|definition| definition.instantiate().map(|handler| (definition, handler)));

        let (definition, handler) = match prepared {
            Ok(pair) => pair,
            Err(e) => {
                self.reject(record, token, e).await;
                return;
            }
        };

        let handle = record.handle();
        let attempt = record.attempts_made + 1;
        let started = Instant::now();

        let data = if definition.is_encrypted() {
            self.manager.cipher().decrypt(&record.data)
        } else {
            Ok(record.data.clone())
        };

        let ctx = JobContext {
            data: data.as_ref().cloned().unwrap_or_else(|_| record.data.clone()),
            job: record.clone(),
            token: token.to_string(),
            attempt,
            span,
        };

        let result = match data {
            Ok(_) => {
                self.manager.bus().emit(JobEvent::Started(handle.clone()));
                JobMetrics::job_started(&record.queue, &record.name);
                debug!("Processing job");

                AssertUnwindSafe(handler.process(ctx.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(JobError::process(format!("job panicked: {}", panic_message(&panic))))
                    })
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => self.succeed(record, token, handle, value, started).await,
            Err(e) => {
                self.fail(&definition, record, token, handle, ctx, e, started)
                    .await
            }
        }
    }

    /// Resolution and instantiation errors skip the job hooks and go
    /// straight to the engine.
    async fn reject(&self, record: &JobRecord, token: &str, error: JobError) {
        error!(error = %error, kind = error.kind(), "Rejecting job");

        let retry = error.is_retryable() && record.attempts_made + 1 < record.max_attempts();
        if let Err(e) = self
            .manager
            .engine()
            .fail(record, token, &error.to_string(), retry)
            .await
        {
            error!(error = %e, "Failed to report rejected job");
        }

        if !retry {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn succeed(
        &self,
        record: &JobRecord,
        token: &str,
        handle: JobHandle,
        value: Value,
        started: Instant,
    ) {
        if let Err(e) = self
            .manager
            .engine()
            .complete(record, token, value.clone())
            .await
        {
            error!(error = %e, "Failed to mark job as complete");
            return;
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(&record.queue, &record.name, started.elapsed());
        info!(duration_ms = started.elapsed().as_millis() as u64, "Job completed");

        self.manager.bus().emit(JobEvent::Success {
            job: handle,
            result: value,
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        definition: &JobDefinition,
        record: &JobRecord,
        token: &str,
        handle: JobHandle,
        ctx: JobContext<Value>,
        error: JobError,
        started: Instant,
    ) {
        let engine = self.manager.engine();
        let attempt = record.attempts_made + 1;
        let already_finished = engine
            .get_job(&record.queue, &record.id)
            .await
            .ok()
            .flatten()
            .is_some_and(|current| current.is_finished());
        let is_final = error.is_terminal() || attempt >= record.max_attempts() || already_finished;

        self.counters.errored.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_errored(&record.queue, &record.name, error.kind(), started.elapsed());
        warn!(error = %error, kind = error.kind(), is_final, "Job attempt failed");

        self.manager.bus().emit(JobEvent::Error {
            job: handle.clone(),
            error: error.to_string(),
            attempt,
        });

        match definition.instantiate() {
            Ok(hook) => {
                if let Err(panic) = AssertUnwindSafe(hook.on_failed(ctx, &error))
                    .catch_unwind()
                    .await
                {
                    error!(panic = %panic_message(&panic), "Failure hook panicked");
                }
            }
            Err(e) => error!(error = %e, "Could not instantiate job for failure hook"),
        }

        if let Err(e) = engine.fail(record, token, &error.to_string(), !is_final).await {
            error!(error = %e, "Failed to mark job as failed");
        }

        if is_final {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_failed(&record.queue, &record.name);
            self.manager.bus().emit(JobEvent::Failed {
                job: handle,
                error: error.to_string(),
                attempts: attempt,
            });
        }
    }
}

/// Counts one execution as in flight until dropped, including on abort.
struct InFlight<'a>(&'a Runtime);

impl<'a> InFlight<'a> {
    fn enter(runtime: &'a Runtime) -> Self {
        let in_flight = runtime.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerMetrics::update(&runtime.queue, in_flight, runtime.concurrency);
        Self(runtime)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let in_flight = self.0.counters.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        WorkerMetrics::update(&self.0.queue, in_flight, self.0.concurrency);
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Worker {
    runtime: Arc<Runtime>,
    shutdown_tx: broadcast::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Starts and stops one worker per queue.
pub struct WorkerManager {
    manager: QueueManager,
    workers: Mutex<BTreeMap<String, Worker>>,
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("running", &self.running_queues())
            .finish_non_exhaustive()
    }
}

impl WorkerManager {
    pub fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every queue declared in configuration.
    pub fn list_queues(&self) -> Vec<String> {
        self.manager.queue_names()
    }

    /// Queues whose worker is currently running.
    pub fn running_queues(&self) -> Vec<String> {
        self.workers
            .lock()
            .iter()
            .filter(|(_, worker)| worker.runtime.state() == WorkerState::Running)
            .map(|(queue, _)| queue.clone())
            .collect()
    }

    /// State of the worker for `queue`.
    pub fn state(&self, queue: &str) -> WorkerState {
        self.workers
            .lock()
            .get(queue)
            .map(|worker| worker.runtime.state())
            .unwrap_or(WorkerState::Idle)
    }

    /// Counters of the worker for `queue`, if one was started.
    pub fn stats(&self, queue: &str) -> Option<WorkerStats> {
        self.workers
            .lock()
            .get(queue)
            .map(|worker| worker.runtime.stats())
    }

    /// Starts a worker for each queue; every declared queue when empty.
    ///
    /// All names are checked before anything starts.
    pub async fn start(&self, queues: &[String]) -> JobResult<()> {
        let selected: BTreeSet<String> = if queues.is_empty() {
            self.list_queues().into_iter().collect()
        } else {
            queues.iter().cloned().collect()
        };

        let settings = self.manager.queue_settings();
        if let Some(unknown) = selected.iter().find(|q| !settings.contains(q)) {
            return Err(JobError::Configuration(format!(
                "cannot start worker for undeclared queue '{}'",
                unknown
            )));
        }

        {
            let workers = self.workers.lock();
            if let Some(busy) = selected.iter().find(|q| {
                workers.get(q.as_str()).is_some_and(|w| {
                    matches!(w.runtime.state(), WorkerState::Running | WorkerState::Draining)
                })
            }) {
                return Err(JobError::Worker(format!(
                    "worker for queue '{}' already running",
                    busy
                )));
            }
        }

        let worker_settings = &self.manager.config().worker;
        for queue in selected {
            let global = self.manager.queue_global_concurrency(&queue);
            self.manager
                .engine()
                .set_global_concurrency(&queue, global)
                .await?;

            let runtime = Arc::new(Runtime {
                id: format!("{}-{}", queue, Uuid::new_v4()),
                concurrency: self.manager.queue_concurrency(&queue),
                block_timeout: worker_settings.block_timeout(),
                shutdown_timeout: worker_settings.shutdown_timeout(),
                queue: queue.clone(),
                manager: self.manager.clone(),
                state: RwLock::new(WorkerState::Running),
                counters: Counters::default(),
            });

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(runtime.clone().run(shutdown_rx));

            self.workers.lock().insert(
                queue,
                Worker {
                    runtime,
                    shutdown_tx,
                    handle: Some(handle),
                },
            );
        }

        Ok(())
    }

    /// Stops every worker.
    ///
    /// Graceful stop waits for in-flight jobs up to the configured shutdown
    /// timeout. Forced stop abandons them to the engine's stall recovery.
    pub async fn stop(&self, force: bool) -> JobResult<()> {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.lock();
            workers
                .iter_mut()
                .filter_map(|(queue, worker)| {
                    let handle = worker.handle.take()?;
                    worker.runtime.set_state(WorkerState::Draining);
                    let _ = worker.shutdown_tx.send(force);
                    Some((queue.clone(), handle))
                })
                .collect()
        };

        info!(workers = handles.len(), force, "Stopping workers");
        for (queue, handle) in handles {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "Worker task ended abnormally");
            }
        }
        Ok(())
    }

    /// Waits for Ctrl+C or SIGTERM, then stops gracefully.
    pub async fn wait_for_shutdown_signal(&self) -> JobResult<()> {
        shutdown_signal().await?;
        self.stop(false).await
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() -> JobResult<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| JobError::Worker(format!("failed to install Ctrl+C handler: {}", e)))
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| JobError::Worker(format!("failed to install signal handler: {}", e)))?
            .recv()
            .await;
        Ok::<(), JobError>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<JobResult<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            result
        }
        result = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
            result
        }
    }
}
