pub mod error;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod state;
pub mod task;
mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DroverConfig;
use crate::session::EngineLauncher;
use crate::telemetry::{AttemptLog, TelemetryError};

pub use error::{FailureKind, PoolError, SubmitError};
pub use pool::{BrowserSession, PooledSession, SessionHealth, SessionPool};
pub use queue::TaskQueue;
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{AttemptOutcome, NavState, NavigationStateMachine, StateTimeouts};
pub use task::{
    AttemptRecord, FailureReport, ReadyCondition, Task, TaskId, TaskOutcome, TaskResult,
};

use worker::Worker;

const PROGRESS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Aggregated outcomes returned by `drain`/`shutdown`. Each call empties
/// the internal buffers, so a second call returns an empty report.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub results: Vec<TaskResult>,
    pub failures: Vec<FailureReport>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects terminal outcomes and forwards them to the optional push
/// sink. Workers are the only writers.
pub(crate) struct OutcomeLedger {
    results: Mutex<Vec<TaskResult>>,
    failures: Mutex<Vec<FailureReport>>,
    sink: Option<mpsc::UnboundedSender<TaskOutcome>>,
}

impl OutcomeLedger {
    fn new(sink: Option<mpsc::UnboundedSender<TaskOutcome>>) -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            sink,
        }
    }

    pub(crate) fn complete(&self, result: TaskResult) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(TaskOutcome::Completed(result.clone()));
        }
        self.results.lock().unwrap().push(result);
    }

    pub(crate) fn fail(&self, report: FailureReport) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(TaskOutcome::Failed(report.clone()));
        }
        self.failures.lock().unwrap().push(report);
    }
}

pub struct OrchestratorBuilder {
    config: DroverConfig,
    launcher: Arc<dyn EngineLauncher>,
    sink: Option<mpsc::UnboundedSender<TaskOutcome>>,
}

impl OrchestratorBuilder {
    pub fn new(config: DroverConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            config,
            launcher,
            sink: None,
        }
    }

    /// Push-model result delivery: every terminal outcome is sent here as
    /// it is produced, in addition to the pull-model `drain` batch.
    pub fn outcome_sink(mut self, sink: mpsc::UnboundedSender<TaskOutcome>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Opens the attempt log at the configured paths, then starts.
    pub async fn start(self) -> Result<Orchestrator, TelemetryError> {
        let attempts = Arc::new(AttemptLog::new(
            &self.config.observability.attempt_log,
            &self.config.observability.attempts_db,
        )?);
        Ok(self.start_with_log(attempts).await)
    }

    /// Starts against an existing attempt log: pre-warms the session pool
    /// and spawns the configured number of workers.
    pub async fn start_with_log(self, attempts: Arc<AttemptLog>) -> Orchestrator {
        let config = self.config;
        let queue = Arc::new(TaskQueue::new(config.orchestrator.queue_capacity));
        let pool = SessionPool::new(&config.pool, self.launcher);
        pool.warm_up().await;

        let default_ready = match &config.orchestrator.ready_selector {
            Some(selector) => ReadyCondition::Selector(selector.clone()),
            None => ReadyCondition::Load,
        };
        let ledger = Arc::new(OutcomeLedger::new(self.sink));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let retry = RetryPolicy::new(&config.retry);
        let timeouts = StateTimeouts::from(&config.timeouts);
        let concurrency = config.orchestrator.concurrency.max(1);

        let mut workers = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let worker = Worker {
                id,
                queue: Arc::clone(&queue),
                pool: Arc::clone(&pool),
                retry: retry.clone(),
                timeouts,
                default_ready: default_ready.clone(),
                ledger: Arc::clone(&ledger),
                attempts: Arc::clone(&attempts),
                shutdown: shutdown_rx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        spawn_progress_logger(
            Arc::clone(&queue),
            Arc::clone(&pool),
            shutdown_rx.clone(),
        );
        info!(concurrency, "orchestrator started");

        Orchestrator {
            queue,
            pool,
            ledger,
            shutdown_tx,
            workers: Mutex::new(workers),
            submitted: Mutex::new(HashSet::new()),
        }
    }
}

/// One status line per interval while work is outstanding. Stops on
/// shutdown or once the queue is closed and idle.
fn spawn_progress_logger(
    queue: Arc<TaskQueue>,
    pool: Arc<SessionPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PROGRESS_LOG_INTERVAL) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            let open = queue.open_tasks();
            if queue.is_closed() && open == 0 {
                break;
            }
            info!(
                queued = queue.len(),
                open,
                idle_sessions = pool.idle_sessions(),
                degraded = pool.is_degraded(),
                "orchestrator progress"
            );
        }
    });
}

/// Owns the queue, the pool, and the worker set. The only shared mutable
/// state between workers lives behind those two components.
pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    pool: Arc<SessionPool>,
    ledger: Arc<OutcomeLedger>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    submitted: Mutex<HashSet<TaskId>>,
}

impl Orchestrator {
    pub fn builder(config: DroverConfig, launcher: Arc<dyn EngineLauncher>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, launcher)
    }

    /// Validates and enqueues a task. Resubmitting an id that was already
    /// accepted is rejected as a duplicate, including after the first
    /// instance completed.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        if task.target.trim().is_empty() {
            return Err(SubmitError::InvalidTask);
        }
        {
            let mut seen = self.submitted.lock().unwrap();
            if !seen.insert(task.id.clone()) {
                return Err(SubmitError::Duplicate(task.id));
            }
        }
        let id = task.id.clone();
        match self.queue.enqueue(task) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Rejected submissions stay resubmittable.
                self.submitted.lock().unwrap().remove(&id);
                Err(err)
            }
        }
    }

    /// Closes the queue, waits for every open task (including scheduled
    /// retries) to settle, then tears down workers and sessions.
    pub async fn drain(&self) -> DrainReport {
        info!("drain requested; closing task queue");
        self.queue.close();
        self.queue.wait_idle().await;
        self.join_workers().await;
        self.pool.shutdown().await;
        self.collect_report()
    }

    /// Best-effort cancellation: in-flight attempts, pending retries, and
    /// never-started tasks all settle as `Cancelled` and are not retried.
    pub async fn shutdown(&self) -> DrainReport {
        info!("shutdown requested; cancelling in-flight work");
        self.queue.close();
        let _ = self.shutdown_tx.send(true);
        for task in self.queue.drain_remaining() {
            self.ledger.fail(FailureReport {
                task_id: task.id,
                kind: FailureKind::Cancelled,
                attempts: task.attempt,
                last_error: "orchestrator shut down before the task ran".to_string(),
            });
        }
        self.queue.wait_idle().await;
        self.join_workers().await;
        self.pool.shutdown().await;
        self.collect_report()
    }

    /// True once session creation has given up; tasks keep requeueing
    /// until capacity recovers or the operator shuts down.
    pub fn is_degraded(&self) -> bool {
        self.pool.is_degraded()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    async fn join_workers(&self) {
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker join failed");
            }
        }
    }

    fn collect_report(&self) -> DrainReport {
        DrainReport {
            results: std::mem::take(&mut *self.ledger.results.lock().unwrap()),
            failures: std::mem::take(&mut *self.ledger.failures.lock().unwrap()),
        }
    }
}
