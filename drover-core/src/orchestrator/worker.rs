use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::telemetry::AttemptLog;

use super::error::{FailureKind, PoolError};
use super::pool::{SessionHealth, SessionPool};
use super::queue::TaskQueue;
use super::retry::{RetryDecision, RetryPolicy};
use super::state::{AttemptOutcome, NavigationStateMachine, StateTimeouts};
use super::task::{AttemptRecord, FailureReport, ReadyCondition, Task, TaskResult};
use super::OutcomeLedger;

/// One worker loop: claim a task, borrow a session, drive the state
/// machine, settle the outcome. All coordination goes through the queue,
/// the pool, and the shutdown signal.
pub(crate) struct Worker {
    pub id: usize,
    pub queue: Arc<TaskQueue>,
    pub pool: Arc<SessionPool>,
    pub retry: RetryPolicy,
    pub timeouts: StateTimeouts,
    pub default_ready: ReadyCondition,
    pub ledger: Arc<OutcomeLedger>,
    pub attempts: Arc<AttemptLog>,
    pub shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) async fn run(self) {
        debug!(worker = self.id, "worker started");
        loop {
            // Observe shutdown through an independent receiver so the
            // select! branches that call `&self` methods (e.g. cancel)
            // don't collide with the mutable borrow `wait_for` needs.
            let mut shutdown = self.shutdown.clone();
            let task = tokio::select! {
                task = self.queue.dequeue() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            let mut pooled = tokio::select! {
                acquired = self.pool.acquire() => match acquired {
                    Ok(session) => session,
                    Err(err @ PoolError::Exhausted(_)) => {
                        warn!(worker = self.id, task = %task.id, error = %err, "requeueing task unchanged");
                        self.queue.requeue_front(task);
                        continue;
                    }
                    Err(err @ PoolError::LaunchFailed { .. }) => {
                        warn!(worker = self.id, task = %task.id, error = %err, "pool degraded; requeueing task");
                        self.queue.requeue_front(task);
                        sleep(self.pool.launch_backoff()).await;
                        continue;
                    }
                    Err(PoolError::Terminated) => {
                        self.cancel(task, "session pool terminated");
                        break;
                    }
                },
                // Drop the watch guard inside the branch so the select's
                // output stays `Send` across the backoff await above.
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    self.cancel(task, "orchestrator shut down");
                    break;
                }
            };

            let attempt_number = task.attempt + 1;
            let started_at = Utc::now();
            let session_id = pooled.id().to_string();
            debug!(
                worker = self.id,
                task = %task.id,
                attempt = attempt_number,
                session = %session_id,
                "attempt started"
            );

            let outcome = {
                let timeouts = self.timeouts;
                let drive = async {
                    NavigationStateMachine::new(pooled.engine_mut(), timeouts)
                        .drive(&task, &self.default_ready)
                        .await
                };
                tokio::select! {
                    outcome = drive => outcome,
                    _ = shutdown.wait_for(|stop| *stop) => AttemptOutcome::Failed {
                        kind: FailureKind::Cancelled,
                        detail: "shutdown interrupted the attempt".to_string(),
                    },
                }
            };

            let (success, failure_kind, error_detail) = match &outcome {
                AttemptOutcome::Succeeded { .. } => (true, None, None),
                AttemptOutcome::Failed { kind, detail } => (false, Some(*kind), Some(detail.clone())),
            };
            if let Err(err) = self.attempts.record(&AttemptRecord {
                task_id: task.id.clone(),
                session_id,
                started_at,
                finished_at: Utc::now(),
                success,
                failure_kind,
                error_detail,
            }) {
                warn!(error = %err, "failed to record attempt");
            }

            match outcome {
                AttemptOutcome::Succeeded { payload } => {
                    self.pool.release(pooled, SessionHealth::Healthy).await;
                    info!(task = %task.id, attempts = attempt_number, "task completed");
                    self.ledger.complete(TaskResult {
                        task_id: task.id.clone(),
                        payload,
                        attempts: attempt_number,
                    });
                    self.queue.task_done();
                }
                AttemptOutcome::Failed {
                    kind: FailureKind::Cancelled,
                    detail,
                } => {
                    // Interrupted attempts leave the session in an unknown
                    // state; destroy it.
                    self.pool.release(pooled, SessionHealth::Unhealthy).await;
                    info!(task = %task.id, "attempt cancelled");
                    self.ledger.fail(FailureReport {
                        task_id: task.id,
                        kind: FailureKind::Cancelled,
                        attempts: attempt_number,
                        last_error: detail,
                    });
                    self.queue.task_done();
                    break;
                }
                AttemptOutcome::Failed { kind, detail } => {
                    let health = if kind == FailureKind::SessionCrashed {
                        SessionHealth::Unhealthy
                    } else {
                        SessionHealth::Healthy
                    };
                    self.pool.release(pooled, health).await;
                    match self.retry.decide(attempt_number, kind) {
                        RetryDecision::Retry { delay } => {
                            debug!(
                                task = %task.id,
                                kind = %kind,
                                attempt = attempt_number,
                                ?delay,
                                "scheduling retry"
                            );
                            let mut next = task;
                            next.attempt = attempt_number;
                            self.schedule_retry(next, delay);
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                task = %task.id,
                                kind = %kind,
                                attempts = attempt_number,
                                "task failed permanently"
                            );
                            self.ledger.fail(FailureReport {
                                task_id: task.id,
                                kind,
                                attempts: attempt_number,
                                last_error: detail,
                            });
                            self.queue.task_done();
                        }
                    }
                }
            }
        }
        debug!(worker = self.id, "worker stopped");
    }

    fn cancel(&self, task: Task, detail: &str) {
        info!(task = %task.id, detail, "task cancelled before an attempt started");
        self.ledger.fail(FailureReport {
            task_id: task.id,
            kind: FailureKind::Cancelled,
            attempts: task.attempt,
            last_error: detail.to_string(),
        });
        self.queue.task_done();
    }

    /// Re-enters the task after its backoff delay. The sleep is raced
    /// against shutdown so a pending retry can never strand a task
    /// without a terminal outcome.
    fn schedule_retry(&self, task: Task, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let ledger = Arc::clone(&self.ledger);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => queue.requeue(task),
                _ = shutdown.wait_for(|stop| *stop) => {
                    ledger.fail(FailureReport {
                        task_id: task.id.clone(),
                        kind: FailureKind::Cancelled,
                        attempts: task.attempt,
                        last_error: "orchestrator shut down during retry backoff".to_string(),
                    });
                    queue.task_done();
                }
            }
        });
    }
}
