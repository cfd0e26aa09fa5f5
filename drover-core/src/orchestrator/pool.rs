use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolSection;
use crate::session::{EngineLauncher, SessionEngine};

use super::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Healthy,
    Unhealthy,
}

/// One owned browser session. Lives in the pool's idle list between
/// attempts; at most one worker holds it at any instant.
pub struct BrowserSession {
    id: String,
    engine: Box<dyn SessionEngine>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

impl BrowserSession {
    fn new(engine: Box<dyn SessionEngine>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            engine,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    async fn close(mut self) {
        if let Err(err) = self.engine.close().await {
            debug!(session = %self.id, error = %err, "session close reported error");
        }
    }
}

/// Session handle lent to a worker. Carries the capacity permit so the
/// pool slot frees exactly when the session is released.
pub struct PooledSession {
    session: BrowserSession,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session.id)
            .finish()
    }
}

impl PooledSession {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn engine_mut(&mut self) -> &mut dyn SessionEngine {
        self.session.engine.as_mut()
    }
}

/// Bounded pool of browser sessions. Capacity is a semaphore sized to
/// `max_sessions`; idle sessions are reused, missing ones launched
/// lazily with bounded retries.
pub struct SessionPool {
    launcher: Arc<dyn EngineLauncher>,
    idle: Mutex<Vec<BrowserSession>>,
    capacity: Arc<Semaphore>,
    min_sessions: usize,
    acquire_timeout: Duration,
    launch_attempts: u32,
    launch_backoff: Duration,
    degraded: AtomicBool,
    closed: AtomicBool,
}

impl SessionPool {
    pub fn new(config: &PoolSection, launcher: Arc<dyn EngineLauncher>) -> Arc<Self> {
        let max_sessions = config.max_sessions.max(1);
        Arc::new(Self {
            launcher,
            idle: Mutex::new(Vec::with_capacity(max_sessions)),
            capacity: Arc::new(Semaphore::new(max_sessions)),
            min_sessions: config.min_sessions.min(max_sessions),
            acquire_timeout: config.acquire_timeout(),
            launch_attempts: config.launch_attempts.max(1),
            launch_backoff: config.launch_backoff(),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Pre-warms the pool to its minimum size. Best-effort: a launch
    /// failure leaves the pool degraded rather than aborting startup.
    pub async fn warm_up(&self) -> usize {
        let mut warmed = 0;
        for _ in 0..self.min_sessions {
            match self.launch_session().await {
                Ok(session) => {
                    self.idle.lock().unwrap().push(session);
                    warmed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "pre-warm stopped early");
                    break;
                }
            }
        }
        info!(warmed, min = self.min_sessions, "session pool warmed up");
        warmed
    }

    pub async fn acquire(&self) -> Result<PooledSession, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Terminated);
        }
        let permit = match timeout(
            self.acquire_timeout,
            Arc::clone(&self.capacity).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Terminated),
            Err(_) => return Err(PoolError::Exhausted(self.acquire_timeout)),
        };

        let idle = self.idle.lock().unwrap().pop();
        let session = match idle {
            Some(mut session) => {
                session.last_used_at = Utc::now();
                session
            }
            // Permit drops on error, freeing the slot for later acquires.
            None => self.launch_session().await?,
        };
        debug!(session = %session.id(), "session acquired");
        Ok(PooledSession {
            session,
            _permit: permit,
        })
    }

    /// Returns a session. Unhealthy sessions are destroyed; replacements
    /// are launched lazily by the next acquire that misses the idle list.
    pub async fn release(&self, pooled: PooledSession, health: SessionHealth) {
        let PooledSession {
            mut session,
            _permit,
        } = pooled;
        if health == SessionHealth::Healthy && !self.closed.load(Ordering::SeqCst) {
            session.last_used_at = Utc::now();
            debug!(session = %session.id(), "session returned to pool");
            self.idle.lock().unwrap().push(session);
        } else {
            info!(session = %session.id(), ?health, "destroying session");
            session.close().await;
        }
    }

    async fn launch_session(&self) -> Result<BrowserSession, PoolError> {
        let mut last_error = String::new();
        for attempt in 1..=self.launch_attempts {
            match self.launcher.launch().await {
                Ok(engine) => {
                    let session = BrowserSession::new(engine);
                    info!(session = %session.id(), attempt, "launched browser session");
                    return Ok(session);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "engine launch failed");
                    last_error = err.to_string();
                    if attempt < self.launch_attempts {
                        sleep(self.launch_backoff * attempt).await;
                    }
                }
            }
        }
        self.degraded.store(true, Ordering::SeqCst);
        Err(PoolError::LaunchFailed {
            attempts: self.launch_attempts,
            last_error,
        })
    }

    /// True once session creation has exhausted its launch retries.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn idle_sessions(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn launch_backoff(&self) -> Duration {
        self.launch_backoff
    }

    /// Destroys idle sessions and fails pending and future acquires.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.capacity.close();
        let sessions: Vec<_> = self.idle.lock().unwrap().drain(..).collect();
        for session in sessions {
            session.close().await;
        }
        info!("session pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    use crate::orchestrator::ReadyCondition;
    use crate::session::{EngineError, EngineResult};

    struct NullEngine;

    #[async_trait]
    impl SessionEngine for NullEngine {
        async fn navigate(&mut self, _target: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn wait_for_ready(
            &mut self,
            _condition: &ReadyCondition,
            _timeout: Duration,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn apply_interactions(&mut self, _payload: &Value) -> EngineResult<()> {
            Ok(())
        }

        async fn extract(&mut self) -> EngineResult<Value> {
            Ok(Value::Bool(true))
        }

        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
    }

    struct CountingLauncher {
        launches: AtomicUsize,
        fail: bool,
    }

    impl CountingLauncher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                fail,
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineLauncher for CountingLauncher {
        async fn launch(&self) -> EngineResult<Box<dyn SessionEngine>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::Launch("no executable".into()))
            } else {
                Ok(Box::new(NullEngine))
            }
        }
    }

    fn section(min: usize, max: usize) -> PoolSection {
        PoolSection {
            min_sessions: min,
            max_sessions: max,
            acquire_timeout_ms: 50,
            launch_attempts: 2,
            launch_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn acquire_reuses_released_session() {
        let launcher = CountingLauncher::new(false);
        let pool = SessionPool::new(&section(0, 2), Arc::clone(&launcher) as Arc<dyn EngineLauncher>);

        let first = pool.acquire().await.unwrap();
        let id = first.id().to_string();
        pool.release(first, SessionHealth::Healthy).await;

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(launcher.launches(), 1);
        pool.release(second, SessionHealth::Healthy).await;
    }

    #[tokio::test]
    async fn unhealthy_release_destroys_and_relaunches_lazily() {
        let launcher = CountingLauncher::new(false);
        let pool = SessionPool::new(&section(0, 2), Arc::clone(&launcher) as Arc<dyn EngineLauncher>);

        let first = pool.acquire().await.unwrap();
        let first_id = first.id().to_string();
        pool.release(first, SessionHealth::Unhealthy).await;
        assert_eq!(pool.idle_sessions(), 0);

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(launcher.launches(), 2);
        pool.release(second, SessionHealth::Healthy).await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_all_sessions_held() {
        let launcher = CountingLauncher::new(false);
        let pool = SessionPool::new(&section(0, 1), Arc::clone(&launcher) as Arc<dyn EngineLauncher>);

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        pool.release(held, SessionHealth::Healthy).await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_marks_pool_degraded() {
        let launcher = CountingLauncher::new(true);
        let pool = SessionPool::new(&section(1, 2), Arc::clone(&launcher) as Arc<dyn EngineLauncher>);

        assert_eq!(pool.warm_up().await, 0);
        assert!(pool.is_degraded());
        // Both configured attempts were spent before reporting failure.
        assert_eq!(launcher.launches(), 2);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::LaunchFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_acquires() {
        let launcher = CountingLauncher::new(false);
        let pool = SessionPool::new(&section(1, 2), Arc::clone(&launcher) as Arc<dyn EngineLauncher>);
        pool.warm_up().await;
        pool.shutdown().await;
        assert!(matches!(pool.acquire().await, Err(PoolError::Terminated)));
        assert_eq!(pool.idle_sessions(), 0);
    }
}
