use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::TimeoutSection;
use crate::session::{EngineError, SessionEngine};

use super::error::FailureKind;
use super::task::{ReadyCondition, Task};

/// States of one attempt. Every attempt walks the full sequence; there
/// are no skips, and `Succeeded`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Pending,
    Navigating,
    AwaitingReady,
    Interacting,
    Extracting,
    Succeeded,
    Failed,
}

impl fmt::Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NavState::Pending => "pending",
            NavState::Navigating => "navigating",
            NavState::AwaitingReady => "awaiting_ready",
            NavState::Interacting => "interacting",
            NavState::Extracting => "extracting",
            NavState::Succeeded => "succeeded",
            NavState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-state deadlines. Exceeding one fails the attempt with a
/// `Timeout` kind instead of hanging the worker.
#[derive(Debug, Clone, Copy)]
pub struct StateTimeouts {
    pub navigate: Duration,
    pub ready: Duration,
    pub interact: Duration,
    pub extract: Duration,
}

impl From<&TimeoutSection> for StateTimeouts {
    fn from(section: &TimeoutSection) -> Self {
        Self {
            navigate: Duration::from_millis(section.navigate_ms),
            ready: Duration::from_millis(section.ready_ms),
            interact: Duration::from_millis(section.interact_ms),
            extract: Duration::from_millis(section.extract_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded { payload: Value },
    Failed { kind: FailureKind, detail: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded { .. })
    }
}

/// Drives one attempt of one task over a borrowed session:
/// `Pending → Navigating → AwaitingReady → Interacting → Extracting`
/// to a terminal outcome.
pub struct NavigationStateMachine<'a> {
    engine: &'a mut dyn SessionEngine,
    timeouts: StateTimeouts,
}

impl<'a> NavigationStateMachine<'a> {
    pub fn new(engine: &'a mut dyn SessionEngine, timeouts: StateTimeouts) -> Self {
        Self { engine, timeouts }
    }

    pub async fn drive(&mut self, task: &Task, default_ready: &ReadyCondition) -> AttemptOutcome {
        let mut state = NavState::Pending;

        state = self.enter(state, NavState::Navigating, task);
        match timeout(self.timeouts.navigate, self.engine.navigate(&task.target)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Self::fail(state, err),
            Err(_) => return Self::expire(state, self.timeouts.navigate),
        }

        state = self.enter(state, NavState::AwaitingReady, task);
        let condition = task.ready.as_ref().unwrap_or(default_ready);
        match timeout(
            self.timeouts.ready,
            self.engine.wait_for_ready(condition, self.timeouts.ready),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Self::fail(state, err),
            Err(_) => return Self::expire(state, self.timeouts.ready),
        }

        state = self.enter(state, NavState::Interacting, task);
        match timeout(
            self.timeouts.interact,
            self.engine.apply_interactions(&task.payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Self::fail(state, err),
            Err(_) => return Self::expire(state, self.timeouts.interact),
        }

        state = self.enter(state, NavState::Extracting, task);
        let payload = match timeout(self.timeouts.extract, self.engine.extract()).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => return Self::fail(state, err),
            Err(_) => return Self::expire(state, self.timeouts.extract),
        };
        if payload.is_null() {
            return AttemptOutcome::Failed {
                kind: FailureKind::ExtractionMalformed,
                detail: "extraction produced no payload".to_string(),
            };
        }

        trace!(task = %task.id, from = %state, to = %NavState::Succeeded, "state transition");
        AttemptOutcome::Succeeded { payload }
    }

    fn enter(&self, from: NavState, to: NavState, task: &Task) -> NavState {
        trace!(task = %task.id, from = %from, to = %to, "state transition");
        to
    }

    fn fail(state: NavState, err: EngineError) -> AttemptOutcome {
        let kind = err.failure_kind();
        debug!(state = %state, kind = %kind, error = %err, "attempt failed");
        AttemptOutcome::Failed {
            kind,
            detail: err.to_string(),
        }
    }

    fn expire(state: NavState, limit: Duration) -> AttemptOutcome {
        debug!(state = %state, ?limit, "state deadline exceeded");
        AttemptOutcome::Failed {
            kind: FailureKind::Timeout,
            detail: format!("{state} exceeded its {limit:?} deadline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::session::EngineResult;

    fn timeouts() -> StateTimeouts {
        StateTimeouts {
            navigate: Duration::from_millis(100),
            ready: Duration::from_millis(100),
            interact: Duration::from_millis(100),
            extract: Duration::from_millis(100),
        }
    }

    /// Scripted fake: each stage either succeeds, errors, or stalls past
    /// its deadline.
    #[derive(Default)]
    struct FakeEngine {
        navigate_error: Option<fn() -> EngineError>,
        stall_on_ready: bool,
        interact_error: Option<fn() -> EngineError>,
        extract_value: Option<Value>,
        interactions_seen: usize,
    }

    #[async_trait]
    impl SessionEngine for FakeEngine {
        async fn navigate(&mut self, _target: &str) -> EngineResult<()> {
            match self.navigate_error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn wait_for_ready(
            &mut self,
            _condition: &ReadyCondition,
            _timeout: Duration,
        ) -> EngineResult<()> {
            if self.stall_on_ready {
                sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }

        async fn apply_interactions(&mut self, _payload: &Value) -> EngineResult<()> {
            self.interactions_seen += 1;
            match self.interact_error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn extract(&mut self) -> EngineResult<Value> {
            Ok(self.extract_value.clone().unwrap_or(Value::Null))
        }

        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_walk_succeeds_with_payload() {
        let mut engine = FakeEngine {
            extract_value: Some(json!({"title": "hello"})),
            ..FakeEngine::default()
        };
        let task = Task::with_id("t-1", "https://example.com");
        let outcome = NavigationStateMachine::new(&mut engine, timeouts())
            .drive(&task, &ReadyCondition::Load)
            .await;
        match outcome {
            AttemptOutcome::Succeeded { payload } => {
                assert_eq!(payload["title"], "hello");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.interactions_seen, 1);
    }

    #[tokio::test]
    async fn navigation_error_maps_through_classifier() {
        let mut engine = FakeEngine {
            navigate_error: Some(|| EngineError::InvalidTarget("nope".into())),
            ..FakeEngine::default()
        };
        let task = Task::with_id("t-2", "nope");
        let outcome = NavigationStateMachine::new(&mut engine, timeouts())
            .drive(&task, &ReadyCondition::Load)
            .await;
        match outcome {
            AttemptOutcome::Failed { kind, .. } => {
                assert_eq!(kind, FailureKind::InvalidTarget);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Navigation failed: later stages must never run.
        assert_eq!(engine.interactions_seen, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_stall_fails_with_timeout_kind() {
        let mut engine = FakeEngine {
            stall_on_ready: true,
            ..FakeEngine::default()
        };
        let task = Task::with_id("t-3", "https://example.com");
        let outcome = NavigationStateMachine::new(&mut engine, timeouts())
            .drive(&task, &ReadyCondition::Selector("#app".into()))
            .await;
        match outcome {
            AttemptOutcome::Failed { kind, detail } => {
                assert_eq!(kind, FailureKind::Timeout);
                assert!(detail.contains("awaiting_ready"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_extraction_is_malformed() {
        let mut engine = FakeEngine::default();
        let task = Task::with_id("t-4", "https://example.com");
        let outcome = NavigationStateMachine::new(&mut engine, timeouts())
            .drive(&task, &ReadyCondition::Load)
            .await;
        match outcome {
            AttemptOutcome::Failed { kind, .. } => {
                assert_eq!(kind, FailureKind::ExtractionMalformed);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interaction_target_missing_is_non_transient() {
        let mut engine = FakeEngine {
            interact_error: Some(|| EngineError::InteractionTargetNotFound("#go".into())),
            extract_value: Some(json!(true)),
            ..FakeEngine::default()
        };
        let task = Task::with_id("t-5", "https://example.com");
        let outcome = NavigationStateMachine::new(&mut engine, timeouts())
            .drive(&task, &ReadyCondition::Load)
            .await;
        match outcome {
            AttemptOutcome::Failed { kind, .. } => {
                assert_eq!(kind, FailureKind::InvalidTarget);
                assert!(!kind.is_transient());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
