use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::orchestrator::{FailureKind, ReadyCondition};

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level failures, classified at the seam so the orchestration
/// core never inspects engine-specific error text.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("readiness condition not met: {0}")]
    Ready(String),
    #[error("interaction failed: {0}")]
    Interaction(String),
    #[error("interaction target not found: {0}")]
    InteractionTargetNotFound(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("engine operation timed out: {0}")]
    Timeout(String),
    #[error("session crashed: {0}")]
    Crashed(String),
}

impl EngineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Launch(_) | EngineError::Crashed(_) => FailureKind::SessionCrashed,
            EngineError::Navigation(_) | EngineError::Interaction(_) => {
                FailureKind::NavigationInterrupted
            }
            EngineError::InvalidTarget(_) | EngineError::InteractionTargetNotFound(_) => {
                FailureKind::InvalidTarget
            }
            EngineError::Ready(_) | EngineError::Timeout(_) => FailureKind::Timeout,
            EngineError::Extraction(_) => FailureKind::ExtractionMalformed,
        }
    }
}

/// Capability surface of one browser session. The orchestration core is
/// written against this trait so tests run on in-memory fakes.
#[async_trait]
pub trait SessionEngine: Send {
    async fn navigate(&mut self, target: &str) -> EngineResult<()>;

    async fn wait_for_ready(
        &mut self,
        condition: &ReadyCondition,
        timeout: Duration,
    ) -> EngineResult<()>;

    /// Applies the task's opaque interaction payload. The payload shape is
    /// an engine concern; `Null` means no interactions.
    async fn apply_interactions(&mut self, payload: &Value) -> EngineResult<()>;

    /// Produces the extraction payload. `Null` is treated as malformed by
    /// the state machine.
    async fn extract(&mut self) -> EngineResult<Value>;

    async fn close(&mut self) -> EngineResult<()>;
}

/// Factory for sessions, owned by the pool.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> EngineResult<Box<dyn SessionEngine>>;
}
