use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::FailureKind;

pub type TaskId = String;

/// What "the page is ready" means for a task. `Load` is satisfied once
/// navigation settles; `Selector` additionally requires the given CSS
/// selector to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyCondition {
    Load,
    Selector(String),
}

/// One unit of work: navigate to `target`, run the interaction `payload`,
/// extract a result. Immutable after submission except for `attempt`,
/// which increments on every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "generated_id")]
    pub id: TaskId,
    pub target: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ready: Option<ReadyCondition>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn generated_id() -> TaskId {
    Uuid::new_v4().to_string()
}

impl Task {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_id(generated_id(), target)
    }

    pub fn with_id(id: impl Into<TaskId>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            payload: Value::Null,
            ready: None,
            priority: 0,
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn ready(mut self, condition: ReadyCondition) -> Self {
        self.ready = Some(condition);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Terminal success. Produced exactly once per task that completes.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub payload: Value,
    pub attempts: u32,
}

/// Terminal failure. Produced exactly once per task that exhausts its
/// retries, hits a non-retryable failure, or is cancelled.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub kind: FailureKind,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Completed(TaskResult),
    Failed(FailureReport),
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Completed(result) => &result.task_id,
            TaskOutcome::Failed(report) => &report.task_id,
        }
    }
}

/// Append-only record of one attempt, written on terminal exit of the
/// navigation state machine.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub task_id: TaskId,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub failure_kind: Option<FailureKind>,
    pub error_detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_gets_unique_id() {
        let a = Task::new("https://example.com");
        let b = Task::new("https://example.com");
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempt, 0);
    }

    #[test]
    fn ready_condition_round_trips_through_json() {
        let task = Task::with_id("t-1", "https://example.com")
            .ready(ReadyCondition::Selector("#content".into()))
            .priority(5);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ready, Some(ReadyCondition::Selector("#content".into())));
        assert_eq!(back.priority, 5);
    }

    #[test]
    fn task_spec_defaults_apply() {
        let task: Task = serde_json::from_str(
            r#"{"id": "t-2", "target": "https://example.com/page"}"#,
        )
        .unwrap();
        assert_eq!(task.priority, 0);
        assert!(task.payload.is_null());
        assert!(task.ready.is_none());
    }

    #[test]
    fn missing_id_gets_generated() {
        let task: Task =
            serde_json::from_str(r#"{"target": "https://example.com/page"}"#).unwrap();
        assert!(!task.id.is_empty());
    }
}
