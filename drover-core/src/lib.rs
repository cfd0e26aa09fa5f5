pub mod config;
pub mod orchestrator;
pub mod session;
pub mod telemetry;

pub use config::{
    load_browser_config, load_drover_config, BrowserConfig, ConfigBundle, ConfigError,
    ConfigResult, DroverConfig,
};
pub use orchestrator::{
    AttemptRecord, DrainReport, FailureKind, FailureReport, Orchestrator, OrchestratorBuilder,
    PoolError, ReadyCondition, RetryDecision, RetryPolicy, SessionPool, SubmitError, Task, TaskId,
    TaskOutcome, TaskQueue, TaskResult,
};
pub use session::{ChromiumLauncher, EngineError, EngineLauncher, EngineResult, SessionEngine};
pub use telemetry::{AttemptLog, TelemetryError};
