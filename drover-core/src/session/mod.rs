mod chromium;
mod engine;

pub use chromium::{ChromiumLauncher, ChromiumSession};
pub use engine::{EngineError, EngineLauncher, EngineResult, SessionEngine};
