use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Orchestration-side settings, loaded from `drover.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DroverConfig {
    pub orchestrator: OrchestratorSection,
    pub pool: PoolSection,
    pub retry: RetrySection,
    pub timeouts: TimeoutSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    pub concurrency: usize,
    pub queue_capacity: Option<usize>,
    /// CSS selector that marks a page as ready. Absent means navigation
    /// settling is enough.
    pub ready_selector: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub acquire_timeout_ms: u64,
    pub launch_attempts: u32,
    pub launch_backoff_ms: u64,
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn launch_backoff(&self) -> Duration {
        Duration::from_millis(self.launch_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    pub navigate_ms: u64,
    pub ready_ms: u64,
    pub interact_ms: u64,
    pub extract_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub attempt_log: String,
    pub attempts_db: String,
}

/// Browser-engine settings, loaded from `browser.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub extraction: ExtractionSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub mute_audio: bool,
    pub lang: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionSection {
    /// JavaScript expression evaluated when a task carries no extract
    /// directive of its own. Must produce a JSON-serializable value.
    pub default_script: String,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub drover: DroverConfig,
    pub browser: BrowserConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> ConfigResult<Self> {
        let dir = dir.as_ref();
        let drover = load_drover_config(dir.join("drover.toml"))?;
        let browser = load_browser_config(dir.join("browser.toml"))?;
        Ok(Self { drover, browser })
    }
}

pub fn load_drover_config<P: AsRef<Path>>(path: P) -> ConfigResult<DroverConfig> {
    load_toml(path)
}

pub fn load_browser_config<P: AsRef<Path>>(path: P) -> ConfigResult<BrowserConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert!(bundle.drover.orchestrator.concurrency >= 1);
        assert!(bundle.drover.pool.max_sessions >= bundle.drover.pool.min_sessions);
        assert!(bundle.drover.retry.max_backoff_ms >= bundle.drover.retry.base_backoff_ms);
        assert!(bundle.browser.user_agents.pool.len() >= 2);
        assert!(!bundle.browser.extraction.default_script.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_drover_config("/nonexistent/drover.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert!(path.ends_with("drover.toml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
