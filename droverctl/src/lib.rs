use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use drover_core::{
    load_browser_config, load_drover_config, ChromiumLauncher, ConfigBundle, FailureReport,
    Orchestrator, Task, TaskResult,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] drover_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] drover_core::TelemetryError),
    #[error("invalid tasks file {path}: {reason}")]
    InvalidTasksFile { path: PathBuf, reason: String },
    #[error("configuration check failed")]
    ConfigCheckFailed,
    #[error("{failed} task(s) did not complete")]
    TasksFailed { failed: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drover command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main drover.toml
    #[arg(long, default_value = "configs/drover.toml")]
    pub config: PathBuf,
    /// Alternate path for browser.toml
    #[arg(long)]
    pub browser_config: Option<PathBuf>,
    /// Alternate path for the attempts database
    #[arg(long)]
    pub attempts_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a batch of tasks, drain, and report the outcomes
    Run(RunArgs),
    /// Summarize recorded attempts
    Status(StatusArgs),
    /// Configuration file operations
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of task specs
    #[arg(long)]
    pub tasks: PathBuf,
    /// Override the configured worker count
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Number of recent attempts to list
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate that the configuration bundle parses
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Run(args) => {
            let bundle = load_bundle(&cli)?;
            let report = run_batch(&bundle, args)?;
            render(&report, cli.format)?;
            if !report.failures.is_empty() {
                return Err(AppError::TasksFailed {
                    failed: report.failures.len(),
                });
            }
            Ok(())
        }
        Commands::Status(args) => {
            let db_path = attempts_db_path(&cli)?;
            let report = query_status(&db_path, args.limit)?;
            render(&report, cli.format)
        }
        Commands::Config(ConfigCommands::Check) => {
            let report = check_configs(&cli);
            render(&report, cli.format)?;
            if report.entries.iter().any(|entry| !entry.ok) {
                return Err(AppError::ConfigCheckFailed);
            }
            Ok(())
        }
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                "droverctl",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn browser_config_path(cli: &Cli) -> PathBuf {
    cli.browser_config.clone().unwrap_or_else(|| {
        let config_dir = cli
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("browser.toml")
    })
}

fn load_bundle(cli: &Cli) -> Result<ConfigBundle> {
    let drover = load_drover_config(&cli.config)?;
    let browser = load_browser_config(browser_config_path(cli))?;
    Ok(ConfigBundle { drover, browser })
}

fn attempts_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.attempts_db {
        return Ok(path.clone());
    }
    let drover = load_drover_config(&cli.config)?;
    Ok(PathBuf::from(drover.observability.attempts_db))
}

pub fn read_tasks(path: &Path) -> Result<Vec<Task>> {
    let file = File::open(path).map_err(|err| AppError::InvalidTasksFile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| AppError::InvalidTasksFile {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn run_batch(bundle: &ConfigBundle, args: &RunArgs) -> Result<RunReport> {
    let tasks = read_tasks(&args.tasks)?;
    let mut config = bundle.drover.clone();
    if let Some(concurrency) = args.concurrency {
        config.orchestrator.concurrency = concurrency;
    }
    let launcher = Arc::new(ChromiumLauncher::new(bundle.browser.clone()));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let orchestrator = Orchestrator::builder(config, launcher).start().await?;

        let mut submitted = 0usize;
        let mut rejected = Vec::new();
        for task in tasks {
            let task_id = task.id.clone();
            match orchestrator.submit(task) {
                Ok(()) => submitted += 1,
                Err(err) => rejected.push(RejectedTask {
                    task_id,
                    reason: err.to_string(),
                }),
            }
        }

        let drained = orchestrator.drain().await;
        Ok(RunReport {
            submitted,
            completed: drained.results.len(),
            failed: drained.failures.len(),
            degraded: orchestrator.is_degraded(),
            rejected,
            results: drained.results,
            failures: drained.failures,
        })
    })
}

pub fn query_status(db_path: &Path, limit: usize) -> Result<StatusReport> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let (attempts, successes): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM attempts",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut by_kind = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT failure_kind, COUNT(*) FROM attempts
             WHERE success = 0 AND failure_kind IS NOT NULL
             GROUP BY failure_kind ORDER BY COUNT(*) DESC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            by_kind.push(KindCount {
                kind: row.get(0)?,
                count: row.get(1)?,
            });
        }
    }

    let mut recent = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT task_id, success, failure_kind, finished_at FROM attempts
             ORDER BY ts DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        while let Some(row) = rows.next()? {
            recent.push(RecentAttempt {
                task_id: row.get(0)?,
                success: row.get::<_, i64>(1)? != 0,
                failure_kind: row.get(2)?,
                finished_at: row.get(3)?,
            });
        }
    }

    Ok(StatusReport {
        attempts,
        successes,
        failures: attempts - successes,
        by_kind,
        recent,
    })
}

fn check_configs(cli: &Cli) -> CheckReport {
    let mut entries = Vec::new();
    match load_drover_config(&cli.config) {
        Ok(config) => entries.push(CheckEntry {
            name: "drover.toml".into(),
            ok: true,
            detail: format!(
                "concurrency={} pool={}..{} max_attempts={}",
                config.orchestrator.concurrency,
                config.pool.min_sessions,
                config.pool.max_sessions,
                config.retry.max_attempts
            ),
        }),
        Err(err) => entries.push(CheckEntry {
            name: "drover.toml".into(),
            ok: false,
            detail: err.to_string(),
        }),
    }
    match load_browser_config(browser_config_path(cli)) {
        Ok(config) => entries.push(CheckEntry {
            name: "browser.toml".into(),
            ok: true,
            detail: format!(
                "headless={} user_agents={}",
                config.chromium.headless,
                config.user_agents.pool.len()
            ),
        }),
        Err(err) => entries.push(CheckEntry {
            name: "browser.toml".into(),
            ok: false,
            detail: err.to_string(),
        }),
    }
    CheckReport { entries }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub degraded: bool,
    pub rejected: Vec<RejectedTask>,
    pub results: Vec<TaskResult>,
    pub failures: Vec<FailureReport>,
}

#[derive(Debug, Serialize)]
pub struct RejectedTask {
    pub task_id: String,
    pub reason: String,
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut out = format!(
            "submitted: {}\ncompleted: {}\nfailed: {}\n",
            self.submitted, self.completed, self.failed
        );
        if self.degraded {
            out.push_str("WARNING: session pool degraded during the run\n");
        }
        for rejected in &self.rejected {
            out.push_str(&format!(
                "rejected {}: {}\n",
                rejected.task_id, rejected.reason
            ));
        }
        for failure in &self.failures {
            out.push_str(&format!(
                "failed {} ({} after {} attempts): {}\n",
                failure.task_id, failure.kind, failure.attempts, failure.last_error
            ));
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub attempts: i64,
    pub successes: i64,
    pub failures: i64,
    pub by_kind: Vec<KindCount>,
    pub recent: Vec<RecentAttempt>,
}

#[derive(Debug, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct RecentAttempt {
    pub task_id: String,
    pub success: bool,
    pub failure_kind: Option<String>,
    pub finished_at: String,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut out = format!(
            "attempts: {} ({} ok, {} failed)\n",
            self.attempts, self.successes, self.failures
        );
        for entry in &self.by_kind {
            out.push_str(&format!("  {}: {}\n", entry.kind, entry.count));
        }
        if !self.recent.is_empty() {
            out.push_str("recent:\n");
            for attempt in &self.recent {
                let outcome = if attempt.success {
                    "ok".to_string()
                } else {
                    attempt
                        .failure_kind
                        .clone()
                        .unwrap_or_else(|| "failed".to_string())
                };
                out.push_str(&format!(
                    "  {} {} {}\n",
                    attempt.finished_at, attempt.task_id, outcome
                ));
            }
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub entries: Vec<CheckEntry>,
}

#[derive(Debug, Serialize)]
pub struct CheckEntry {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl DisplayFallback for CheckReport {
    fn display(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "{} {}: {}",
                    if entry.ok { "ok" } else { "ERROR" },
                    entry.name,
                    entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
