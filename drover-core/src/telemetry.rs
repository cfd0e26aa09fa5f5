use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use crate::orchestrator::AttemptRecord;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only attempt journal: one JSON line per attempt for tailing,
/// plus a SQLite table for aggregation (`droverctl status`).
#[derive(Debug)]
pub struct AttemptLog {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AttemptLog {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let log = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        log.initialize_db()?;
        Ok(log)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS attempts (
                 ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                 task_id TEXT NOT NULL,
                 session_id TEXT NOT NULL,
                 started_at TEXT NOT NULL,
                 finished_at TEXT NOT NULL,
                 success INTEGER NOT NULL,
                 failure_kind TEXT,
                 error_detail TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id);
             CREATE INDEX IF NOT EXISTS idx_attempts_ts ON attempts(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record(&self, record: &AttemptRecord) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(record)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO attempts (
                task_id, session_id, started_at, finished_at, success, failure_kind, error_detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.task_id,
                record.session_id,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
                if record.success { 1 } else { 0 },
                record.failure_kind.map(|kind| kind.as_str()),
                record.error_detail,
            ],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::orchestrator::FailureKind;

    #[test]
    fn attempt_log_dual_writes() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("attempts.jsonl");
        let db_path = dir.path().join("attempts.sqlite");
        let log = AttemptLog::new(&log_path, &db_path).unwrap();

        let now = Utc::now();
        log.record(&AttemptRecord {
            task_id: "t-1".into(),
            session_id: "s-1".into(),
            started_at: now,
            finished_at: now,
            success: false,
            failure_kind: Some(FailureKind::Timeout),
            error_detail: Some("navigate exceeded deadline".into()),
        })
        .unwrap();
        log.record(&AttemptRecord {
            task_id: "t-1".into(),
            session_id: "s-1".into(),
            started_at: now,
            finished_at: now,
            success: true,
            failure_kind: None,
            error_detail: None,
        })
        .unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("navigate exceeded deadline"));

        let conn = Connection::open(&db_path).unwrap();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 2);
        let failures: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attempts WHERE success = 0 AND failure_kind = 'timeout'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(failures, 1);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let log = AttemptLog::new(
            dir.path().join("logs/attempts.jsonl"),
            dir.path().join("data/attempts.sqlite"),
        );
        assert!(log.is_ok());
    }
}
