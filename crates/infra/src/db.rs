//! SQLite database bootstrap shared by every queue participant.
//!
//! Each process (CLI invocation or worker) opens its own pool against the same
//! file. Coordination between processes happens only through the tables
//! created here.
//!
//! ## Error Mapping
//!
//! | SQLx error | Kind | QueueError |
//! |------------|------|------------|
//! | Database | check violation | `Validation` |
//! | Database | unique violation | `Storage` (callers that can name the id map it to `AlreadyExists`) |
//! | anything else | | `Storage` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use queuectl_core::{ConfigKey, QueueError, QueueResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          TEXT PRIMARY KEY,
        command     TEXT NOT NULL,
        state       TEXT NOT NULL
                    CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
        attempts    INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_retries INTEGER NOT NULL CHECK (max_retries >= 0),
        priority    INTEGER NOT NULL DEFAULT 0,
        run_at      TEXT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        last_error  TEXT NULL,
        last_rc     INTEGER NULL,
        stdout      TEXT NULL,
        stderr      TEXT NULL,
        worker_id   TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state_run_at ON jobs (state, run_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_priority_created_at ON jobs (priority DESC, created_at ASC)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id         TEXT PRIMARY KEY,
        pid        INTEGER NULL,
        status     TEXT NOT NULL
                   CHECK (status IN ('starting', 'running', 'stopping', 'stopped')),
        started_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// Handle to the queue database.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path` and bootstrap the schema.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let db = Self { pool, path };
        db.migrate().await?;
        debug!(path = %db.path.display(), "queue database ready");
        Ok(db)
    }

    async fn migrate(&self) -> QueueResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }

        for key in ConfigKey::ALL {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(key.as_str())
                .bind(key.default_value())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("seed_config", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path.display(), "queue database closed");
    }
}

/// `<platform data dir>/queuectl/queue.db`.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("queuectl").join("queue.db"))
}

/// Fixed-width UTC timestamp; lexical order equals chronological order.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(column: &str, raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| QueueError::storage(format!("bad timestamp in {column}: {raw:?}: {e}")))
}

/// Map SQLx errors to `QueueError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.kind() {
                ErrorKind::CheckViolation => QueueError::Validation(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::storage(format!("connection pool closed in {operation}"))
        }
        other => QueueError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
