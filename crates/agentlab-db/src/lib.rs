//! AgentLab persistence layer: the durable state behind the controller.
//!
//! This crate wraps a single-writer SQLite store (sqlx) holding sandboxes,
//! jobs, workspaces, sessions, exposures, one-shot bootstrap tokens, artifact
//! tokens, artifacts and the append-only event / message logs. Every
//! coordination primitive the controller relies on is expressed here as a
//! compare-and-swap `UPDATE ... WHERE <expected>` whose affected row count
//! tells the caller whether it won.

mod artifacts;
mod clock;
mod error;
mod events;
mod exposures;
mod ids;
mod jobs;
mod messages;
pub mod migrations;
mod sandboxes;
mod sessions;
mod snapshots;
mod tokens;
mod workspaces;

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use tracing::debug;

pub use artifacts::{ArtifactRecord, NewArtifact, RetentionRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DbError, DbResult};
pub use events::{EventRecord, EventScope, NewEvent};
pub use exposures::{ExposureRecord, NewExposure};
pub use ids::IdGenerator;
pub use jobs::{JobRecord, JobStatus, NewJob};
pub use messages::{MessageRecord, MessageScope, NewMessage};
pub use sandboxes::{NewSandbox, SandboxRecord, SandboxState};
pub use sessions::{NewSession, SessionRecord};
pub use snapshots::{NewWorkspaceSnapshot, WorkspaceSnapshotRecord};
pub use tokens::{hash_token, ArtifactTokenRecord, BootstrapTokenRecord};
pub use workspaces::{NewWorkspace, WorkspaceLease, WorkspaceRecord};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default and maximum page sizes for the cursor queries.
const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1_000;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl Database {
    /// Opens (or creates) the SQLite database at the given URL (e.g.
    /// `sqlite:///var/lib/agentlab/agentlab.db` or `sqlite::memory:`) and
    /// applies pending migrations.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        Self::connect_with_clock(database_url, Arc::new(SystemClock)).await
    }

    /// Same as [`Database::connect`] but with an explicit clock, used for
    /// `created_at` / `updated_at` bookkeeping.
    pub async fn connect_with_clock(database_url: &str, clock: Arc<dyn Clock>) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        // One connection: SQLite has a single writer anyway, and in-memory
        // databases only live as long as their connection.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let applied = migrations::run(&pool, clock.now()).await?;
        debug!(applied, "database migrations complete");

        Ok(Self { pool, clock })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> DbResult<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Connects to a file path with an explicit clock.
    pub async fn connect_file_with_clock(path: &Path, clock: Arc<dyn Clock>) -> DbResult<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect_with_clock(&url, clock).await
    }

    /// Exposes the underlying pool for reporting queries and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The clock used for row bookkeeping.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Closes the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Formats a timestamp the way every column stores it: RFC3339 with
/// nanoseconds and a `Z` suffix. The fixed width keeps lexical order equal to
/// chronological order, which the lease comparisons in SQL depend on.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(column: &'static str, value: String) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| DbError::Decode {
            column,
            reason: format!("invalid RFC3339 timestamp '{value}': {err}"),
        })
}

pub(crate) fn parse_optional_timestamp(
    column: &'static str,
    value: Option<String>,
) -> DbResult<Option<DateTime<Utc>>> {
    value.map(|raw| parse_timestamp(column, raw)).transpose()
}

pub(crate) fn parse_optional_json(
    column: &'static str,
    value: Option<String>,
) -> DbResult<Option<serde_json::Value>> {
    value
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| DbError::Decode {
                column,
                reason: err.to_string(),
            })
        })
        .transpose()
}

pub(crate) fn encode_optional_json(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|v| v.to_string())
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> DbResult<()> {
    if value.trim().is_empty() {
        return Err(DbError::validation(field, "must not be empty"));
    }
    Ok(())
}

pub(crate) fn require_positive_vmid(vmid: i64) -> DbResult<()> {
    if vmid <= 0 {
        return Err(DbError::validation("vmid", format!("must be positive, got {vmid}")));
    }
    Ok(())
}

/// Rejects the zero time and anything before the Unix epoch.
pub(crate) fn require_set_timestamp(field: &'static str, value: DateTime<Utc>) -> DbResult<()> {
    if value.timestamp() <= 0 {
        return Err(DbError::validation(field, "must be set"));
    }
    Ok(())
}

pub(crate) fn clamp_limit(limit: u32) -> i64 {
    match i64::from(limit) {
        0 => DEFAULT_LIST_LIMIT,
        n => n.min(MAX_LIST_LIMIT),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = early + chrono::Duration::nanoseconds(1);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(a, "2026-01-01T00:00:00.000000000Z");
        assert_eq!(parse_timestamp("ts", b).unwrap(), late);
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(0), DEFAULT_LIST_LIMIT);
        assert_eq!(clamp_limit(5), 5);
        assert_eq!(clamp_limit(50_000), MAX_LIST_LIMIT);
    }
}
