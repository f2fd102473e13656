//! Ordered, append-only schema migrations.
//!
//! Each entry is applied at most once inside its own transaction and recorded
//! in `schema_migrations`. New schema changes go at the end of [`MIGRATIONS`];
//! existing entries are never edited.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::{format_timestamp, DbError, DbResult};

/// A single schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_sandboxes_jobs_events",
        statements: &[
            r#"
            CREATE TABLE sandboxes (
                vmid INTEGER PRIMARY KEY CHECK (vmid > 0),
                name TEXT NOT NULL,
                profile TEXT NOT NULL,
                state TEXT NOT NULL,
                ip TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                "ref" TEXT NOT NULL,
                profile TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status <> ''),
                sandbox_vmid INTEGER REFERENCES sandboxes(vmid) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind <> ''),
                sandbox_vmid INTEGER,
                job_id TEXT,
                msg TEXT,
                json TEXT
            )
            "#,
            r#"
            CREATE TABLE bootstrap_tokens (
                token_hash TEXT PRIMARY KEY,
                vmid INTEGER NOT NULL REFERENCES sandboxes(vmid) ON DELETE CASCADE,
                expires_at TEXT NOT NULL,
                consumed_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        ],
    },
    Migration {
        version: 2,
        name: "create_workspaces",
        statements: &[
            r#"
            CREATE TABLE workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                storage TEXT NOT NULL,
                volume_id TEXT NOT NULL,
                size_gb INTEGER NOT NULL CHECK (size_gb > 0),
                attached_vmid INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "ALTER TABLE sandboxes ADD COLUMN workspace_id TEXT REFERENCES workspaces(id) ON DELETE SET NULL",
        ],
    },
    Migration {
        version: 3,
        name: "add_keepalive_and_job_options",
        statements: &[
            "ALTER TABLE sandboxes ADD COLUMN keepalive INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE sandboxes ADD COLUMN last_used_at TEXT",
            "ALTER TABLE jobs ADD COLUMN task TEXT",
            "ALTER TABLE jobs ADD COLUMN mode TEXT",
            "ALTER TABLE jobs ADD COLUMN ttl_minutes INTEGER",
            "ALTER TABLE jobs ADD COLUMN keepalive INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE jobs ADD COLUMN workspace_id TEXT REFERENCES workspaces(id) ON DELETE SET NULL",
            "ALTER TABLE jobs ADD COLUMN result_json TEXT",
        ],
    },
    Migration {
        version: 4,
        name: "create_artifacts",
        statements: &[
            r#"
            CREATE TABLE artifact_tokens (
                token_hash TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                vmid INTEGER,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )
            "#,
            r#"
            CREATE TABLE artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                vmid INTEGER,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL CHECK (size_bytes > 0),
                sha256 TEXT NOT NULL,
                mime TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        ],
    },
    Migration {
        version: 5,
        name: "create_exposures",
        statements: &[r#"
            CREATE TABLE exposures (
                name TEXT PRIMARY KEY,
                vmid INTEGER NOT NULL REFERENCES sandboxes(vmid) ON DELETE CASCADE,
                port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
                target_ip TEXT NOT NULL,
                url TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#],
    },
    Migration {
        version: 6,
        name: "create_messages_sessions_snapshots",
        statements: &[
            r#"
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                scope_type TEXT NOT NULL CHECK (scope_type <> ''),
                scope_id TEXT NOT NULL CHECK (scope_id <> ''),
                author TEXT,
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                json TEXT
            )
            "#,
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                current_vmid INTEGER,
                profile TEXT NOT NULL,
                branch TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                meta_json TEXT
            )
            "#,
            r#"
            CREATE TABLE workspace_snapshots (
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                backend_ref TEXT NOT NULL,
                created_at TEXT NOT NULL,
                meta_json TEXT,
                PRIMARY KEY (workspace_id, name)
            )
            "#,
            "ALTER TABLE jobs ADD COLUMN session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL",
        ],
    },
    Migration {
        version: 7,
        name: "add_workspace_leases",
        statements: &[
            "ALTER TABLE workspaces ADD COLUMN lease_owner TEXT",
            "ALTER TABLE workspaces ADD COLUMN lease_nonce TEXT",
            "ALTER TABLE workspaces ADD COLUMN lease_expires_at TEXT",
        ],
    },
    Migration {
        version: 8,
        name: "add_lookup_indexes",
        statements: &[
            "CREATE INDEX idx_sandboxes_lease ON sandboxes (lease_expires_at)",
            "CREATE INDEX idx_jobs_sandbox ON jobs (sandbox_vmid, created_at)",
            "CREATE INDEX idx_events_sandbox ON events (sandbox_vmid, id)",
            "CREATE INDEX idx_events_job ON events (job_id, id)",
            "CREATE INDEX idx_messages_scope ON messages (scope_type, scope_id, id)",
            "CREATE INDEX idx_artifacts_job ON artifacts (job_id)",
            "CREATE INDEX idx_artifact_tokens_job ON artifact_tokens (job_id)",
            "CREATE INDEX idx_exposures_vmid ON exposures (vmid)",
            "CREATE INDEX idx_workspaces_lease ON workspaces (lease_expires_at)",
        ],
    },
    Migration {
        version: 9,
        name: "unique_artifact_names",
        statements: &[
            "DELETE FROM artifacts WHERE id NOT IN (SELECT MIN(id) FROM artifacts GROUP BY job_id, name)",
            "CREATE UNIQUE INDEX idx_artifacts_job_name ON artifacts (job_id, name)",
        ],
    },
    Migration {
        version: 10,
        name: "add_sandbox_state_changed_at",
        statements: &[
            "ALTER TABLE sandboxes ADD COLUMN state_changed_at TEXT",
            "UPDATE sandboxes SET state_changed_at = updated_at",
            "CREATE INDEX idx_sandboxes_state_changed ON sandboxes (state, state_changed_at)",
        ],
    },
];

/// Applies every migration not yet recorded. Returns how many ran.
pub async fn run(pool: &SqlitePool, now: DateTime<Utc>) -> DbResult<usize> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let applied = applied_versions(pool).await?;
    let mut count = 0;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let wrap = |source: sqlx::Error| DbError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        };

        let mut tx = pool.begin().await.map_err(wrap)?;
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(format_timestamp(now))
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;

        info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        count += 1;
    }

    Ok(count)
}

/// Versions already recorded in `schema_migrations`, ascending.
pub async fn applied_versions(pool: &SqlitePool) -> DbResult<HashSet<i64>> {
    let mut rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version").fetch(pool);
    let mut out = HashSet::new();
    while let Some(row) = rows.try_next().await? {
        out.insert(row.try_get::<i64, _>("version")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_strictly_increasing() {
        let mut previous = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > previous, "{} out of order", migration.name);
            assert!(!migration.statements.is_empty());
            previous = migration.version;
        }
    }
}
