use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    encode_optional_json, format_timestamp, parse_optional_json, parse_timestamp,
    require_non_empty, Database, DbError, DbResult,
};

#[derive(Debug, Clone)]
pub struct NewWorkspaceSnapshot<'a> {
    pub workspace_id: &'a str,
    pub name: &'a str,
    pub backend_ref: &'a str,
    pub meta: Option<&'a Value>,
}

/// A named point-in-time copy of a workspace volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSnapshotRecord {
    pub workspace_id: String,
    pub name: String,
    pub backend_ref: String,
    pub created_at: DateTime<Utc>,
    pub meta_json: Option<Value>,
}

impl Database {
    pub async fn create_workspace_snapshot(
        &self,
        data: NewWorkspaceSnapshot<'_>,
    ) -> DbResult<WorkspaceSnapshotRecord> {
        require_non_empty("workspace_id", data.workspace_id)?;
        require_non_empty("name", data.name)?;
        require_non_empty("backend_ref", data.backend_ref)?;

        sqlx::query(
            r#"
            INSERT INTO workspace_snapshots (workspace_id, name, backend_ref, created_at, meta_json)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.workspace_id)
        .bind(data.name)
        .bind(data.backend_ref)
        .bind(format_timestamp(self.now()))
        .bind(encode_optional_json(data.meta))
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => DbError::Conflict(format!(
                "snapshot '{}' already exists for workspace '{}'",
                data.name, data.workspace_id
            )),
            other => other,
        })?;

        self.get_workspace_snapshot(data.workspace_id, data.name)
            .await
    }

    pub async fn get_workspace_snapshot(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> DbResult<WorkspaceSnapshotRecord> {
        let row = sqlx::query(
            r#"
            SELECT workspace_id, name, backend_ref, created_at, meta_json
            FROM workspace_snapshots WHERE workspace_id = ? AND name = ?
            "#,
        )
        .bind(workspace_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_snapshot)
            .transpose()?
            .ok_or_else(|| DbError::not_found("workspace snapshot", format!("{workspace_id}/{name}")))
    }

    /// Newest first.
    pub async fn list_workspace_snapshots(
        &self,
        workspace_id: &str,
    ) -> DbResult<Vec<WorkspaceSnapshotRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT workspace_id, name, backend_ref, created_at, meta_json
            FROM workspace_snapshots WHERE workspace_id = ?
            ORDER BY created_at DESC, name ASC
            "#,
        )
        .bind(workspace_id)
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_snapshot(row)?);
        }
        Ok(out)
    }

    pub async fn delete_workspace_snapshot(&self, workspace_id: &str, name: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM workspace_snapshots WHERE workspace_id = ? AND name = ?")
            .bind(workspace_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(
                "workspace snapshot",
                format!("{workspace_id}/{name}"),
            ));
        }
        Ok(())
    }
}

fn map_snapshot(row: SqliteRow) -> DbResult<WorkspaceSnapshotRecord> {
    Ok(WorkspaceSnapshotRecord {
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        backend_ref: row.try_get("backend_ref")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        meta_json: parse_optional_json("meta_json", row.try_get("meta_json")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::NewWorkspace;
    use chrono::Duration;

    #[tokio::test]
    async fn snapshots_are_unique_per_workspace_and_cascade() {
        let (db, clock) = setup_db().await;
        db.create_workspace(NewWorkspace {
            id: "ws-snap",
            name: "ws-snap",
            storage: "local-zfs",
            volume_id: "local-zfs:vm-0-disk-9",
            size_gb: 16,
        })
        .await
        .unwrap();

        let snapshot = NewWorkspaceSnapshot {
            workspace_id: "ws-snap",
            name: "before-upgrade",
            backend_ref: "local-zfs:vm-0-disk-9@before-upgrade",
            meta: None,
        };
        db.create_workspace_snapshot(snapshot.clone()).await.unwrap();
        assert!(db
            .create_workspace_snapshot(snapshot)
            .await
            .unwrap_err()
            .is_conflict());

        clock.advance(Duration::seconds(5));
        db.create_workspace_snapshot(NewWorkspaceSnapshot {
            workspace_id: "ws-snap",
            name: "after-upgrade",
            backend_ref: "local-zfs:vm-0-disk-9@after-upgrade",
            meta: None,
        })
        .await
        .unwrap();

        let names: Vec<_> = db
            .list_workspace_snapshots("ws-snap")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["after-upgrade", "before-upgrade"]);

        db.delete_workspace("ws-snap").await.unwrap();
        assert!(db.list_workspace_snapshots("ws-snap").await.unwrap().is_empty());
    }
}
