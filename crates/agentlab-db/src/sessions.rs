use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    encode_optional_json, format_timestamp, parse_optional_json, parse_timestamp,
    require_non_empty, require_positive_vmid, Database, DbError, DbResult,
};

/// Input payload for session creation.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub workspace_id: &'a str,
    pub profile: &'a str,
    pub branch: Option<&'a str>,
    pub meta: Option<&'a Value>,
}

/// A named, long-lived pairing of a workspace with whichever sandbox is
/// currently serving it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub current_vmid: Option<i64>,
    pub profile: String,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub meta_json: Option<Value>,
}

const SESSION_COLUMNS: &str = "id, name, workspace_id, current_vmid, profile, branch, \
     created_at, updated_at, meta_json";

impl Database {
    pub async fn create_session(&self, data: NewSession<'_>) -> DbResult<SessionRecord> {
        require_non_empty("id", data.id)?;
        require_non_empty("name", data.name)?;
        require_non_empty("workspace_id", data.workspace_id)?;
        require_non_empty("profile", data.profile)?;

        let now = format_timestamp(self.now());
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, name, workspace_id, profile, branch, created_at, updated_at, meta_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.id)
        .bind(data.name)
        .bind(data.workspace_id)
        .bind(data.profile)
        .bind(data.branch)
        .bind(&now)
        .bind(&now)
        .bind(encode_optional_json(data.meta))
        .execute(&self.pool)
        .await?;

        self.get_session(data.id).await
    }

    pub async fn get_session(&self, id: &str) -> DbResult<SessionRecord> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_session)
            .transpose()?
            .ok_or_else(|| DbError::not_found("session", id))
    }

    pub async fn get_session_by_name(&self, name: &str) -> DbResult<SessionRecord> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_session)
            .transpose()?
            .ok_or_else(|| DbError::not_found("session", name))
    }

    pub async fn list_sessions(&self) -> DbResult<Vec<SessionRecord>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY name ASC");
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_session(row)?);
        }
        Ok(out)
    }

    /// Points the session at a sandbox, or clears it with `None`.
    pub async fn update_session_vmid(&self, id: &str, vmid: Option<i64>) -> DbResult<()> {
        if let Some(vmid) = vmid {
            require_positive_vmid(vmid)?;
        }
        let result =
            sqlx::query("UPDATE sessions SET current_vmid = ?, updated_at = ? WHERE id = ?")
                .bind(vmid)
                .bind(format_timestamp(self.now()))
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("session", id));
        }
        Ok(())
    }

    pub async fn update_session_branch(&self, id: &str, branch: Option<&str>) -> DbResult<()> {
        let result = sqlx::query("UPDATE sessions SET branch = ?, updated_at = ? WHERE id = ?")
            .bind(branch)
            .bind(format_timestamp(self.now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("session", id));
        }
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("session", id));
        }
        Ok(())
    }
}

fn map_session(row: SqliteRow) -> DbResult<SessionRecord> {
    Ok(SessionRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        workspace_id: row.try_get("workspace_id")?,
        current_vmid: row.try_get("current_vmid")?,
        profile: row.try_get("profile")?,
        branch: row.try_get("branch")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        meta_json: parse_optional_json("meta_json", row.try_get("meta_json")?)?,
    })
}
