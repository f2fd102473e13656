use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, require_non_empty,
    require_positive_vmid, require_set_timestamp, Database, DbError, DbResult,
};

/// Input payload for workspace creation.
#[derive(Debug, Clone)]
pub struct NewWorkspace<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub storage: &'a str,
    pub volume_id: &'a str,
    pub size_gb: i64,
}

/// The `(owner, nonce, expires_at)` triple guarding a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceLease {
    pub owner: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted workspace row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub storage: String,
    pub volume_id: String,
    pub size_gb: i64,
    pub attached_vmid: Option<i64>,
    pub lease: Option<WorkspaceLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    /// Lease-free iff nobody holds it or the holder's lease ran out.
    pub fn is_lease_free(&self, now: DateTime<Utc>) -> bool {
        match &self.lease {
            None => true,
            Some(lease) => lease.expires_at <= now,
        }
    }

    pub fn is_leased_by(&self, owner: &str, nonce: &str) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.owner == owner && lease.nonce == nonce)
    }
}

const WORKSPACE_COLUMNS: &str = "id, name, storage, volume_id, size_gb, attached_vmid, \
     lease_owner, lease_nonce, lease_expires_at, created_at, updated_at";

impl Database {
    pub async fn create_workspace(&self, data: NewWorkspace<'_>) -> DbResult<WorkspaceRecord> {
        require_non_empty("id", data.id)?;
        require_non_empty("name", data.name)?;
        require_non_empty("storage", data.storage)?;
        require_non_empty("volume_id", data.volume_id)?;
        if data.size_gb <= 0 {
            return Err(DbError::validation("size_gb", "must be positive"));
        }

        let now = format_timestamp(self.now());
        sqlx::query(
            r#"
            INSERT INTO workspaces (
                id, name, storage, volume_id, size_gb, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.id)
        .bind(data.name)
        .bind(data.storage)
        .bind(data.volume_id)
        .bind(data.size_gb)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => DbError::Conflict(format!(
                "workspace id '{}' or name '{}' already exists",
                data.id, data.name
            )),
            other => other,
        })?;

        self.get_workspace(data.id).await
    }

    pub async fn get_workspace(&self, id: &str) -> DbResult<WorkspaceRecord> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_workspace)
            .transpose()?
            .ok_or_else(|| DbError::not_found("workspace", id))
    }

    pub async fn get_workspace_by_name(&self, name: &str) -> DbResult<WorkspaceRecord> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_workspace)
            .transpose()?
            .ok_or_else(|| DbError::not_found("workspace", name))
    }

    pub async fn list_workspaces(&self) -> DbResult<Vec<WorkspaceRecord>> {
        let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY name ASC");
        let mut rows = sqlx::query(&sql).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_workspace(row)?);
        }
        Ok(out)
    }

    /// Sets `attached_vmid` only when it is currently NULL.
    pub async fn attach_workspace(&self, id: &str, vmid: i64) -> DbResult<bool> {
        require_positive_vmid(vmid)?;
        let result = sqlx::query(
            r#"
            UPDATE workspaces SET attached_vmid = ?, updated_at = ?
            WHERE id = ? AND attached_vmid IS NULL
            "#,
        )
        .bind(vmid)
        .bind(format_timestamp(self.now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.cas_outcome(result.rows_affected(), id).await
    }

    /// Clears `attached_vmid` only when it currently equals `vmid`.
    pub async fn detach_workspace(&self, id: &str, vmid: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces SET attached_vmid = NULL, updated_at = ?
            WHERE id = ? AND attached_vmid = ?
            "#,
        )
        .bind(format_timestamp(self.now()))
        .bind(id)
        .bind(vmid)
        .execute(&self.pool)
        .await?;
        self.cas_outcome(result.rows_affected(), id).await
    }

    /// Takes the lease when nobody holds it or the current holder's lease is
    /// at or past its deadline.
    pub async fn try_acquire_workspace_lease(
        &self,
        id: &str,
        owner: &str,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        validate_lease_args(owner, nonce)?;
        require_set_timestamp("expires_at", expires_at)?;

        let now = self.now();
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET lease_owner = ?, lease_nonce = ?, lease_expires_at = ?, updated_at = ?
            WHERE id = ?
              AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(owner)
        .bind(nonce)
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(now))
        .bind(id)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        self.cas_outcome(result.rows_affected(), id).await
    }

    /// Extends the lease for the current `(owner, nonce)` holder.
    pub async fn renew_workspace_lease(
        &self,
        id: &str,
        owner: &str,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        validate_lease_args(owner, nonce)?;
        require_set_timestamp("expires_at", expires_at)?;

        let result = sqlx::query(
            r#"
            UPDATE workspaces SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND lease_owner = ? AND lease_nonce = ?
            "#,
        )
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(self.now()))
        .bind(id)
        .bind(owner)
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        self.cas_outcome(result.rows_affected(), id).await
    }

    /// Clears the lease triple for the current `(owner, nonce)` holder.
    pub async fn release_workspace_lease(
        &self,
        id: &str,
        owner: &str,
        nonce: &str,
    ) -> DbResult<bool> {
        validate_lease_args(owner, nonce)?;

        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET lease_owner = NULL, lease_nonce = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND lease_owner = ? AND lease_nonce = ?
            "#,
        )
        .bind(format_timestamp(self.now()))
        .bind(id)
        .bind(owner)
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        self.cas_outcome(result.rows_affected(), id).await
    }

    /// Workspaces holding a lease whose deadline passed. They are free for
    /// the next acquirer; nothing is cleared here.
    pub async fn list_expired_workspace_leases(
        &self,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<WorkspaceRecord>> {
        let sql = format!(
            r#"
            SELECT {WORKSPACE_COLUMNS} FROM workspaces
            WHERE lease_owner IS NOT NULL AND lease_expires_at <= ?
            ORDER BY id ASC
            "#
        );
        let mut rows = sqlx::query(&sql)
            .bind(format_timestamp(now))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_workspace(row)?);
        }
        Ok(out)
    }

    pub async fn delete_workspace(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("workspace", id));
        }
        Ok(())
    }

    /// A CAS that touched no row either lost the race or targeted a missing
    /// workspace; only the latter is an error.
    async fn cas_outcome(&self, affected: u64, id: &str) -> DbResult<bool> {
        if affected == 1 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(DbError::not_found("workspace", id))
        }
    }
}

fn validate_lease_args(owner: &str, nonce: &str) -> DbResult<()> {
    require_non_empty("lease_owner", owner)?;
    require_non_empty("lease_nonce", nonce)
}

fn map_workspace(row: SqliteRow) -> DbResult<WorkspaceRecord> {
    let owner: Option<String> = row.try_get("lease_owner")?;
    let nonce: Option<String> = row.try_get("lease_nonce")?;
    let expires_at = parse_optional_timestamp("lease_expires_at", row.try_get("lease_expires_at")?)?;

    let lease = match (owner, nonce, expires_at) {
        (Some(owner), Some(nonce), Some(expires_at)) => Some(WorkspaceLease {
            owner,
            nonce,
            expires_at,
        }),
        _ => None,
    };

    Ok(WorkspaceRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        storage: row.try_get("storage")?,
        volume_id: row.try_get("volume_id")?,
        size_gb: row.try_get("size_gb")?,
        attached_vmid: row.try_get("attached_vmid")?,
        lease,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
