use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, require_non_empty,
    require_positive_vmid, Database, DbError, DbResult,
};

/// Sandbox lifecycle states. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Requested,
    Provisioning,
    Booting,
    Ready,
    Running,
    Completed,
    Failed,
    Timeout,
    Stopped,
    Destroyed,
}

impl SandboxState {
    pub const ALL: [SandboxState; 10] = [
        SandboxState::Requested,
        SandboxState::Provisioning,
        SandboxState::Booting,
        SandboxState::Ready,
        SandboxState::Running,
        SandboxState::Completed,
        SandboxState::Failed,
        SandboxState::Timeout,
        SandboxState::Stopped,
        SandboxState::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Requested => "REQUESTED",
            SandboxState::Provisioning => "PROVISIONING",
            SandboxState::Booting => "BOOTING",
            SandboxState::Ready => "READY",
            SandboxState::Running => "RUNNING",
            SandboxState::Completed => "COMPLETED",
            SandboxState::Failed => "FAILED",
            SandboxState::Timeout => "TIMEOUT",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Destroyed => "DESTROYED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Destroyed)
    }

    /// States the sandbox may move to from `self`.
    pub fn allowed_next(&self) -> &'static [SandboxState] {
        use SandboxState::*;
        match self {
            Requested => &[Provisioning, Failed],
            Provisioning => &[Booting, Failed],
            Booting => &[Ready, Failed, Timeout],
            Ready => &[Running, Stopped, Failed],
            Running => &[Completed, Failed, Timeout, Stopped],
            Completed | Failed | Timeout => &[Stopped, Destroyed],
            Stopped => &[Destroyed],
            Destroyed => &[],
        }
    }

    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        SandboxState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DbError::validation("state", format!("unknown sandbox state: {s}")))
    }
}

/// Input payload for sandbox registration.
#[derive(Debug, Clone)]
pub struct NewSandbox<'a> {
    pub vmid: i64,
    pub name: &'a str,
    pub profile: &'a str,
    pub state: SandboxState,
    pub keepalive: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub workspace_id: Option<&'a str>,
}

impl<'a> NewSandbox<'a> {
    pub fn new(vmid: i64, name: &'a str, profile: &'a str) -> Self {
        Self {
            vmid,
            name,
            profile,
            state: SandboxState::Requested,
            keepalive: false,
            lease_expires_at: None,
            workspace_id: None,
        }
    }
}

/// Persisted sandbox row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRecord {
    pub vmid: i64,
    pub name: String,
    pub profile: String,
    pub state: SandboxState,
    pub ip: Option<String>,
    pub workspace_id: Option<String>,
    pub keepalive: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Time of the last state change. Field updates leave it alone.
    pub state_changed_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl SandboxRecord {
    /// A non-destroyed sandbox whose lease ran out must be reclaimed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.lease_expires_at.is_some_and(|at| at <= now)
    }
}

const SANDBOX_COLUMNS: &str = "vmid, name, profile, state, ip, workspace_id, keepalive, \
     lease_expires_at, created_at, updated_at, state_changed_at, last_used_at";

impl Database {
    /// Registers a sandbox and returns the persisted row.
    pub async fn create_sandbox(&self, data: NewSandbox<'_>) -> DbResult<SandboxRecord> {
        require_positive_vmid(data.vmid)?;
        require_non_empty("name", data.name)?;
        require_non_empty("profile", data.profile)?;

        let now = format_timestamp(self.now());
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                vmid, name, profile, state, keepalive, lease_expires_at,
                workspace_id, created_at, updated_at, state_changed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.vmid)
        .bind(data.name)
        .bind(data.profile)
        .bind(data.state.as_str())
        .bind(data.keepalive)
        .bind(data.lease_expires_at.map(format_timestamp))
        .bind(data.workspace_id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => {
                DbError::Conflict(format!("sandbox vmid {} already exists", data.vmid))
            }
            other => other,
        })?;

        self.get_sandbox(data.vmid).await
    }

    /// Retrieves a sandbox by VMID.
    pub async fn get_sandbox(&self, vmid: i64) -> DbResult<SandboxRecord> {
        let row = sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE vmid = ?"
        ))
        .bind(vmid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_sandbox)
            .transpose()?
            .ok_or_else(|| DbError::not_found("sandbox", vmid))
    }

    /// Lists all sandboxes ordered by VMID.
    pub async fn list_sandboxes(&self) -> DbResult<Vec<SandboxRecord>> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes ORDER BY vmid ASC");
        let mut rows = sqlx::query(&sql).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    /// Compare-and-swap on `(vmid, from)`. Returns `false` when the row was
    /// not in `from` (or does not exist); an illegal `from -> to` pair is a
    /// validation error.
    pub async fn transition_sandbox(
        &self,
        vmid: i64,
        from: SandboxState,
        to: SandboxState,
    ) -> DbResult<bool> {
        if !from.can_transition_to(to) {
            return Err(DbError::validation(
                "state",
                format!("transition {from} -> {to} is not permitted"),
            ));
        }

        let now = format_timestamp(self.now());
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET state = ?, updated_at = ?, state_changed_at = ?
            WHERE vmid = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&now)
        .bind(&now)
        .bind(vmid)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_sandbox_ip(&self, vmid: i64, ip: &str) -> DbResult<()> {
        require_non_empty("ip", ip)?;
        let result = sqlx::query("UPDATE sandboxes SET ip = ?, updated_at = ? WHERE vmid = ?")
            .bind(ip)
            .bind(format_timestamp(self.now()))
            .bind(vmid)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), vmid)
    }

    /// Sets or clears the sandbox's workspace binding.
    pub async fn update_sandbox_workspace(
        &self,
        vmid: i64,
        workspace_id: Option<&str>,
    ) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE sandboxes SET workspace_id = ?, updated_at = ? WHERE vmid = ?")
                .bind(workspace_id)
                .bind(format_timestamp(self.now()))
                .bind(vmid)
                .execute(&self.pool)
                .await?;
        expect_row(result.rows_affected(), vmid)
    }

    /// Sets or clears the lease deadline. `None` means no TTL.
    pub async fn update_sandbox_lease(
        &self,
        vmid: i64,
        lease_expires_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET lease_expires_at = ?, updated_at = ? WHERE vmid = ?",
        )
        .bind(lease_expires_at.map(format_timestamp))
        .bind(format_timestamp(self.now()))
        .bind(vmid)
        .execute(&self.pool)
        .await?;
        expect_row(result.rows_affected(), vmid)
    }

    pub async fn touch_sandbox_last_used(&self, vmid: i64, at: DateTime<Utc>) -> DbResult<()> {
        let stamp = format_timestamp(at);
        let result =
            sqlx::query("UPDATE sandboxes SET last_used_at = ?, updated_at = ? WHERE vmid = ?")
                .bind(&stamp)
                .bind(&stamp)
                .bind(vmid)
                .execute(&self.pool)
                .await?;
        expect_row(result.rows_affected(), vmid)
    }

    /// Non-destroyed sandboxes whose lease deadline is at or before `now`,
    /// ascending by VMID.
    pub async fn list_expired_sandboxes(&self, now: DateTime<Utc>) -> DbResult<Vec<SandboxRecord>> {
        let sql = format!(
            r#"
            SELECT {SANDBOX_COLUMNS} FROM sandboxes
            WHERE state <> ?
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at <= ?
            ORDER BY vmid ASC
            "#
        );
        let mut rows = sqlx::query(&sql)
            .bind(SandboxState::Destroyed.as_str())
            .bind(format_timestamp(now))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    /// Sandboxes sitting in `state` whose last transition happened at or
    /// before `cutoff`, ascending by VMID.
    pub async fn list_sandboxes_stuck_in(
        &self,
        state: SandboxState,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<SandboxRecord>> {
        let sql = format!(
            r#"
            SELECT {SANDBOX_COLUMNS} FROM sandboxes
            WHERE state = ? AND state_changed_at <= ?
            ORDER BY vmid ASC
            "#
        );
        let mut rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(format_timestamp(cutoff))
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_sandbox(row)?);
        }
        Ok(out)
    }

    /// Counts per state, for the metrics endpoint. States with no rows are
    /// omitted.
    pub async fn count_sandboxes_by_state(&self) -> DbResult<Vec<(SandboxState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM sandboxes GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut out = rows
            .into_iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                Ok((SandboxState::from_str(&state)?, row.try_get::<i64, _>("total")?))
            })
            .collect::<DbResult<Vec<_>>>()?;
        out.sort_by_key(|(state, _)| *state);
        Ok(out)
    }

    /// Removes a sandbox row. Exposures and bootstrap tokens cascade.
    pub async fn delete_sandbox(&self, vmid: i64) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE vmid = ?")
            .bind(vmid)
            .execute(&self.pool)
            .await?;
        expect_row(result.rows_affected(), vmid)
    }
}

fn expect_row(affected: u64, vmid: i64) -> DbResult<()> {
    if affected == 0 {
        return Err(DbError::not_found("sandbox", vmid));
    }
    Ok(())
}

fn map_sandbox(row: SqliteRow) -> DbResult<SandboxRecord> {
    let state: String = row.try_get("state")?;

    Ok(SandboxRecord {
        vmid: row.try_get("vmid")?,
        name: row.try_get("name")?,
        profile: row.try_get("profile")?,
        state: SandboxState::from_str(&state)?,
        ip: row.try_get("ip")?,
        workspace_id: row.try_get("workspace_id")?,
        keepalive: row.try_get("keepalive")?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        state_changed_at: parse_timestamp("state_changed_at", row.try_get("state_changed_at")?)?,
        last_used_at: parse_optional_timestamp("last_used_at", row.try_get("last_used_at")?)?,
    })
}
