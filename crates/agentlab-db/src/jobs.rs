use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    clamp_limit, encode_optional_json, format_timestamp, parse_optional_json, parse_timestamp,
    require_non_empty, require_positive_vmid, Database, DbError, DbResult,
};

/// Job statuses: `QUEUED -> RUNNING -> {COMPLETED, FAILED, TIMEOUT}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Running | JobStatus::Failed | JobStatus::Timeout
            ),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            "" => Err(DbError::validation("status", "must not be empty")),
            other => Err(DbError::validation(
                "status",
                format!("unknown job status: {other}"),
            )),
        }
    }
}

/// Input payload for job creation.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub repo_url: &'a str,
    pub git_ref: &'a str,
    pub profile: &'a str,
    pub status: JobStatus,
    pub task: Option<&'a str>,
    pub mode: Option<&'a str>,
    pub ttl_minutes: Option<u32>,
    pub keepalive: bool,
    pub workspace_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

impl<'a> NewJob<'a> {
    pub fn new(id: &'a str, repo_url: &'a str, git_ref: &'a str, profile: &'a str) -> Self {
        Self {
            id,
            repo_url,
            git_ref,
            profile,
            status: JobStatus::Queued,
            task: None,
            mode: None,
            ttl_minutes: None,
            keepalive: false,
            workspace_id: None,
            session_id: None,
        }
    }
}

/// Persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub repo_url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub profile: String,
    pub status: JobStatus,
    pub sandbox_vmid: Option<i64>,
    pub task: Option<String>,
    pub mode: Option<String>,
    pub ttl_minutes: Option<u32>,
    pub keepalive: bool,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_json: Option<Value>,
}

const JOB_COLUMNS: &str = r#"id, repo_url, "ref", profile, status, sandbox_vmid, task, mode,
     ttl_minutes, keepalive, workspace_id, session_id, created_at, updated_at, result_json"#;

impl Database {
    pub async fn create_job(&self, data: NewJob<'_>) -> DbResult<JobRecord> {
        require_non_empty("id", data.id)?;
        require_non_empty("repo_url", data.repo_url)?;
        require_non_empty("ref", data.git_ref)?;
        require_non_empty("profile", data.profile)?;

        let now = format_timestamp(self.now());
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, repo_url, "ref", profile, status, task, mode, ttl_minutes,
                keepalive, workspace_id, session_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.id)
        .bind(data.repo_url)
        .bind(data.git_ref)
        .bind(data.profile)
        .bind(data.status.as_str())
        .bind(data.task)
        .bind(data.mode)
        .bind(data.ttl_minutes.map(i64::from))
        .bind(data.keepalive)
        .bind(data.workspace_id)
        .bind(data.session_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => DbError::Conflict(format!("job {} already exists", data.id)),
            other => other,
        })?;

        self.get_job(data.id).await
    }

    pub async fn get_job(&self, id: &str) -> DbResult<JobRecord> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_job)
            .transpose()?
            .ok_or_else(|| DbError::not_found("job", id))
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: u32) -> DbResult<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let mut rows = sqlx::query(&sql).bind(clamp_limit(limit)).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_job(row)?);
        }
        Ok(out)
    }

    /// The most recent job bound to a sandbox.
    pub async fn get_job_by_sandbox_vmid(&self, vmid: i64) -> DbResult<JobRecord> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE sandbox_vmid = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(vmid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_job)
            .transpose()?
            .ok_or_else(|| DbError::not_found("job for sandbox", vmid))
    }

    /// Unconditional status update.
    pub async fn update_job_status(&self, id: &str, status: JobStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_timestamp(self.now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_job_row(result.rows_affected(), id)
    }

    /// Compare-and-swap on `(id, from)` honouring the job state machine.
    pub async fn transition_job_status(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> DbResult<bool> {
        if !from.can_transition_to(to) {
            return Err(DbError::validation(
                "status",
                format!("transition {from} -> {to} is not permitted"),
            ));
        }

        let result =
            sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(format_timestamp(self.now()))
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Sets status and result payload together.
    pub async fn update_job_result(
        &self,
        id: &str,
        status: JobStatus,
        result_json: Option<&Value>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, result_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(encode_optional_json(result_json))
        .bind(format_timestamp(self.now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_job_row(result.rows_affected(), id)
    }

    /// Associates the job with its sandbox. The link is write-once: repeating
    /// it with the same VMID is a no-op, a different VMID is a conflict.
    pub async fn update_job_sandbox(&self, id: &str, vmid: i64) -> DbResult<()> {
        require_positive_vmid(vmid)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs SET sandbox_vmid = ?, updated_at = ?
            WHERE id = ? AND (sandbox_vmid IS NULL OR sandbox_vmid = ?)
            "#,
        )
        .bind(vmid)
        .bind(format_timestamp(self.now()))
        .bind(id)
        .bind(vmid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let job = self.get_job(id).await?;
            return Err(DbError::Conflict(format!(
                "job {id} already bound to sandbox {}",
                job.sandbox_vmid.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Deletes a job together with the exposures of its sandbox. Artifacts
    /// and artifact tokens go through the foreign key cascade.
    pub async fn delete_job(&self, id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM exposures
            WHERE vmid = (SELECT sandbox_vmid FROM jobs WHERE id = ?)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        expect_job_row(result.rows_affected(), id)?;
        tx.commit().await?;
        Ok(())
    }
}

fn expect_job_row(affected: u64, id: &str) -> DbResult<()> {
    if affected == 0 {
        return Err(DbError::not_found("job", id));
    }
    Ok(())
}

fn map_job(row: SqliteRow) -> DbResult<JobRecord> {
    let status: String = row.try_get("status")?;
    let ttl: Option<i64> = row.try_get("ttl_minutes")?;

    Ok(JobRecord {
        id: row.try_get("id")?,
        repo_url: row.try_get("repo_url")?,
        git_ref: row.try_get("ref")?,
        profile: row.try_get("profile")?,
        status: JobStatus::from_str(&status)?,
        sandbox_vmid: row.try_get("sandbox_vmid")?,
        task: row.try_get("task")?,
        mode: row.try_get("mode")?,
        ttl_minutes: ttl.map(|v| v.clamp(0, i64::from(u32::MAX)) as u32),
        keepalive: row.try_get("keepalive")?,
        workspace_id: row.try_get("workspace_id")?,
        session_id: row.try_get("session_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        result_json: parse_optional_json("result_json", row.try_get("result_json")?)?,
    })
}
