use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, require_non_empty,
    require_positive_vmid, require_set_timestamp, Database, DbError, DbResult,
};

/// SHA-256 hex digest of the whitespace-trimmed plaintext. Only this value
/// ever reaches the store.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One-shot credential a fresh VM trades for its job payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BootstrapTokenRecord {
    pub token_hash: String,
    pub vmid: i64,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Reusable upload credential scoped to one job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArtifactTokenRecord {
    pub token_hash: String,
    pub job_id: String,
    pub vmid: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ArtifactTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl Database {
    pub async fn create_bootstrap_token(
        &self,
        token_hash: &str,
        vmid: i64,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        require_non_empty("token_hash", token_hash)?;
        require_positive_vmid(vmid)?;
        require_set_timestamp("expires_at", expires_at)?;

        sqlx::query(
            r#"
            INSERT INTO bootstrap_tokens (token_hash, vmid, expires_at, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(token_hash)
        .bind(vmid)
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(self.now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_bootstrap_token(&self, token_hash: &str) -> DbResult<BootstrapTokenRecord> {
        let row = sqlx::query(
            r#"
            SELECT token_hash, vmid, expires_at, consumed_at, created_at
            FROM bootstrap_tokens WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_bootstrap_token)
            .transpose()?
            .ok_or_else(|| DbError::not_found("bootstrap token", "<redacted>"))
    }

    /// True iff the token exists for `vmid`, is unconsumed, and unexpired.
    pub async fn validate_bootstrap_token(
        &self,
        token_hash: &str,
        vmid: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM bootstrap_tokens
            WHERE token_hash = ? AND vmid = ? AND consumed_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(token_hash)
        .bind(vmid)
        .bind(format_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Marks the token consumed in one statement. Only the first caller for a
    /// live token gets `true`.
    pub async fn consume_bootstrap_token(
        &self,
        token_hash: &str,
        vmid: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let now = format_timestamp(now);
        let result = sqlx::query(
            r#"
            UPDATE bootstrap_tokens SET consumed_at = ?
            WHERE token_hash = ? AND vmid = ? AND consumed_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(&now)
        .bind(token_hash)
        .bind(vmid)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drops every bootstrap token whose window closed at or before `now`.
    pub async fn delete_expired_bootstrap_tokens(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM bootstrap_tokens WHERE expires_at <= ?")
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_artifact_token(
        &self,
        token_hash: &str,
        job_id: &str,
        vmid: i64,
        expires_at: DateTime<Utc>,
    ) -> DbResult<()> {
        require_non_empty("token_hash", token_hash)?;
        require_non_empty("job_id", job_id)?;
        require_positive_vmid(vmid)?;
        require_set_timestamp("expires_at", expires_at)?;

        sqlx::query(
            r#"
            INSERT INTO artifact_tokens (token_hash, job_id, vmid, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(token_hash)
        .bind(job_id)
        .bind(vmid)
        .bind(format_timestamp(expires_at))
        .bind(format_timestamp(self.now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_artifact_token(&self, token_hash: &str) -> DbResult<ArtifactTokenRecord> {
        let row = sqlx::query(
            r#"
            SELECT token_hash, job_id, vmid, expires_at, created_at, last_used_at
            FROM artifact_tokens WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_artifact_token)
            .transpose()?
            .ok_or_else(|| DbError::not_found("artifact token", "<redacted>"))
    }

    /// Stamps `last_used_at`. A missing row is not an error.
    pub async fn touch_artifact_token(&self, token_hash: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE artifact_tokens SET last_used_at = ? WHERE token_hash = ?")
            .bind(format_timestamp(now))
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_bootstrap_token(row: SqliteRow) -> DbResult<BootstrapTokenRecord> {
    Ok(BootstrapTokenRecord {
        token_hash: row.try_get("token_hash")?,
        vmid: row.try_get("vmid")?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        consumed_at: parse_optional_timestamp("consumed_at", row.try_get("consumed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn map_artifact_token(row: SqliteRow) -> DbResult<ArtifactTokenRecord> {
    Ok(ArtifactTokenRecord {
        token_hash: row.try_get("token_hash")?,
        job_id: row.try_get("job_id")?,
        vmid: row.try_get("vmid")?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_used_at: parse_optional_timestamp("last_used_at", row.try_get("last_used_at")?)?,
    })
}
