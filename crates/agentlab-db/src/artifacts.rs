use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    format_timestamp, parse_timestamp, require_non_empty, Database, DbError, DbResult, JobStatus,
    SandboxState,
};

/// Input payload for an uploaded artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact<'a> {
    pub job_id: &'a str,
    pub vmid: Option<i64>,
    pub name: &'a str,
    pub path: &'a str,
    pub size_bytes: i64,
    pub sha256: &'a str,
    pub mime: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub id: i64,
    pub job_id: String,
    pub vmid: Option<i64>,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub mime: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An artifact joined with the job and sandbox facts the retention policy
/// looks at.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetentionRecord {
    pub artifact: ArtifactRecord,
    pub job_profile: String,
    pub job_status: JobStatus,
    pub job_updated_at: DateTime<Utc>,
    pub sandbox_vmid: Option<i64>,
    /// `None` when the sandbox row is gone.
    pub sandbox_state: Option<SandboxState>,
}

const ARTIFACT_COLUMNS: &str =
    "id, job_id, vmid, name, path, size_bytes, sha256, mime, created_at";

impl Database {
    pub async fn create_artifact(&self, data: NewArtifact<'_>) -> DbResult<ArtifactRecord> {
        require_non_empty("job_id", data.job_id)?;
        require_non_empty("name", data.name)?;
        require_non_empty("path", data.path)?;
        if data.size_bytes <= 0 {
            return Err(DbError::validation("size_bytes", "must be positive"));
        }
        if let Some(vmid) = data.vmid {
            crate::require_positive_vmid(vmid)?;
        }
        let sha256 = data.sha256.trim().to_ascii_lowercase();
        if sha256.len() != 64 || hex::decode(&sha256).is_err() {
            return Err(DbError::validation(
                "sha256",
                "must be 64 hexadecimal characters",
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO artifacts (job_id, vmid, name, path, size_bytes, sha256, mime, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.job_id)
        .bind(data.vmid)
        .bind(data.name)
        .bind(data.path)
        .bind(data.size_bytes)
        .bind(&sha256)
        .bind(data.mime)
        .bind(format_timestamp(self.now()))
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => DbError::Conflict(format!(
                "artifact {} already exists for job {}",
                data.name, data.job_id
            )),
            other => other,
        })?;

        self.get_artifact(result.last_insert_rowid()).await
    }

    pub async fn get_artifact(&self, id: i64) -> DbResult<ArtifactRecord> {
        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| map_artifact(&row))
            .transpose()?
            .ok_or_else(|| DbError::not_found("artifact", id))
    }

    /// Upload order.
    pub async fn list_artifacts_by_job(&self, job_id: &str) -> DbResult<Vec<ArtifactRecord>> {
        let sql = format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE job_id = ? ORDER BY id ASC");
        let mut rows = sqlx::query(&sql).bind(job_id).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_artifact(&row)?);
        }
        Ok(out)
    }

    /// Unlinks the row only. The blob on disk is the caller's to remove.
    pub async fn delete_artifact(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("artifact", id));
        }
        Ok(())
    }

    /// Every artifact with its job and (possibly missing) sandbox. The job's
    /// `sandbox_vmid` wins over the artifact's own `vmid`. Pure read.
    pub async fn list_retention_candidates(&self) -> DbResult<Vec<RetentionRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT
                a.id, a.job_id, a.vmid, a.name, a.path, a.size_bytes, a.sha256, a.mime,
                a.created_at,
                j.profile AS job_profile,
                j.status AS job_status,
                j.updated_at AS job_updated_at,
                COALESCE(j.sandbox_vmid, a.vmid) AS effective_vmid,
                s.state AS sandbox_state
            FROM artifacts a
            JOIN jobs j ON j.id = a.job_id
            LEFT JOIN sandboxes s ON s.vmid = COALESCE(j.sandbox_vmid, a.vmid)
            ORDER BY a.id ASC
            "#,
        )
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let status: String = row.try_get("job_status")?;
            let sandbox_state: Option<String> = row.try_get("sandbox_state")?;
            out.push(RetentionRecord {
                artifact: map_artifact(&row)?,
                job_profile: row.try_get("job_profile")?,
                job_status: status.parse()?,
                job_updated_at: parse_timestamp("job_updated_at", row.try_get("job_updated_at")?)?,
                sandbox_vmid: row.try_get("effective_vmid")?,
                sandbox_state: sandbox_state.map(|state| state.parse()).transpose()?,
            });
        }
        Ok(out)
    }
}

fn map_artifact(row: &SqliteRow) -> DbResult<ArtifactRecord> {
    Ok(ArtifactRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        vmid: row.try_get("vmid")?,
        name: row.try_get("name")?,
        path: row.try_get("path")?,
        size_bytes: row.try_get("size_bytes")?,
        sha256: row.try_get("sha256")?,
        mime: row.try_get("mime")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    const DIGEST: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn artifact<'a>(job_id: &'a str, vmid: Option<i64>, name: &'a str) -> NewArtifact<'a> {
        NewArtifact {
            job_id,
            vmid,
            name,
            path: "/var/lib/agentlab/artifacts/x",
            size_bytes: 5,
            sha256: DIGEST,
            mime: Some("text/plain"),
        }
    }

    #[tokio::test]
    async fn create_validates_inputs() {
        let (db, _clock) = setup_db().await;
        insert_job(&db, "job_a").await;

        let mut zero = artifact("job_a", None, "out.txt");
        zero.size_bytes = 0;
        assert!(matches!(
            db.create_artifact(zero).await.unwrap_err(),
            DbError::Validation { field: "size_bytes", .. }
        ));

        let mut bad_digest = artifact("job_a", None, "out.txt");
        bad_digest.sha256 = "xyz";
        assert!(matches!(
            db.create_artifact(bad_digest).await.unwrap_err(),
            DbError::Validation { field: "sha256", .. }
        ));

        let err = db
            .create_artifact(artifact("job_missing", None, "out.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "foreign_key");
    }

    #[tokio::test]
    async fn names_are_unique_per_job() {
        let (db, _clock) = setup_db().await;
        insert_job(&db, "job_u").await;
        insert_job(&db, "job_v").await;
        db.create_artifact(artifact("job_u", None, "out.txt"))
            .await
            .unwrap();

        let err = db
            .create_artifact(artifact("job_u", None, "out.txt"))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert!(err.to_string().contains("out.txt"), "{err}");
        db.create_artifact(artifact("job_v", None, "out.txt"))
            .await
            .unwrap();
        assert_eq!(db.list_artifacts_by_job("job_u").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_deletion_cascades_to_artifacts_and_tokens() {
        let (db, _clock) = setup_db().await;
        insert_job(&db, "job_c").await;
        let record = db
            .create_artifact(artifact("job_c", Some(7), "report.md"))
            .await
            .unwrap();
        assert_eq!(db.list_artifacts_by_job("job_c").await.unwrap().len(), 1);
        let token = crate::hash_token("upload");
        db.create_artifact_token(&token, "job_c", 7, t0() + chrono::Duration::hours(1))
            .await
            .unwrap();

        db.delete_job("job_c").await.unwrap();
        assert!(db.get_artifact(record.id).await.unwrap_err().is_not_found());
        assert!(db.get_artifact_token(&token).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn retention_join_prefers_job_sandbox() {
        let (db, _clock) = setup_db().await;
        insert_sandbox(&db, 500).await;
        insert_job(&db, "job_r").await;
        db.update_job_sandbox("job_r", 500).await.unwrap();

        // Artifact carries a stale vmid; the job's assignment wins.
        db.create_artifact(artifact("job_r", Some(77), "a.bin"))
            .await
            .unwrap();
        insert_job(&db, "job_orphan").await;
        db.create_artifact(artifact("job_orphan", Some(88), "b.bin"))
            .await
            .unwrap();

        let records = db.list_retention_candidates().await.unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].sandbox_vmid, Some(500));
        assert_eq!(records[0].sandbox_state, Some(SandboxState::Requested));
        assert_eq!(records[0].job_status, JobStatus::Queued);
        assert_eq!(records[0].job_profile, "default");

        assert_eq!(records[1].sandbox_vmid, Some(88));
        assert_eq!(records[1].sandbox_state, None);
    }

    #[tokio::test]
    async fn delete_missing_artifact_is_not_found() {
        let (db, _clock) = setup_db().await;
        assert!(db.delete_artifact(42).await.unwrap_err().is_not_found());
    }
}
