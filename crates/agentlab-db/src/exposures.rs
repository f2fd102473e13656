use std::net::IpAddr;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    format_timestamp, parse_timestamp, require_non_empty, require_positive_vmid, Database,
    DbError, DbResult,
};

/// Input payload for a port exposure.
#[derive(Debug, Clone)]
pub struct NewExposure<'a> {
    pub name: &'a str,
    pub vmid: i64,
    pub port: u32,
    pub target_ip: &'a str,
    pub url: Option<&'a str>,
    pub state: &'a str,
}

/// A named forward from the host to a port inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExposureRecord {
    pub name: String,
    pub vmid: i64,
    pub port: u16,
    pub target_ip: String,
    pub url: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const EXPOSURE_COLUMNS: &str =
    "name, vmid, port, target_ip, url, state, created_at, updated_at";

impl Database {
    pub async fn create_exposure(&self, data: NewExposure<'_>) -> DbResult<ExposureRecord> {
        require_non_empty("name", data.name)?;
        require_positive_vmid(data.vmid)?;
        let port = validate_port(data.port)?;
        require_non_empty("target_ip", data.target_ip)?;
        data.target_ip
            .trim()
            .parse::<IpAddr>()
            .map_err(|err| DbError::validation("target_ip", err.to_string()))?;
        require_non_empty("state", data.state)?;

        let now = format_timestamp(self.now());
        sqlx::query(
            r#"
            INSERT INTO exposures (name, vmid, port, target_ip, url, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(data.name)
        .bind(data.vmid)
        .bind(i64::from(port))
        .bind(data.target_ip.trim())
        .bind(data.url)
        .bind(data.state)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| match DbError::from(err) {
            DbError::Conflict(_) => {
                DbError::Conflict(format!("exposure '{}' already exists", data.name))
            }
            other => other,
        })?;

        self.get_exposure(data.name).await
    }

    pub async fn get_exposure(&self, name: &str) -> DbResult<ExposureRecord> {
        let row = sqlx::query(&format!(
            "SELECT {EXPOSURE_COLUMNS} FROM exposures WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_exposure)
            .transpose()?
            .ok_or_else(|| DbError::not_found("exposure", name))
    }

    /// Newest first.
    pub async fn list_exposures(&self) -> DbResult<Vec<ExposureRecord>> {
        let sql = format!(
            "SELECT {EXPOSURE_COLUMNS} FROM exposures ORDER BY created_at DESC, name ASC"
        );
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_exposure(row)?);
        }
        Ok(out)
    }

    /// Ordered by name for stable output.
    pub async fn list_exposures_by_vmid(&self, vmid: i64) -> DbResult<Vec<ExposureRecord>> {
        let sql = format!(
            "SELECT {EXPOSURE_COLUMNS} FROM exposures WHERE vmid = ? ORDER BY name ASC"
        );
        let mut rows = sqlx::query(&sql).bind(vmid).fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_exposure(row)?);
        }
        Ok(out)
    }

    pub async fn update_exposure_state(&self, name: &str, state: &str) -> DbResult<()> {
        require_non_empty("state", state)?;
        let result = sqlx::query("UPDATE exposures SET state = ?, updated_at = ? WHERE name = ?")
            .bind(state)
            .bind(format_timestamp(self.now()))
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("exposure", name));
        }
        Ok(())
    }

    pub async fn delete_exposure(&self, name: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM exposures WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("exposure", name));
        }
        Ok(())
    }
}

fn validate_port(port: u32) -> DbResult<u16> {
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(DbError::validation(
            "port",
            format!("must be in 1..=65535, got {port}"),
        )),
    }
}

fn map_exposure(row: SqliteRow) -> DbResult<ExposureRecord> {
    let port: i64 = row.try_get("port")?;
    let port = u16::try_from(port).map_err(|_| DbError::Decode {
        column: "port",
        reason: format!("out of range: {port}"),
    })?;

    Ok(ExposureRecord {
        name: row.try_get("name")?,
        vmid: row.try_get("vmid")?,
        port,
        target_ip: row.try_get("target_ip")?,
        url: row.try_get("url")?,
        state: row.try_get("state")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
