use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    clamp_limit, encode_optional_json, format_timestamp, parse_optional_json, parse_timestamp,
    require_non_empty, Database, DbResult,
};

/// Input payload for an event. Events are never updated once written.
#[derive(Debug, Clone, Default)]
pub struct NewEvent<'a> {
    pub kind: &'a str,
    pub sandbox_vmid: Option<i64>,
    pub job_id: Option<&'a str>,
    pub msg: Option<&'a str>,
    pub json: Option<&'a Value>,
}

impl<'a> NewEvent<'a> {
    pub fn new(kind: &'a str) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn sandbox(mut self, vmid: i64) -> Self {
        self.sandbox_vmid = Some(vmid);
        self
    }

    pub fn job(mut self, job_id: &'a str) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn msg(mut self, msg: &'a str) -> Self {
        self.msg = Some(msg);
        self
    }

    pub fn json(mut self, json: &'a Value) -> Self {
        self.json = Some(json);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub sandbox_vmid: Option<i64>,
    pub job_id: Option<String>,
    pub msg: Option<String>,
    pub json: Option<Value>,
}

/// Which slice of the log a tail query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    All,
    Sandbox(i64),
    Job(String),
}

const EVENT_COLUMNS: &str = "id, ts, kind, sandbox_vmid, job_id, msg, json";

impl Database {
    pub async fn record_event(&self, event: NewEvent<'_>) -> DbResult<EventRecord> {
        require_non_empty("kind", event.kind)?;

        let ts = self.now();
        let result = sqlx::query(
            r#"
            INSERT INTO events (ts, kind, sandbox_vmid, job_id, msg, json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(ts))
        .bind(event.kind)
        .bind(event.sandbox_vmid)
        .bind(event.job_id)
        .bind(event.msg)
        .bind(encode_optional_json(event.json))
        .execute(&self.pool)
        .await?;

        Ok(EventRecord {
            id: result.last_insert_rowid(),
            ts,
            kind: event.kind.to_owned(),
            sandbox_vmid: event.sandbox_vmid,
            job_id: event.job_id.map(str::to_owned),
            msg: event.msg.map(str::to_owned),
            json: event.json.cloned(),
        })
    }

    /// Events for a sandbox with `id > after_id`, ascending.
    pub async fn list_events_by_sandbox(
        &self,
        vmid: i64,
        after_id: i64,
        limit: u32,
    ) -> DbResult<Vec<EventRecord>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE sandbox_vmid = ? AND id > ? ORDER BY id ASC LIMIT ?"
        );
        let mut rows = sqlx::query(&sql)
            .bind(vmid)
            .bind(after_id)
            .bind(clamp_limit(limit))
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_event(row)?);
        }
        Ok(out)
    }

    /// Events for a job with `id > after_id`, ascending.
    pub async fn list_events_by_job(
        &self,
        job_id: &str,
        after_id: i64,
        limit: u32,
    ) -> DbResult<Vec<EventRecord>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE job_id = ? AND id > ? ORDER BY id ASC LIMIT ?"
        );
        let mut rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(after_id)
            .bind(clamp_limit(limit))
            .fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_event(row)?);
        }
        Ok(out)
    }

    /// The newest `limit` events in chronological order.
    pub async fn list_events_tail(
        &self,
        scope: &EventScope,
        limit: u32,
    ) -> DbResult<Vec<EventRecord>> {
        let limit = clamp_limit(limit);
        let query = match scope {
            EventScope::All => sqlx::query(
                "SELECT id, ts, kind, sandbox_vmid, job_id, msg, json FROM events ORDER BY id DESC LIMIT ?",
            )
            .bind(limit),
            EventScope::Sandbox(vmid) => sqlx::query(
                "SELECT id, ts, kind, sandbox_vmid, job_id, msg, json FROM events WHERE sandbox_vmid = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(*vmid)
            .bind(limit),
            EventScope::Job(job_id) => sqlx::query(
                "SELECT id, ts, kind, sandbox_vmid, job_id, msg, json FROM events WHERE job_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(job_id.as_str())
            .bind(limit),
        };

        let mut rows = query.fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_event(row)?);
        }
        out.reverse();
        Ok(out)
    }
}

fn map_event(row: SqliteRow) -> DbResult<EventRecord> {
    Ok(EventRecord {
        id: row.try_get("id")?,
        ts: parse_timestamp("ts", row.try_get("ts")?)?,
        kind: row.try_get("kind")?,
        sandbox_vmid: row.try_get("sandbox_vmid")?,
        job_id: row.try_get("job_id")?,
        msg: row.try_get("msg")?,
        json: parse_optional_json("json", row.try_get("json")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use serde_json::json;

    #[tokio::test]
    async fn cursor_pagination_is_strictly_increasing() {
        let (db, _clock) = setup_db().await;
        for i in 0..5 {
            db.record_event(NewEvent::new("sandbox.state").sandbox(100).msg(&format!("step {i}")))
                .await
                .unwrap();
        }
        db.record_event(NewEvent::new("other").sandbox(200)).await.unwrap();

        let first = db.list_events_by_sandbox(100, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let next = db
            .list_events_by_sandbox(100, first[1].id, 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|e| e.id > first[1].id));
        assert!(next.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn tail_returns_newest_in_chronological_order() {
        let (db, _clock) = setup_db().await;
        let payload = json!({"attempt": 1});
        for kind in ["a", "b", "c", "d"] {
            db.record_event(NewEvent::new(kind).job("job_t").json(&payload))
                .await
                .unwrap();
        }

        let tail = db
            .list_events_tail(&EventScope::Job("job_t".into()), 2)
            .await
            .unwrap();
        let kinds: Vec<_> = tail.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["c", "d"]);
        assert_eq!(tail[0].json, Some(payload));

        let all = db.list_events_tail(&EventScope::All, 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(db
            .list_events_by_job("job_t", 0, 10)
            .await
            .unwrap()
            .iter()
            .all(|e| e.job_id.as_deref() == Some("job_t")));
    }

    #[tokio::test]
    async fn empty_kind_is_rejected() {
        let (db, _clock) = setup_db().await;
        let err = db.record_event(NewEvent::new("  ")).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
