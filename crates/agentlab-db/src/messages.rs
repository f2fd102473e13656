use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    clamp_limit, encode_optional_json, format_timestamp, parse_optional_json, parse_timestamp,
    require_non_empty, Database, DbResult,
};

/// `(scope_type, scope_id)` pair a message thread hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageScope {
    pub scope_type: String,
    pub scope_id: String,
}

impl MessageScope {
    pub fn new(scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    pub fn job(job_id: &str) -> Self {
        Self::new("job", job_id)
    }

    pub fn sandbox(vmid: i64) -> Self {
        Self::new("sandbox", vmid.to_string())
    }

    pub fn workspace(workspace_id: &str) -> Self {
        Self::new("workspace", workspace_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub scope: &'a MessageScope,
    pub author: Option<&'a str>,
    pub kind: &'a str,
    pub text: &'a str,
    pub json: Option<&'a Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub scope_type: String,
    pub scope_id: String,
    pub author: Option<String>,
    pub kind: String,
    pub text: String,
    pub json: Option<Value>,
}

impl Database {
    pub async fn append_message(&self, message: NewMessage<'_>) -> DbResult<MessageRecord> {
        require_non_empty("scope_type", &message.scope.scope_type)?;
        require_non_empty("scope_id", &message.scope.scope_id)?;

        let ts = self.now();
        let result = sqlx::query(
            r#"
            INSERT INTO messages (ts, scope_type, scope_id, author, kind, text, json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(ts))
        .bind(message.scope.scope_type.as_str())
        .bind(message.scope.scope_id.as_str())
        .bind(message.author)
        .bind(message.kind)
        .bind(message.text)
        .bind(encode_optional_json(message.json))
        .execute(&self.pool)
        .await?;

        Ok(MessageRecord {
            id: result.last_insert_rowid(),
            ts,
            scope_type: message.scope.scope_type.clone(),
            scope_id: message.scope.scope_id.clone(),
            author: message.author.map(str::to_owned),
            kind: message.kind.to_owned(),
            text: message.text.to_owned(),
            json: message.json.cloned(),
        })
    }

    /// Messages in a scope with `id > after_id`, ascending.
    pub async fn list_messages(
        &self,
        scope: &MessageScope,
        after_id: i64,
        limit: u32,
    ) -> DbResult<Vec<MessageRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT id, ts, scope_type, scope_id, author, kind, text, json FROM messages
            WHERE scope_type = ? AND scope_id = ? AND id > ?
            ORDER BY id ASC LIMIT ?
            "#,
        )
        .bind(scope.scope_type.as_str())
        .bind(scope.scope_id.as_str())
        .bind(after_id)
        .bind(clamp_limit(limit))
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_message(row)?);
        }
        Ok(out)
    }

    /// The newest `limit` messages of a scope, oldest first.
    pub async fn list_messages_tail(
        &self,
        scope: &MessageScope,
        limit: u32,
    ) -> DbResult<Vec<MessageRecord>> {
        let mut rows = sqlx::query(
            r#"
            SELECT id, ts, scope_type, scope_id, author, kind, text, json FROM messages
            WHERE scope_type = ? AND scope_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(scope.scope_type.as_str())
        .bind(scope.scope_id.as_str())
        .bind(clamp_limit(limit))
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_message(row)?);
        }
        out.reverse();
        Ok(out)
    }
}

fn map_message(row: SqliteRow) -> DbResult<MessageRecord> {
    Ok(MessageRecord {
        id: row.try_get("id")?,
        ts: parse_timestamp("ts", row.try_get("ts")?)?,
        scope_type: row.try_get("scope_type")?,
        scope_id: row.try_get("scope_id")?,
        author: row.try_get("author")?,
        kind: row.try_get("kind")?,
        text: row.try_get("text")?,
        json: parse_optional_json("json", row.try_get("json")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    async fn post(db: &Database, scope: &MessageScope, text: &str) -> MessageRecord {
        db.append_message(NewMessage {
            scope,
            author: Some("agent"),
            kind: "note",
            text,
            json: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn messages_are_scoped_and_ordered() {
        let (db, _clock) = setup_db().await;
        let job = MessageScope::job("job_m");
        let sandbox = MessageScope::sandbox(100);

        post(&db, &job, "one").await;
        post(&db, &sandbox, "elsewhere").await;
        let second = post(&db, &job, "two").await;
        post(&db, &job, "three").await;

        let after = db.list_messages(&job, second.id, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].text, "three");

        let tail: Vec<_> = db
            .list_messages_tail(&job, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(tail, vec!["two", "three"]);

        let sandbox_msgs = db.list_messages(&sandbox, 0, 0).await.unwrap();
        assert_eq!(sandbox_msgs.len(), 1);
        assert_eq!(sandbox_msgs[0].scope_id, "100");
    }

    #[tokio::test]
    async fn empty_scope_is_rejected() {
        let (db, _clock) = setup_db().await;
        let scope = MessageScope::new("workspace", "");
        let err = db
            .append_message(NewMessage {
                scope: &scope,
                author: None,
                kind: "note",
                text: "hi",
                json: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
