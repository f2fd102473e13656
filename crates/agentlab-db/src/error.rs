use thiserror::Error;

/// Convenience alias used by every store operation.
pub type DbResult<T> = Result<T, DbError>;

/// Errors returned by the database layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    #[error("failed to decode column {column}: {reason}")]
    Decode { column: &'static str, reason: String },
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sqlx(sqlx::Error),
}

impl DbError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Error taxonomy string (`validation`, `not_found`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Validation { .. } => "validation",
            DbError::NotFound { .. } => "not_found",
            DbError::Conflict(_) => "conflict",
            DbError::ForeignKey(_) => "foreign_key",
            DbError::Decode { .. } | DbError::Migration { .. } | DbError::Sqlx(_) => "io",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let message = db_err.message();
            if message.contains("UNIQUE") || message.contains("PRIMARY KEY") {
                return DbError::Conflict(message.to_owned());
            }
            if message.contains("FOREIGN KEY") {
                return DbError::ForeignKey(message.to_owned());
            }
            if message.contains("CHECK constraint") {
                return DbError::Validation {
                    field: "row",
                    reason: message.to_owned(),
                };
            }
        }
        DbError::Sqlx(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(DbError::validation("vmid", "bad").kind(), "validation");
        assert_eq!(DbError::not_found("job", "x").kind(), "not_found");
        assert_eq!(DbError::Conflict("dup".into()).kind(), "conflict");
        assert_eq!(DbError::ForeignKey("fk".into()).kind(), "foreign_key");
        assert_eq!(DbError::Sqlx(sqlx::Error::RowNotFound).kind(), "io");
    }

    #[test]
    fn not_found_message_names_entity() {
        let err = DbError::not_found("workspace", "ws-1");
        assert_eq!(err.to_string(), "workspace 'ws-1' not found");
        assert!(err.is_not_found());
    }
}
