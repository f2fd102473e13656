use std::{path::PathBuf, time::Duration};

use agentlab_db::DbError;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors surfaced by controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
    #[error("invalid or unknown token")]
    InvalidToken,
    #[error("bootstrap token already consumed")]
    AlreadyConsumed,
    #[error("{0} expired")]
    Expired(&'static str),
    #[error("artifact of {actual} bytes exceeds limit of {limit} bytes")]
    TooLarge { limit: u64, actual: u64 },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("hypervisor {operation} failed: {source:#}")]
    Adapter {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to decrypt secret bundle {bundle}: {source:#}")]
    Decrypt {
        bundle: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(DbError),
}

impl ControllerError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Taxonomy string recorded in `result_json.kind` and in events.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Validation { .. } | ControllerError::TooLarge { .. } => "validation",
            ControllerError::NotFound { .. } | ControllerError::InvalidToken => "not_found",
            ControllerError::Conflict(_) => "conflict",
            ControllerError::ForeignKey(_) => "foreign_key",
            ControllerError::AlreadyConsumed => "already_consumed",
            ControllerError::Expired(_) => "expired",
            ControllerError::Timeout { .. } => "timeout",
            ControllerError::Adapter { .. } => "adapter",
            ControllerError::Decrypt { .. } => "decrypt",
            ControllerError::Io { .. } => "io",
            ControllerError::Storage(err) => err.kind(),
        }
    }

    /// Worth another attempt on the next reconciler pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Timeout { .. } | ControllerError::Adapter { .. }
        )
    }

    /// The `{"error", "kind"}` document stored on a failed job.
    pub fn to_result_json(&self) -> Value {
        json!({
            "error": self.to_string(),
            "kind": self.kind(),
        })
    }
}

impl From<DbError> for ControllerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation { field, reason } => ControllerError::Validation { field, reason },
            DbError::NotFound { entity, key } => ControllerError::NotFound { entity, key },
            DbError::Conflict(msg) => ControllerError::Conflict(msg),
            DbError::ForeignKey(msg) => ControllerError::ForeignKey(msg),
            other => ControllerError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind() {
        let err = ControllerError::from(DbError::not_found("job", "job_1"));
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.to_string(), "job 'job_1' not found");

        let err = ControllerError::from(DbError::Conflict("dup".into()));
        assert_eq!(err.kind(), "conflict");

        let err = ControllerError::from(DbError::Decode {
            column: "ts",
            reason: "garbage".into(),
        });
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn result_json_carries_error_and_kind() {
        let err = ControllerError::Timeout {
            operation: "provision",
            after: Duration::from_secs(5),
        };
        let value = err.to_result_json();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["error"], "provision timed out after 5s");
        assert!(err.is_retryable());
    }
}
