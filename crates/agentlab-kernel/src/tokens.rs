use std::{fmt, time::Duration};

use agentlab_db::{hash_token, Database, IdGenerator};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{chrono_duration, ControllerError};

/// A freshly minted credential. The plaintext lives only in this value.
#[derive(Clone)]
pub struct IssuedToken {
    pub plaintext: String,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("plaintext", &"<redacted>")
            .field("hash", &self.hash)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints and checks bootstrap and artifact tokens. Only hashes reach the
/// store.
#[derive(Debug, Clone)]
pub struct TokenService {
    db: Database,
    ids: IdGenerator,
}

impl TokenService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ids: IdGenerator,
        }
    }

    pub async fn issue_bootstrap(
        &self,
        vmid: i64,
        ttl: Duration,
    ) -> Result<IssuedToken, ControllerError> {
        let token = self.mint(ttl)?;
        self.db
            .create_bootstrap_token(&token.hash, vmid, token.expires_at)
            .await?;
        debug!(vmid, expires_at = %token.expires_at, "bootstrap token issued");
        Ok(token)
    }

    pub async fn issue_artifact(
        &self,
        job_id: &str,
        vmid: i64,
        ttl: Duration,
    ) -> Result<IssuedToken, ControllerError> {
        let token = self.mint(ttl)?;
        self.db
            .create_artifact_token(&token.hash, job_id, vmid, token.expires_at)
            .await?;
        debug!(job_id, vmid, expires_at = %token.expires_at, "artifact token issued");
        Ok(token)
    }

    /// Consumes the bootstrap token for `vmid`. On failure the stored row is
    /// inspected so the caller learns why.
    pub async fn consume_bootstrap(
        &self,
        plaintext: &str,
        vmid: i64,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        if plaintext.trim().is_empty() {
            return Err(ControllerError::InvalidToken);
        }
        let hash = hash_token(plaintext);
        if self.db.consume_bootstrap_token(&hash, vmid, now).await? {
            return Ok(());
        }

        let record = match self.db.get_bootstrap_token(&hash).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Err(ControllerError::InvalidToken),
            Err(err) => return Err(err.into()),
        };
        if record.vmid != vmid {
            Err(ControllerError::InvalidToken)
        } else if record.consumed_at.is_some() {
            Err(ControllerError::AlreadyConsumed)
        } else {
            Err(ControllerError::Expired("bootstrap token"))
        }
    }

    fn mint(&self, ttl: Duration) -> Result<IssuedToken, ControllerError> {
        if ttl.is_zero() {
            return Err(ControllerError::validation("ttl", "must be positive"));
        }
        let plaintext = self.ids.token();
        let hash = hash_token(&plaintext);
        let expires_at = self.db.clock().now() + chrono_duration(ttl);
        Ok(IssuedToken {
            plaintext,
            hash,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_db;
    use agentlab_db::{Clock, NewSandbox};

    #[tokio::test]
    async fn bootstrap_consume_reports_reason() {
        let (db, clock) = setup_db().await;
        db.create_sandbox(NewSandbox::new(100, "sb", "default"))
            .await
            .unwrap();
        let tokens = TokenService::new(db.clone());
        let issued = tokens
            .issue_bootstrap(100, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(issued.hash, hash_token(&issued.plaintext));
        assert!(!format!("{issued:?}").contains(&issued.plaintext));

        let now = clock.now();
        assert!(matches!(
            tokens.consume_bootstrap(&issued.plaintext, 101, now).await,
            Err(ControllerError::InvalidToken)
        ));
        tokens
            .consume_bootstrap(&issued.plaintext, 100, now)
            .await
            .unwrap();
        assert!(matches!(
            tokens.consume_bootstrap(&issued.plaintext, 100, now).await,
            Err(ControllerError::AlreadyConsumed)
        ));
        assert!(matches!(
            tokens.consume_bootstrap("garbage", 100, now).await,
            Err(ControllerError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn expired_bootstrap_token_is_reported() {
        let (db, clock) = setup_db().await;
        db.create_sandbox(NewSandbox::new(100, "sb", "default"))
            .await
            .unwrap();
        let tokens = TokenService::new(db);
        let issued = tokens
            .issue_bootstrap(100, Duration::from_secs(60))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(2));
        let err = tokens
            .consume_bootstrap(&issued.plaintext, 100, clock.now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "expired");
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let (db, _clock) = setup_db().await;
        let tokens = TokenService::new(db);
        let err = tokens.issue_bootstrap(1, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
