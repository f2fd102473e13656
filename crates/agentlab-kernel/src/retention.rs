//! Artifact retention: which stored artifacts may go, and removing them.

use std::{collections::HashMap, io::ErrorKind, time::Duration};

use agentlab_db::{Database, RetentionRecord, SandboxState};
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{chrono_duration, ControllerError};

const DEFAULT_GRACE: Duration = Duration::from_secs(168 * 60 * 60);

/// Grace windows per job profile.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub default_grace: Duration,
    pub profiles: HashMap<String, Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            default_grace: DEFAULT_GRACE,
            profiles: HashMap::new(),
        }
    }
}

impl RetentionPolicy {
    pub fn grace_for(&self, profile: &str) -> Duration {
        self.profiles
            .get(profile)
            .copied()
            .unwrap_or(self.default_grace)
    }

    /// Due when the job is terminal, its sandbox is gone or destroyed, and
    /// the artifact is older than the profile's grace window. Age counts from
    /// whichever is later: the upload or the job's last change.
    pub fn is_due(&self, record: &RetentionRecord, now: DateTime<Utc>) -> bool {
        if !record.job_status.is_terminal() {
            return false;
        }
        if !matches!(record.sandbox_state, None | Some(SandboxState::Destroyed)) {
            return false;
        }
        let since = record.artifact.created_at.max(record.job_updated_at);
        now - since > chrono_duration(self.grace_for(&record.job_profile))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Applies a [`RetentionPolicy`] to the store and the artifact directory.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    db: Database,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(db: Database, policy: RetentionPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Deletes every due artifact: row first, then the file. A file that is
    /// already gone is not a failure.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ControllerError> {
        let candidates = self.db.list_retention_candidates().await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for record in candidates.iter().filter(|r| self.policy.is_due(r, now)) {
            let artifact = &record.artifact;
            if let Err(err) = self.db.delete_artifact(artifact.id).await {
                warn!(artifact_id = artifact.id, error = %err, "failed to delete artifact row");
                report.failed += 1;
                continue;
            }
            match fs::remove_file(&artifact.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %artifact.path, "artifact file already gone");
                }
                Err(err) => {
                    warn!(path = %artifact.path, error = %err, "failed to remove artifact file");
                    report.failed += 1;
                    continue;
                }
            }
            report.deleted += 1;
        }

        if report.deleted > 0 {
            info!(deleted = report.deleted, examined = report.examined, "artifact retention sweep");
        }
        Ok(report)
    }
}
