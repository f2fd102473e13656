use std::{fmt, path::Path};

use agentlab_db::{hash_token, ArtifactRecord, JobStatus, NewArtifact, NewEvent};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::{Controller, ControllerError, Hypervisor};

const MAX_NAME_LEN: usize = 255;

/// One upload as received from a sandbox.
#[derive(Clone)]
pub struct ArtifactUpload {
    /// Artifact token plaintext.
    pub token: String,
    pub job_id: String,
    pub name: String,
    /// Declared length. Must match the body when present.
    pub size: Option<u64>,
    /// Client-computed hex digest of the body. Required.
    pub sha256: String,
    pub mime: Option<String>,
    pub content: Vec<u8>,
    /// The body is the job's final result document.
    pub final_result: bool,
}

impl fmt::Debug for ArtifactUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactUpload")
            .field("token", &"<redacted>")
            .field("job_id", &self.job_id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("sha256", &self.sha256)
            .field("mime", &self.mime)
            .field("content_len", &self.content.len())
            .field("final_result", &self.final_result)
            .finish()
    }
}

impl<H> Controller<H>
where
    H: Hypervisor,
{
    /// Checks the artifact token, size and digest, stores the blob under
    /// `<artifact_dir>/<job_id>/<name>` and records it. Names are unique per
    /// job and a stored blob is never replaced. A final-result upload also
    /// completes the job with the status named in the document; the upload
    /// still succeeds if that completion is refused.
    #[instrument(skip(self, upload), fields(job_id = %upload.job_id, name = %upload.name))]
    pub async fn accept_artifact_upload(
        &self,
        upload: ArtifactUpload,
    ) -> Result<ArtifactRecord, ControllerError> {
        let now = self.now();
        let token_hash = hash_token(&upload.token);
        let token = match self.db.get_artifact_token(&token_hash).await {
            Ok(token) => token,
            Err(err) if err.is_not_found() => return Err(ControllerError::InvalidToken),
            Err(err) => return Err(err.into()),
        };
        if token.is_expired(now) {
            return Err(ControllerError::Expired("artifact token"));
        }
        if token.job_id != upload.job_id {
            return Err(ControllerError::InvalidToken);
        }

        let actual = upload.content.len() as u64;
        if actual == 0 {
            return Err(ControllerError::validation("size", "artifact is empty"));
        }
        if let Some(declared) = upload.size {
            if declared != actual {
                return Err(ControllerError::validation(
                    "size",
                    format!("declared {declared} bytes, received {actual}"),
                ));
            }
        }
        if actual > self.config.artifact_max_bytes {
            return Err(ControllerError::TooLarge {
                limit: self.config.artifact_max_bytes,
                actual,
            });
        }

        let name = sanitize_component("name", &upload.name)?;
        let job_dir = sanitize_component("job_id", &upload.job_id)?;
        let expected = upload.sha256.trim();
        if expected.is_empty() {
            return Err(ControllerError::validation("sha256", "digest is required"));
        }
        let digest = hex::encode(Sha256::digest(&upload.content));
        if !expected.eq_ignore_ascii_case(&digest) {
            return Err(ControllerError::validation(
                "sha256",
                format!("expected {expected}, computed {digest}"),
            ));
        }
        let final_status = if upload.final_result {
            Some(parse_final_status(&upload.content)?)
        } else {
            None
        };

        // Cheap early refusal; the unique index settles concurrent uploads.
        let existing = self.db.list_artifacts_by_job(&upload.job_id).await?;
        if existing.iter().any(|artifact| artifact.name == name) {
            return Err(ControllerError::Conflict(format!(
                "artifact {name} already uploaded for job {}",
                upload.job_id
            )));
        }

        let dir = self.config.artifact_dir.join(job_dir);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| ControllerError::io(&dir, err))?;
        let path = dir.join(name);
        let staging = dir.join(format!(".{name}.{}.part", self.ids.nonce()));
        fs::write(&staging, &upload.content)
            .await
            .map_err(|err| ControllerError::io(&staging, err))?;

        // The row claims the name before the blob takes its final path, so a
        // losing upload never touches the winner's file.
        let path_text = path.to_string_lossy();
        let created = self
            .db
            .create_artifact(NewArtifact {
                job_id: &upload.job_id,
                vmid: token.vmid,
                name,
                path: &path_text,
                size_bytes: actual as i64,
                sha256: &digest,
                mime: upload.mime.as_deref(),
            })
            .await;
        let record = match created {
            Ok(record) => record,
            Err(err) => {
                remove_staged(&staging).await;
                return Err(err.into());
            }
        };
        if let Err(err) = fs::rename(&staging, &path).await {
            remove_staged(&staging).await;
            if let Err(db_err) = self.db.delete_artifact(record.id).await {
                warn!(artifact_id = record.id, error = %db_err, "failed to drop artifact row without blob");
            }
            return Err(ControllerError::io(&path, err));
        }

        self.db.touch_artifact_token(&token_hash, now).await?;
        if let Some(vmid) = token.vmid {
            if let Err(err) = self.db.touch_sandbox_last_used(vmid, now).await {
                warn!(vmid, error = %err, "failed to touch sandbox");
            }
        }
        info!(artifact_id = record.id, size = actual, "artifact stored");
        let detail = json!({ "artifact_id": record.id, "name": record.name, "size_bytes": actual });
        let mut event = NewEvent::new("artifact_uploaded")
            .job(&record.job_id)
            .json(&detail);
        if let Some(vmid) = token.vmid {
            event = event.sandbox(vmid);
        }
        self.emit(event).await;

        if let Some((status, document)) = final_status {
            if let Err(err) = self
                .complete_job(&upload.job_id, status, Some(document))
                .await
            {
                warn!(job_id = %upload.job_id, %status, error = %err, "final result stored but job not completed");
                let detail = json!({
                    "artifact_id": record.id,
                    "status": status.as_str(),
                    "error": err.to_result_json(),
                });
                let mut event = NewEvent::new("job_complete_failed")
                    .job(&record.job_id)
                    .json(&detail);
                if let Some(vmid) = token.vmid {
                    event = event.sandbox(vmid);
                }
                self.emit(event).await;
            }
        }
        Ok(record)
    }
}

/// Accepts a single path component: no separators, no leading dot.
fn sanitize_component<'a>(field: &'static str, raw: &'a str) -> Result<&'a str, ControllerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ControllerError::validation(field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ControllerError::validation(field, "too long"));
    }
    if value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        return Err(ControllerError::validation(
            field,
            format!("{value:?} is not a plain file name"),
        ));
    }
    Ok(value)
}

/// The result document is JSON with an optional `status`; absent means
/// `COMPLETED`.
fn parse_final_status(content: &[u8]) -> Result<(JobStatus, Value), ControllerError> {
    let document: Value = serde_json::from_slice(content)
        .map_err(|err| ControllerError::validation("result", err.to_string()))?;
    let status = match document.get("status").and_then(Value::as_str) {
        None => JobStatus::Completed,
        Some(raw) => raw.trim().to_ascii_uppercase().parse::<JobStatus>()?,
    };
    if !status.is_terminal() {
        return Err(ControllerError::validation(
            "result",
            format!("status {status} is not terminal"),
        ));
    }
    Ok((status, document))
}

async fn remove_staged(staging: &Path) {
    if let Err(err) = fs::remove_file(staging).await {
        warn!(path = %staging.display(), error = %err, "failed to remove staged upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{setup_db, test_config, FakeHypervisor},
        BootstrapHandoff, Controller, JobRequest,
    };
    use agentlab_db::{Clock, ManualClock, SandboxState};
    use std::sync::Arc;

    struct Running {
        controller: Controller<FakeHypervisor>,
        clock: ManualClock,
        handoff: BootstrapHandoff,
        _dir: tempfile::TempDir,
    }

    async fn running_job(max_bytes: u64) -> Running {
        let (db, clock) = setup_db().await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.artifact_dir = dir.path().join("artifacts");
        config.artifact_max_bytes = max_bytes;
        let hypervisor = Arc::new(FakeHypervisor::new());
        let controller = Controller::new(db, hypervisor.clone(), config);

        let launch = controller
            .start_job(JobRequest::new("https://example.com/r.git", "main", "default"))
            .await
            .unwrap();
        let token = hypervisor.last_bootstrap_token(launch.sandbox.vmid).unwrap();
        let handoff = controller
            .handle_bootstrap(launch.sandbox.vmid, &token, Some("10.77.0.5"))
            .await
            .unwrap();
        Running {
            controller,
            clock,
            handoff,
            _dir: dir,
        }
    }

    fn upload(handoff: &BootstrapHandoff, name: &str, content: &[u8]) -> ArtifactUpload {
        ArtifactUpload {
            token: handoff.artifact_token.clone(),
            job_id: handoff.job_id.clone(),
            name: name.to_string(),
            size: Some(content.len() as u64),
            sha256: hex::encode(Sha256::digest(content)),
            mime: Some("text/plain".into()),
            content: content.to_vec(),
            final_result: false,
        }
    }

    #[tokio::test]
    async fn upload_is_stored_and_recorded() {
        let run = running_job(1024).await;
        let record = run
            .controller
            .accept_artifact_upload(upload(&run.handoff, "out.txt", b"hello"))
            .await
            .unwrap();

        assert_eq!(record.size_bytes, 5);
        assert_eq!(record.vmid, Some(run.handoff.vmid));
        assert_eq!(std::fs::read(&record.path).unwrap(), b"hello");
        let token = run
            .controller
            .db()
            .get_artifact_token(&hash_token(&run.handoff.artifact_token))
            .await
            .unwrap();
        assert_eq!(token.last_used_at, Some(run.clock.now()));
    }

    #[tokio::test]
    async fn rejections_follow_taxonomy() {
        let run = running_job(8).await;
        let controller = &run.controller;

        let mut bad_token = upload(&run.handoff, "a.txt", b"abc");
        bad_token.token = "nope".into();
        assert!(matches!(
            controller.accept_artifact_upload(bad_token).await,
            Err(ControllerError::InvalidToken)
        ));

        let mut wrong_job = upload(&run.handoff, "a.txt", b"abc");
        wrong_job.job_id = "job_other".into();
        assert!(matches!(
            controller.accept_artifact_upload(wrong_job).await,
            Err(ControllerError::InvalidToken)
        ));

        let too_big = upload(&run.handoff, "a.txt", b"0123456789");
        assert!(matches!(
            controller.accept_artifact_upload(too_big).await,
            Err(ControllerError::TooLarge { limit: 8, actual: 10 })
        ));

        let mut tampered = upload(&run.handoff, "a.txt", b"abc");
        tampered.sha256 = hex::encode(Sha256::digest(b"abd"));
        assert_eq!(
            controller.accept_artifact_upload(tampered).await.unwrap_err().kind(),
            "validation"
        );

        let mut unsigned = upload(&run.handoff, "a.txt", b"abc");
        unsigned.sha256 = " ".into();
        assert!(matches!(
            controller.accept_artifact_upload(unsigned).await,
            Err(ControllerError::Validation { field: "sha256", .. })
        ));

        let traversal = upload(&run.handoff, "../escape", b"abc");
        assert_eq!(
            controller.accept_artifact_upload(traversal).await.unwrap_err().kind(),
            "validation"
        );

        controller
            .accept_artifact_upload(upload(&run.handoff, "a.txt", b"abc"))
            .await
            .unwrap();
        assert_eq!(
            controller
                .accept_artifact_upload(upload(&run.handoff, "a.txt", b"abc"))
                .await
                .unwrap_err()
                .kind(),
            "conflict"
        );
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let run = running_job(1024).await;
        run.clock.advance(chrono::Duration::days(2));
        let err = run
            .controller
            .accept_artifact_upload(upload(&run.handoff, "late.txt", b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "expired");
    }

    #[tokio::test]
    async fn final_result_completes_job() {
        let run = running_job(1024).await;
        let document = br#"{"status":"completed","summary":"all green"}"#;
        let mut final_upload = upload(&run.handoff, "result.json", document);
        final_upload.final_result = true;
        run.controller
            .accept_artifact_upload(final_upload)
            .await
            .unwrap();

        let db = run.controller.db();
        let job = db.get_job(&run.handoff.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_json.unwrap()["summary"], "all green");
        assert_eq!(
            db.get_sandbox(run.handoff.vmid).await.unwrap().state,
            SandboxState::Destroyed
        );
    }

    #[tokio::test]
    async fn concurrent_uploads_of_one_name_keep_a_single_blob() {
        let run = running_job(1024).await;
        let controller = &run.controller;
        let (first, second) = tokio::join!(
            controller.accept_artifact_upload(upload(&run.handoff, "log.txt", b"first")),
            controller.accept_artifact_upload(upload(&run.handoff, "log.txt", b"second")),
        );

        let (stored, refused) = match (first, second) {
            (Ok(record), Err(err)) => ((record, b"first".as_slice()), err),
            (Err(err), Ok(record)) => ((record, b"second".as_slice()), err),
            other => panic!("expected exactly one upload to win: {other:?}"),
        };
        assert_eq!(refused.kind(), "conflict");
        assert_eq!(std::fs::read(&stored.0.path).unwrap(), stored.1);

        let rows = controller
            .db()
            .list_artifacts_by_job(&run.handoff.job_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let job_dir = std::path::Path::new(&stored.0.path).parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(job_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("log.txt")]);
    }

    #[tokio::test]
    async fn duplicate_upload_leaves_stored_blob_alone() {
        let run = running_job(1024).await;
        let record = run
            .controller
            .accept_artifact_upload(upload(&run.handoff, "diff.patch", b"original"))
            .await
            .unwrap();
        let err = run
            .controller
            .accept_artifact_upload(upload(&run.handoff, "diff.patch", b"replacement"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(std::fs::read(&record.path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn final_result_for_finished_job_is_still_stored() {
        let run = running_job(1024).await;
        run.controller
            .complete_job(&run.handoff.job_id, JobStatus::Failed, None)
            .await
            .unwrap();

        let document = br#"{"status":"COMPLETED"}"#;
        let mut late = upload(&run.handoff, "result.json", document);
        late.final_result = true;
        let record = run.controller.accept_artifact_upload(late).await.unwrap();
        assert_eq!(std::fs::read(&record.path).unwrap(), document);

        let db = run.controller.db();
        assert_eq!(
            db.get_job(&run.handoff.job_id).await.unwrap().status,
            JobStatus::Failed
        );
        let events = db
            .list_events_tail(&agentlab_db::EventScope::Job(run.handoff.job_id.clone()), 50)
            .await
            .unwrap();
        let refused = events
            .iter()
            .find(|event| event.kind == "job_complete_failed")
            .expect("completion refusal recorded");
        assert_eq!(refused.json.as_ref().unwrap()["error"]["kind"], "conflict");
    }

    #[test]
    fn final_status_must_be_terminal() {
        assert!(parse_final_status(br#"{"status":"running"}"#).is_err());
        assert!(parse_final_status(b"not json").is_err());
        assert_eq!(
            parse_final_status(br#"{"status":"TIMEOUT"}"#).unwrap().0,
            JobStatus::Timeout
        );
    }
}
