//! AgentLab controller kernel.
//!
//! Drives one job at a time through its sandbox lifecycle on top of the
//! `agentlab-db` store: workspace lease, VMID allocation, bootstrap token,
//! provisioning through a [`Hypervisor`] adapter, the bootstrap handoff,
//! completion and the destroy path. Every cross-task decision is a
//! compare-and-swap in the store; nothing here holds an in-process lock for
//! correctness. The periodic [`Reconciler`] re-enters the destroy path for
//! anything a failed flow left behind.

mod artifacts;
mod error;
pub mod hypervisor;
pub mod process;
mod reconciler;
mod retention;
pub mod secrets;
mod tokens;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::{fmt, future::Future, path::PathBuf, sync::Arc, time::Duration};

use agentlab_db::{
    Database, IdGenerator, JobRecord, JobStatus, NewEvent, NewJob, NewSandbox, SandboxRecord,
    SandboxState, WorkspaceRecord,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

pub use artifacts::ArtifactUpload;
pub use error::ControllerError;
pub use hypervisor::{Hypervisor, HypervisorBackend, ProvisionRequest};
pub use reconciler::{ReconcileReport, Reconciler};
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport};
pub use secrets::SecretStore;
pub use tokens::{IssuedToken, TokenService};

const DEFAULT_ARTIFACT_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// Upper bound applied when converting configured TTLs, so `now + ttl`
/// cannot overflow.
const MAX_TTL_DAYS: i64 = 365 * 100;

/// Knobs the controller reads on every flow.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL the guest uses to reach the bootstrap listener.
    pub controller_url: Option<String>,
    /// URL handed to the guest for artifact uploads.
    pub artifact_upload_url: Option<String>,
    /// Root under which artifact blobs are stored, one directory per job.
    pub artifact_dir: PathBuf,
    pub artifact_max_bytes: u64,
    pub artifact_token_ttl: Duration,
    pub bootstrap_token_ttl: Duration,
    /// Bound on each individual hypervisor call. Zero disables it.
    pub command_timeout: Duration,
    /// Bound on clone-and-start, and on how long a sandbox may sit in
    /// `PROVISIONING`/`BOOTING` before the reconciler times it out.
    pub provisioning_timeout: Duration,
    pub secrets_bundle: Option<String>,
    /// Workspace lease length for jobs without a TTL.
    pub workspace_lease_ttl: Duration,
    pub vmid_allocation_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_url: None,
            artifact_upload_url: None,
            artifact_dir: PathBuf::from("./artifacts"),
            artifact_max_bytes: DEFAULT_ARTIFACT_MAX_BYTES,
            artifact_token_ttl: Duration::from_secs(24 * 60 * 60),
            bootstrap_token_ttl: Duration::from_secs(10 * 60),
            command_timeout: Duration::from_secs(120),
            provisioning_timeout: Duration::from_secs(10 * 60),
            secrets_bundle: None,
            workspace_lease_ttl: Duration::from_secs(8 * 60 * 60),
            vmid_allocation_attempts: 3,
        }
    }
}

/// What a caller asks the controller to run.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub repo_url: String,
    pub git_ref: String,
    pub profile: String,
    pub task: Option<String>,
    pub mode: Option<String>,
    pub ttl_minutes: Option<u32>,
    pub keepalive: bool,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
}

impl JobRequest {
    pub fn new(
        repo_url: impl Into<String>,
        git_ref: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            git_ref: git_ref.into(),
            profile: profile.into(),
            ..Self::default()
        }
    }
}

/// Rows as they stand once the sandbox has been handed to the hypervisor.
#[derive(Debug, Clone)]
pub struct JobLaunch {
    pub job: JobRecord,
    pub sandbox: SandboxRecord,
}

/// Payload returned to a guest that presented a valid bootstrap token.
#[derive(Clone, Serialize)]
pub struct BootstrapHandoff {
    pub job_id: String,
    pub vmid: i64,
    pub repo_url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub profile: String,
    pub task: Option<String>,
    pub mode: Option<String>,
    pub keepalive: bool,
    pub artifact_upload_url: Option<String>,
    pub artifact_token: String,
    pub artifact_token_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Value>,
}

impl fmt::Debug for BootstrapHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapHandoff")
            .field("job_id", &self.job_id)
            .field("vmid", &self.vmid)
            .field("repo_url", &self.repo_url)
            .field("git_ref", &self.git_ref)
            .field("profile", &self.profile)
            .field("artifact_upload_url", &self.artifact_upload_url)
            .field("artifact_token", &"<redacted>")
            .field("artifact_token_expires_at", &self.artifact_token_expires_at)
            .field("secrets", &self.secrets.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Why a sandbox is being torn down. Decides the intermediate state and how
/// a still-open job is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Completed,
    Stopped,
    Failed,
    LeaseExpired,
    Timeout,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::Completed => "completed",
            DestroyReason::Stopped => "stopped",
            DestroyReason::Failed => "failed",
            DestroyReason::LeaseExpired => "lease_expired",
            DestroyReason::Timeout => "timeout",
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, DestroyReason::LeaseExpired | DestroyReason::Timeout)
    }

    /// Next hop from `state` toward `STOPPED`. `None` once there.
    fn next_state(&self, state: SandboxState) -> Option<SandboxState> {
        use SandboxState::*;
        let next = match state {
            Requested | Provisioning => Failed,
            Booting if self.is_timeout() => Timeout,
            Booting => Failed,
            Running if self.is_timeout() => Timeout,
            Running if *self == DestroyReason::Failed => Failed,
            Ready | Running | Completed | Failed | Timeout => Stopped,
            Stopped | Destroyed => return None,
        };
        Some(next)
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease taken on behalf of a job before its sandbox exists.
#[derive(Debug, Clone)]
struct HeldLease {
    workspace: WorkspaceRecord,
    owner: String,
    nonce: String,
}

pub(crate) fn chrono_duration(value: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(MAX_TTL_DAYS);
    chrono::Duration::from_std(value).map_or(cap, |d| d.min(cap))
}

/// Awaits a hypervisor call under `limit` (zero means unbounded), mapping
/// failures into the controller taxonomy.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, ControllerError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let outcome = if limit.is_zero() {
        call.await
    } else {
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ControllerError::Timeout {
                operation,
                after: limit,
            })?
    };
    outcome.map_err(|source| ControllerError::Adapter { operation, source })
}

fn job_owner(job_id: &str) -> String {
    format!("job:{job_id}")
}

fn volume_reference(workspace: &WorkspaceRecord) -> String {
    if workspace.volume_id.contains(':') {
        workspace.volume_id.clone()
    } else {
        format!("{}:{}", workspace.storage, workspace.volume_id)
    }
}

/// The job/sandbox coordinator.
pub struct Controller<H>
where
    H: Hypervisor,
{
    db: Database,
    hypervisor: Arc<H>,
    tokens: TokenService,
    secrets: Option<Arc<SecretStore>>,
    ids: IdGenerator,
    config: ControllerConfig,
}

impl<H> Clone for Controller<H>
where
    H: Hypervisor,
{
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            hypervisor: self.hypervisor.clone(),
            tokens: self.tokens.clone(),
            secrets: self.secrets.clone(),
            ids: self.ids.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H> Controller<H>
where
    H: Hypervisor,
{
    pub fn new(db: Database, hypervisor: Arc<H>, config: ControllerConfig) -> Self {
        Self {
            tokens: TokenService::new(db.clone()),
            db,
            hypervisor,
            secrets: None,
            ids: IdGenerator,
            config,
        }
    }

    pub fn with_secrets(mut self, store: SecretStore) -> Self {
        self.secrets = Some(Arc::new(store));
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.db.clock().now()
    }

    /// Events are a log, not a precondition; a failed write never aborts a
    /// flow.
    pub(crate) async fn emit(&self, event: NewEvent<'_>) {
        let kind = event.kind;
        if let Err(err) = self.db.record_event(event).await {
            warn!(kind, error = %err, "failed to record event");
        }
    }

    /// Creates the job and walks it up to `BOOTING`. On failure the job is
    /// left `FAILED` with the error in `result_json` and whatever was
    /// allocated has been released.
    #[instrument(skip(self, request), fields(profile = %request.profile))]
    pub async fn start_job(&self, request: JobRequest) -> Result<JobLaunch, ControllerError> {
        let job_id = self.ids.job_id();
        let job = self
            .db
            .create_job(NewJob {
                id: &job_id,
                repo_url: &request.repo_url,
                git_ref: &request.git_ref,
                profile: &request.profile,
                status: JobStatus::Queued,
                task: request.task.as_deref(),
                mode: request.mode.as_deref(),
                ttl_minutes: request.ttl_minutes,
                keepalive: request.keepalive,
                workspace_id: request.workspace_id.as_deref(),
                session_id: request.session_id.as_deref(),
            })
            .await?;
        info!(job_id = %job.id, "job queued");
        self.emit(NewEvent::new("job_created").job(&job.id)).await;

        match self.launch(&job).await {
            Ok(launch) => Ok(launch),
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "job launch failed");
                self.fail_job(&job.id, JobStatus::Failed, &err).await;
                Err(err)
            }
        }
    }

    async fn launch(&self, job: &JobRecord) -> Result<JobLaunch, ControllerError> {
        let lease = match &job.workspace_id {
            Some(workspace_id) => Some(self.acquire_workspace(job, workspace_id).await?),
            None => None,
        };

        let sandbox = match self.allocate_sandbox(job).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                self.release_held_lease(lease.as_ref()).await;
                return Err(err);
            }
        };

        match self.provision(job, &sandbox, lease.as_ref()).await {
            Ok(sandbox) => {
                let job = self.db.get_job(&job.id).await?;
                Ok(JobLaunch { job, sandbox })
            }
            Err(err) => {
                self.fail_job(&job.id, JobStatus::Failed, &err).await;
                if let Err(destroy_err) = self.destroy_sandbox(sandbox.vmid, DestroyReason::Failed).await
                {
                    warn!(vmid = sandbox.vmid, error = %destroy_err, "cleanup after failed launch incomplete");
                }
                self.release_held_lease(lease.as_ref()).await;
                Err(err)
            }
        }
    }

    async fn acquire_workspace(
        &self,
        job: &JobRecord,
        workspace_id: &str,
    ) -> Result<HeldLease, ControllerError> {
        let owner = job_owner(&job.id);
        let nonce = self.ids.nonce();
        let ttl = job
            .ttl_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
            .unwrap_or(self.config.workspace_lease_ttl);
        let expires_at = self.now() + chrono_duration(ttl);

        if !self
            .db
            .try_acquire_workspace_lease(workspace_id, &owner, &nonce, expires_at)
            .await?
        {
            return Err(ControllerError::Conflict(format!(
                "workspace {workspace_id} is leased by another job"
            )));
        }
        let workspace = self.db.get_workspace(workspace_id).await?;
        debug!(workspace_id, %expires_at, "workspace lease acquired");
        self.emit(NewEvent::new("workspace_leased").job(&job.id).msg(workspace_id))
            .await;
        Ok(HeldLease {
            workspace,
            owner,
            nonce,
        })
    }

    async fn release_held_lease(&self, lease: Option<&HeldLease>) {
        let Some(lease) = lease else { return };
        match self
            .db
            .release_workspace_lease(&lease.workspace.id, &lease.owner, &lease.nonce)
            .await
        {
            Ok(released) => debug!(workspace_id = %lease.workspace.id, released, "workspace lease released"),
            Err(err) => warn!(workspace_id = %lease.workspace.id, error = %err, "failed to release workspace lease"),
        }
    }

    /// Asks the hypervisor for a VMID and registers the sandbox. A VMID that
    /// is already registered is a collision; ask again.
    async fn allocate_sandbox(&self, job: &JobRecord) -> Result<SandboxRecord, ControllerError> {
        let lease_expires_at = job
            .ttl_minutes
            .map(|minutes| self.now() + chrono::Duration::minutes(i64::from(minutes)));
        let attempts = self.config.vmid_allocation_attempts.max(1);

        let mut last_conflict = None;
        for attempt in 1..=attempts {
            let vmid = bounded(
                "next_vmid",
                self.config.command_timeout,
                self.hypervisor.next_vmid(),
            )
            .await?;
            let name = format!("agentlab-{vmid}");
            let created = self
                .db
                .create_sandbox(NewSandbox {
                    vmid,
                    name: &name,
                    profile: &job.profile,
                    state: SandboxState::Requested,
                    keepalive: job.keepalive,
                    lease_expires_at,
                    workspace_id: None,
                })
                .await;
            match created {
                Ok(sandbox) => {
                    self.db.update_job_sandbox(&job.id, vmid).await?;
                    info!(job_id = %job.id, vmid, "sandbox registered");
                    self.emit(NewEvent::new("sandbox_created").sandbox(vmid).job(&job.id))
                        .await;
                    return Ok(sandbox);
                }
                Err(err) if err.is_conflict() => {
                    warn!(vmid, attempt, "vmid already registered, retrying allocation");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_conflict.map_or_else(
            || ControllerError::Conflict("vmid allocation exhausted".to_string()),
            ControllerError::from,
        ))
    }

    async fn provision(
        &self,
        job: &JobRecord,
        sandbox: &SandboxRecord,
        lease: Option<&HeldLease>,
    ) -> Result<SandboxRecord, ControllerError> {
        let vmid = sandbox.vmid;

        if let Some(lease) = lease {
            if !self.db.attach_workspace(&lease.workspace.id, vmid).await? {
                return Err(ControllerError::Conflict(format!(
                    "workspace {} is attached to another sandbox",
                    lease.workspace.id
                )));
            }
            self.db
                .update_sandbox_workspace(vmid, Some(&lease.workspace.id))
                .await?;
        }
        if let Some(session_id) = &job.session_id {
            if let Err(err) = self.db.update_session_vmid(session_id, Some(vmid)).await {
                warn!(session_id = %session_id, vmid, error = %err, "failed to record session sandbox");
            }
        }

        let bootstrap = self
            .tokens
            .issue_bootstrap(vmid, self.config.bootstrap_token_ttl)
            .await?;

        self.transition(vmid, SandboxState::Requested, SandboxState::Provisioning)
            .await?;
        let request = ProvisionRequest {
            vmid,
            name: sandbox.name.clone(),
            profile: sandbox.profile.clone(),
            job_id: job.id.clone(),
            bootstrap_token: bootstrap.plaintext,
            controller_url: self.config.controller_url.clone(),
            workspace_volume: lease.map(|lease| volume_reference(&lease.workspace)),
        };
        bounded(
            "provision",
            self.config.provisioning_timeout,
            self.hypervisor.provision(&request),
        )
        .await?;

        self.transition(vmid, SandboxState::Provisioning, SandboxState::Booting)
            .await?;
        info!(job_id = %job.id, vmid, "sandbox booting");
        Ok(self.db.get_sandbox(vmid).await?)
    }

    /// CAS that treats a lost race as a conflict and logs the hop.
    async fn transition(
        &self,
        vmid: i64,
        from: SandboxState,
        to: SandboxState,
    ) -> Result<(), ControllerError> {
        if !self.db.transition_sandbox(vmid, from, to).await? {
            let current = self.db.get_sandbox(vmid).await?.state;
            return Err(ControllerError::Conflict(format!(
                "sandbox {vmid} is {current}, expected {from}"
            )));
        }
        let kind = format!("sandbox_{}", to.as_str().to_ascii_lowercase());
        self.emit(NewEvent::new(&kind).sandbox(vmid)).await;
        Ok(())
    }

    /// Trades a bootstrap token for the job payload and moves the sandbox to
    /// `RUNNING`. The token is spent even if a later step fails.
    #[instrument(skip(self, token, ip))]
    pub async fn handle_bootstrap(
        &self,
        vmid: i64,
        token: &str,
        ip: Option<&str>,
    ) -> Result<BootstrapHandoff, ControllerError> {
        let now = self.now();
        self.tokens.consume_bootstrap(token, vmid, now).await?;
        self.emit(NewEvent::new("bootstrap_consumed").sandbox(vmid)).await;

        let job = self.db.get_job_by_sandbox_vmid(vmid).await?;
        match self.hand_off(&job, vmid, ip).await {
            Ok(handoff) => {
                info!(job_id = %job.id, vmid, "sandbox running");
                Ok(handoff)
            }
            Err(err) => {
                warn!(job_id = %job.id, vmid, error = %err, "bootstrap handoff failed");
                self.fail_job(&job.id, JobStatus::Failed, &err).await;
                if let Err(destroy_err) = self.destroy_sandbox(vmid, DestroyReason::Failed).await {
                    warn!(vmid, error = %destroy_err, "cleanup after failed bootstrap incomplete");
                }
                Err(err)
            }
        }
    }

    async fn hand_off(
        &self,
        job: &JobRecord,
        vmid: i64,
        ip: Option<&str>,
    ) -> Result<BootstrapHandoff, ControllerError> {
        let secrets = match (&self.secrets, &self.config.secrets_bundle) {
            (Some(store), Some(bundle)) => Some(store.load(bundle).await?),
            _ => None,
        };
        let artifact = self
            .tokens
            .issue_artifact(&job.id, vmid, self.config.artifact_token_ttl)
            .await?;

        if let Some(ip) = ip.filter(|ip| !ip.trim().is_empty()) {
            self.db.update_sandbox_ip(vmid, ip).await?;
        }
        self.transition(vmid, SandboxState::Booting, SandboxState::Ready)
            .await?;

        if !self
            .db
            .transition_job_status(&job.id, JobStatus::Queued, JobStatus::Running)
            .await?
        {
            return Err(ControllerError::Conflict(format!(
                "job {} is no longer queued",
                job.id
            )));
        }
        self.emit(NewEvent::new("job_running").job(&job.id).sandbox(vmid))
            .await;
        self.transition(vmid, SandboxState::Ready, SandboxState::Running)
            .await?;
        self.db.touch_sandbox_last_used(vmid, self.now()).await?;

        Ok(BootstrapHandoff {
            job_id: job.id.clone(),
            vmid,
            repo_url: job.repo_url.clone(),
            git_ref: job.git_ref.clone(),
            profile: job.profile.clone(),
            task: job.task.clone(),
            mode: job.mode.clone(),
            keepalive: job.keepalive,
            artifact_upload_url: self.config.artifact_upload_url.clone(),
            artifact_token: artifact.plaintext,
            artifact_token_expires_at: artifact.expires_at,
            secrets,
        })
    }

    /// Records the final status and result, then tears the sandbox down
    /// unless the job asked to keep it.
    #[instrument(skip(self, result))]
    pub async fn complete_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<JobRecord, ControllerError> {
        if !status.is_terminal() {
            return Err(ControllerError::validation(
                "status",
                format!("{status} is not a terminal status"),
            ));
        }
        let job = self.db.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(ControllerError::Conflict(format!(
                "job {job_id} already {}",
                job.status
            )));
        }
        if !self
            .db
            .transition_job_status(job_id, job.status, status)
            .await?
        {
            return Err(ControllerError::Conflict(format!(
                "job {job_id} changed status concurrently"
            )));
        }
        self.db
            .update_job_result(job_id, status, result.as_ref())
            .await?;
        info!(job_id, %status, "job finished");
        self.emit(
            NewEvent::new("job_completed")
                .job(job_id)
                .msg(status.as_str()),
        )
        .await;

        if let Some(vmid) = job.sandbox_vmid {
            let target = match status {
                JobStatus::Completed => SandboxState::Completed,
                JobStatus::Timeout => SandboxState::Timeout,
                _ => SandboxState::Failed,
            };
            if self
                .db
                .transition_sandbox(vmid, SandboxState::Running, target)
                .await?
            {
                let kind = format!("sandbox_{}", target.as_str().to_ascii_lowercase());
                self.emit(NewEvent::new(&kind).sandbox(vmid).job(job_id))
                    .await;
            }

            if !job.keepalive {
                let reason = match status {
                    JobStatus::Completed => DestroyReason::Completed,
                    JobStatus::Timeout => DestroyReason::Timeout,
                    _ => DestroyReason::Failed,
                };
                if let Err(err) = self.destroy_sandbox(vmid, reason).await {
                    warn!(job_id, vmid, error = %err, "destroy after completion failed; reconciler will retry");
                }
            }
        }

        Ok(self.db.get_job(job_id).await?)
    }

    /// Operator stop: fail the job if it is still open and destroy its
    /// sandbox regardless of keepalive.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, job_id: &str) -> Result<JobRecord, ControllerError> {
        let job = self.db.get_job(job_id).await?;
        if !job.status.is_terminal()
            && self
                .db
                .transition_job_status(job_id, job.status, JobStatus::Failed)
                .await?
        {
            let result = json!({ "error": "stopped", "kind": "stopped" });
            self.db
                .update_job_result(job_id, JobStatus::Failed, Some(&result))
                .await?;
            self.emit(NewEvent::new("job_stopped").job(job_id)).await;
        }
        if let Some(vmid) = job.sandbox_vmid {
            self.destroy_sandbox(vmid, DestroyReason::Stopped).await?;
        }
        Ok(self.db.get_job(job_id).await?)
    }

    /// Drives the sandbox to `DESTROYED`: settle into `STOPPED`, ask the
    /// hypervisor to destroy, CAS to `DESTROYED`, then detach the workspace
    /// and release the job's lease. Safe to call repeatedly. When the
    /// hypervisor refuses, the sandbox lease is expired so the reconciler
    /// picks it up again; the workspace stays attached until a destroy goes
    /// through, since the VM may still hold the disk.
    #[instrument(skip(self))]
    pub async fn destroy_sandbox(
        &self,
        vmid: i64,
        reason: DestroyReason,
    ) -> Result<SandboxRecord, ControllerError> {
        let sandbox = self.db.get_sandbox(vmid).await?;
        if sandbox.state == SandboxState::Destroyed {
            debug!(vmid, "sandbox already destroyed");
            return Ok(sandbox);
        }
        let job = match self.db.get_job_by_sandbox_vmid(vmid).await {
            Ok(job) => Some(job),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let mut state = sandbox.state;
        while let Some(next) = reason.next_state(state) {
            if self.db.transition_sandbox(vmid, state, next).await? {
                let kind = format!("sandbox_{}", next.as_str().to_ascii_lowercase());
                self.emit(NewEvent::new(&kind).sandbox(vmid).msg(reason.as_str()))
                    .await;
                state = next;
            } else {
                state = self.db.get_sandbox(vmid).await?.state;
            }
        }
        if state == SandboxState::Destroyed {
            return Ok(self.db.get_sandbox(vmid).await?);
        }

        // A sandbox that never left REQUESTED has no VM behind it.
        if sandbox.state != SandboxState::Requested {
            self.tear_down_vm(&sandbox).await?;
        }

        if !self
            .db
            .transition_sandbox(vmid, SandboxState::Stopped, SandboxState::Destroyed)
            .await?
        {
            debug!(vmid, "sandbox destroyed concurrently");
        }
        info!(vmid, %reason, "sandbox destroyed");
        self.emit(
            NewEvent::new("sandbox_destroyed")
                .sandbox(vmid)
                .msg(reason.as_str()),
        )
        .await;

        self.release_workspace(&sandbox, job.as_ref()).await;
        if let Some(job) = &job {
            self.close_job(job, vmid, reason).await;
        }
        Ok(self.db.get_sandbox(vmid).await?)
    }

    async fn tear_down_vm(&self, sandbox: &SandboxRecord) -> Result<(), ControllerError> {
        let vmid = sandbox.vmid;
        if matches!(
            sandbox.state,
            SandboxState::Booting | SandboxState::Ready | SandboxState::Running
        ) {
            if let Err(err) = bounded(
                "stop",
                self.config.command_timeout,
                self.hypervisor.stop(vmid),
            )
            .await
            {
                debug!(vmid, error = %err, "stop before destroy failed");
            }
        }

        if let Err(err) = bounded(
            "destroy",
            self.config.command_timeout,
            self.hypervisor.destroy(vmid),
        )
        .await
        {
            warn!(vmid, error = %err, "hypervisor destroy failed");
            if let Err(lease_err) = self.db.update_sandbox_lease(vmid, Some(self.now())).await {
                warn!(vmid, error = %lease_err, "failed to expire sandbox lease for retry");
            }
            let detail = err.to_result_json();
            self.emit(
                NewEvent::new("sandbox_destroy_failed")
                    .sandbox(vmid)
                    .json(&detail),
            )
            .await;
            return Err(err);
        }
        Ok(())
    }

    async fn release_workspace(&self, sandbox: &SandboxRecord, job: Option<&JobRecord>) {
        let vmid = sandbox.vmid;
        if let Some(workspace_id) = &sandbox.workspace_id {
            match self.db.detach_workspace(workspace_id, vmid).await {
                Ok(detached) => debug!(workspace_id = %workspace_id, vmid, detached, "workspace detached"),
                Err(err) => warn!(workspace_id = %workspace_id, vmid, error = %err, "failed to detach workspace"),
            }
            if let Err(err) = self.db.update_sandbox_workspace(vmid, None).await {
                warn!(vmid, error = %err, "failed to clear sandbox workspace");
            }
        }

        let Some(job) = job else { return };
        if let Some(session_id) = &job.session_id {
            if let Err(err) = self.db.update_session_vmid(session_id, None).await {
                warn!(session_id = %session_id, error = %err, "failed to clear session sandbox");
            }
        }
        let Some(workspace_id) = &job.workspace_id else {
            return;
        };
        let owner = job_owner(&job.id);
        let lease = match self.db.get_workspace(workspace_id).await {
            Ok(workspace) => workspace.lease,
            Err(err) => {
                warn!(workspace_id = %workspace_id, error = %err, "failed to load workspace");
                return;
            }
        };
        let Some(lease) = lease.filter(|lease| lease.owner == owner) else {
            return;
        };
        match self
            .db
            .release_workspace_lease(workspace_id, &owner, &lease.nonce)
            .await
        {
            Ok(true) => {
                self.emit(
                    NewEvent::new("workspace_released")
                        .job(&job.id)
                        .msg(workspace_id),
                )
                .await
            }
            Ok(false) => debug!(workspace_id = %workspace_id, "workspace lease changed hands"),
            Err(err) => warn!(workspace_id = %workspace_id, error = %err, "failed to release workspace lease"),
        }
    }

    /// A job whose sandbox is gone cannot finish on its own.
    async fn close_job(&self, job: &JobRecord, vmid: i64, reason: DestroyReason) {
        let err = match reason {
            DestroyReason::LeaseExpired => ControllerError::Expired("sandbox lease"),
            DestroyReason::Timeout => ControllerError::Timeout {
                operation: "provisioning",
                after: self.config.provisioning_timeout,
            },
            _ => ControllerError::Conflict(format!("sandbox {vmid} destroyed ({reason})")),
        };
        let status = if reason.is_timeout() {
            JobStatus::Timeout
        } else {
            JobStatus::Failed
        };
        self.fail_job(&job.id, status, &err).await;
    }

    /// Moves a still-open job to `status` with the error as its result. A
    /// lost race or an already-terminal job is left alone.
    pub(crate) async fn fail_job(&self, job_id: &str, status: JobStatus, err: &ControllerError) {
        let job = match self.db.get_job(job_id).await {
            Ok(job) => job,
            Err(load_err) => {
                warn!(job_id, error = %load_err, "failed to load job for failure");
                return;
            }
        };
        if job.status.is_terminal() {
            return;
        }
        match self
            .db
            .transition_job_status(job_id, job.status, status)
            .await
        {
            Ok(true) => {
                let result = err.to_result_json();
                if let Err(write_err) = self
                    .db
                    .update_job_result(job_id, status, Some(&result))
                    .await
                {
                    warn!(job_id, error = %write_err, "failed to store job result");
                }
                self.emit(NewEvent::new("job_failed").job(job_id).json(&result))
                    .await;
            }
            Ok(false) => debug!(job_id, "job status changed concurrently"),
            Err(cas_err) => warn!(job_id, error = %cas_err, "failed to fail job"),
        }
    }

    /// Times out a sandbox that never finished booting: fail its job with
    /// kind `timeout`, then run the destroy path.
    #[instrument(skip(self, sandbox), fields(vmid = sandbox.vmid))]
    pub async fn expire_stalled(&self, sandbox: &SandboxRecord) -> Result<(), ControllerError> {
        let vmid = sandbox.vmid;
        let err = ControllerError::Timeout {
            operation: "provisioning",
            after: self.config.provisioning_timeout,
        };
        warn!(vmid, state = %sandbox.state, "sandbox stalled before ready");
        let detail = err.to_result_json();
        self.emit(
            NewEvent::new("provisioning_timeout")
                .sandbox(vmid)
                .json(&detail),
        )
        .await;

        match self.db.get_job_by_sandbox_vmid(vmid).await {
            Ok(job) => self.fail_job(&job.id, JobStatus::Timeout, &err).await,
            Err(load_err) if load_err.is_not_found() => {}
            Err(load_err) => return Err(load_err.into()),
        }
        self.destroy_sandbox(vmid, DestroyReason::Timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{controller, setup_db, FakeHypervisor};
    use agentlab_db::{Clock, NewWorkspace};

    #[test]
    fn destroy_path_hops() {
        use SandboxState::*;
        assert_eq!(DestroyReason::Completed.next_state(Completed), Some(Stopped));
        assert_eq!(DestroyReason::LeaseExpired.next_state(Running), Some(Timeout));
        assert_eq!(DestroyReason::Failed.next_state(Running), Some(Failed));
        assert_eq!(DestroyReason::Stopped.next_state(Running), Some(Stopped));
        assert_eq!(DestroyReason::Timeout.next_state(Booting), Some(Timeout));
        assert_eq!(DestroyReason::Stopped.next_state(Requested), Some(Failed));
        assert_eq!(DestroyReason::Stopped.next_state(Stopped), None);
        for reason in [
            DestroyReason::Completed,
            DestroyReason::Stopped,
            DestroyReason::Failed,
            DestroyReason::LeaseExpired,
            DestroyReason::Timeout,
        ] {
            for state in SandboxState::ALL {
                if let Some(next) = reason.next_state(state) {
                    assert!(state.can_transition_to(next), "{reason}: {state} -> {next}");
                }
            }
        }
    }

    #[test]
    fn oversized_ttl_is_capped() {
        let capped = chrono_duration(Duration::from_secs(u64::MAX));
        assert_eq!(capped, chrono::Duration::days(MAX_TTL_DAYS));
        assert_eq!(
            chrono_duration(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
    }

    #[tokio::test]
    async fn bounded_maps_timeout_and_failure() {
        let err = bounded("provision", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "timeout");

        let err = bounded::<(), _>("destroy", Duration::ZERO, async {
            Err(anyhow::anyhow!("qm exploded"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "adapter");
        assert!(err.to_string().contains("qm exploded"));
    }

    #[tokio::test]
    async fn start_job_reaches_booting() {
        let (db, _clock) = setup_db().await;
        let hypervisor = Arc::new(FakeHypervisor::new());
        let controller = controller(db.clone(), hypervisor.clone());

        let launch = controller
            .start_job(JobRequest::new(
                "https://github.com/example/repo",
                "main",
                "default",
            ))
            .await
            .unwrap();
        assert_eq!(launch.sandbox.vmid, 100);
        assert_eq!(launch.sandbox.state, SandboxState::Booting);
        assert_eq!(launch.job.status, JobStatus::Queued);
        assert_eq!(launch.job.sandbox_vmid, Some(100));

        let provisioned = hypervisor.provisioned();
        assert_eq!(provisioned.len(), 1);
        assert_eq!(provisioned[0].job_id, launch.job.id);
        assert!(!provisioned[0].bootstrap_token.is_empty());
    }

    #[tokio::test]
    async fn vmid_collision_is_retried() {
        let (db, _clock) = setup_db().await;
        db.create_sandbox(NewSandbox::new(100, "squatter", "default"))
            .await
            .unwrap();
        let hypervisor = Arc::new(FakeHypervisor::with_vmids([100, 100, 101]));
        let controller = controller(db, hypervisor);

        let launch = controller
            .start_job(JobRequest::new("https://example.com/r.git", "main", "default"))
            .await
            .unwrap();
        assert_eq!(launch.sandbox.vmid, 101);
    }

    #[tokio::test]
    async fn provision_failure_fails_job_and_cleans_up() {
        let (db, _clock) = setup_db().await;
        db.create_workspace(NewWorkspace {
            id: "ws-1",
            name: "scratch",
            storage: "local-zfs",
            volume_id: "vm-0-disk-1",
            size_gb: 20,
        })
        .await
        .unwrap();
        let hypervisor = Arc::new(FakeHypervisor::new());
        hypervisor.fail_provision(true);
        let controller = controller(db.clone(), hypervisor.clone());

        let mut request = JobRequest::new("https://example.com/r.git", "main", "default");
        request.workspace_id = Some("ws-1".into());
        let err = controller.start_job(request).await.unwrap_err();
        assert_eq!(err.kind(), "adapter");

        let job = db.get_job_by_sandbox_vmid(100).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result_json.unwrap()["kind"], "adapter");
        assert_eq!(
            db.get_sandbox(100).await.unwrap().state,
            SandboxState::Destroyed
        );
        let workspace = db.get_workspace("ws-1").await.unwrap();
        assert!(workspace.lease.is_none());
        assert!(workspace.attached_vmid.is_none());
        assert_eq!(hypervisor.destroyed(), vec![100]);
    }

    #[tokio::test]
    async fn leased_workspace_rejects_second_job() {
        let (db, _clock) = setup_db().await;
        db.create_workspace(NewWorkspace {
            id: "ws-1",
            name: "scratch",
            storage: "local-zfs",
            volume_id: "local-zfs:vm-0-disk-1",
            size_gb: 20,
        })
        .await
        .unwrap();
        let controller = controller(db.clone(), Arc::new(FakeHypervisor::new()));

        let mut request = JobRequest::new("https://example.com/r.git", "main", "default");
        request.workspace_id = Some("ws-1".into());
        let first = controller.start_job(request.clone()).await.unwrap();
        assert_eq!(
            controller.hypervisor().provisioned()[0].workspace_volume.as_deref(),
            Some("local-zfs:vm-0-disk-1")
        );

        let err = controller.start_job(request).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let workspace = db.get_workspace("ws-1").await.unwrap();
        assert_eq!(workspace.attached_vmid, Some(first.sandbox.vmid));
        assert_eq!(
            workspace.lease.unwrap().owner,
            format!("job:{}", first.job.id)
        );
    }

    #[tokio::test]
    async fn destroy_failure_expires_lease_for_retry() {
        let (db, clock) = setup_db().await;
        let hypervisor = Arc::new(FakeHypervisor::new());
        let controller = controller(db.clone(), hypervisor.clone());
        let launch = controller
            .start_job(JobRequest::new("https://example.com/r.git", "main", "default"))
            .await
            .unwrap();

        hypervisor.fail_destroy(true);
        let err = controller
            .destroy_sandbox(launch.sandbox.vmid, DestroyReason::Stopped)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "adapter");
        let sandbox = db.get_sandbox(launch.sandbox.vmid).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::Stopped);
        assert_eq!(sandbox.lease_expires_at, Some(clock.now()));

        hypervisor.fail_destroy(false);
        let sandbox = controller
            .destroy_sandbox(launch.sandbox.vmid, DestroyReason::LeaseExpired)
            .await
            .unwrap();
        assert_eq!(sandbox.state, SandboxState::Destroyed);
        let job = db.get_job(&launch.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.result_json.unwrap()["kind"], "expired");
    }

    #[tokio::test]
    async fn complete_rejects_non_terminal_status() {
        let (db, _clock) = setup_db().await;
        let controller = controller(db, Arc::new(FakeHypervisor::new()));
        let err = controller
            .complete_job("job_missing", JobStatus::Running, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
