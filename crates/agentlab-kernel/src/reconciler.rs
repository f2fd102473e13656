//! Periodic pass that drives expired and stalled sandboxes to `DESTROYED`
//! and sweeps stale tokens and artifacts.

use std::time::Duration;

use agentlab_db::{NewEvent, SandboxState};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    chrono_duration, Controller, ControllerError, DestroyReason, Hypervisor, RetentionSweeper,
    SweepReport,
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one [`Reconciler::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub expired: usize,
    pub stalled: usize,
    pub destroyed: usize,
    pub failures: usize,
    pub expired_workspace_leases: usize,
    pub pruned_bootstrap_tokens: u64,
    pub retention: Option<SweepReport>,
}

pub struct Reconciler<H>
where
    H: Hypervisor,
{
    controller: Controller<H>,
    sweeper: Option<RetentionSweeper>,
    interval: Duration,
}

impl<H> Reconciler<H>
where
    H: Hypervisor,
{
    /// A zero interval falls back to 30s.
    pub fn new(controller: Controller<H>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        Self {
            controller,
            sweeper: None,
            interval,
        }
    }

    pub fn with_retention(mut self, sweeper: RetentionSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass. Individual sandbox failures are counted and logged; only a
    /// failing store query aborts the pass.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<ReconcileReport, ControllerError> {
        let db = self.controller.db();
        let now = self.controller.now();
        let mut report = ReconcileReport::default();

        for sandbox in db.list_expired_sandboxes(now).await? {
            let vmid = sandbox.vmid;
            report.expired += 1;
            info!(vmid, state = %sandbox.state, "sandbox lease expired");
            self.controller
                .emit(NewEvent::new("lease_expired").sandbox(vmid))
                .await;
            match self
                .controller
                .destroy_sandbox(vmid, DestroyReason::LeaseExpired)
                .await
            {
                Ok(_) => report.destroyed += 1,
                Err(err) => {
                    report.failures += 1;
                    warn!(vmid, error = %err, retryable = err.is_retryable(), "destroy of expired sandbox failed");
                }
            }
        }

        let timeout = self.controller.config().provisioning_timeout;
        if !timeout.is_zero() {
            let cutoff = now - chrono_duration(timeout);
            for state in [SandboxState::Provisioning, SandboxState::Booting] {
                for sandbox in db.list_sandboxes_stuck_in(state, cutoff).await? {
                    report.stalled += 1;
                    match self.controller.expire_stalled(&sandbox).await {
                        Ok(()) => report.destroyed += 1,
                        Err(err) => {
                            report.failures += 1;
                            warn!(vmid = sandbox.vmid, error = %err, "stalled sandbox cleanup failed");
                        }
                    }
                }
            }
        }

        let leases = db.list_expired_workspace_leases(now).await?;
        for workspace in &leases {
            if let Some(lease) = &workspace.lease {
                debug!(workspace_id = %workspace.id, owner = %lease.owner, expired_at = %lease.expires_at, "workspace lease lapsed");
            }
        }
        report.expired_workspace_leases = leases.len();

        report.pruned_bootstrap_tokens = db.delete_expired_bootstrap_tokens(now).await?;

        if let Some(sweeper) = &self.sweeper {
            match sweeper.sweep(now).await {
                Ok(sweep) => report.retention = Some(sweep),
                Err(err) => warn!(error = %err, "artifact retention sweep failed"),
            }
        }

        Ok(report)
    }

    /// Ticks every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if report != ReconcileReport::default() => {
                        info!(?report, "reconcile pass");
                    }
                    Ok(_) => debug!("reconcile pass: nothing to do"),
                    Err(err) => warn!(error = %err, "reconcile pass failed"),
                },
            }
        }
        info!("reconciler stopped");
    }
}
