//! In-memory stand-ins for controller tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use agentlab_db::{Database, ManualClock};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{Controller, ControllerConfig, Hypervisor, ProvisionRequest};

const FIRST_VMID: i64 = 100;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid test epoch")
}

/// Fresh in-memory store driven by a manual clock set to [`t0`].
pub async fn setup_db() -> (Database, ManualClock) {
    let clock = ManualClock::new(t0());
    let db = Database::connect_with_clock("sqlite::memory:", Arc::new(clock.clone()))
        .await
        .expect("in-memory database");
    (db, clock)
}

/// Short hypervisor bounds so a misbehaving test fails fast.
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        controller_url: Some("http://10.77.0.1:8844".to_string()),
        artifact_upload_url: Some("http://10.77.0.1:8846/upload".to_string()),
        artifact_dir: std::env::temp_dir().join("agentlab-kernel-tests"),
        command_timeout: Duration::from_secs(5),
        provisioning_timeout: Duration::from_secs(300),
        ..ControllerConfig::default()
    }
}

pub fn controller(db: Database, hypervisor: Arc<FakeHypervisor>) -> Controller<FakeHypervisor> {
    Controller::new(db, hypervisor, test_config())
}

#[derive(Debug, Default)]
struct FakeState {
    next_vmid: i64,
    queued_vmids: VecDeque<i64>,
    provisioned: Vec<ProvisionRequest>,
    stopped: Vec<i64>,
    destroyed: Vec<i64>,
    fail_provision: bool,
    fail_destroy: bool,
    refuse_destroy: HashSet<i64>,
    provision_delay: Option<Duration>,
}

/// Records every call; VMIDs count up from 100 unless queued explicitly.
#[derive(Debug)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_vmid: FIRST_VMID,
                ..FakeState::default()
            }),
        }
    }

    /// Hands out `vmids` first, in order, then counts up from 100.
    pub fn with_vmids(vmids: impl IntoIterator<Item = i64>) -> Self {
        let fake = Self::new();
        fake.state.lock().queued_vmids.extend(vmids);
        fake
    }

    pub fn fail_provision(&self, fail: bool) {
        self.state.lock().fail_provision = fail;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().fail_destroy = fail;
    }

    pub fn fail_destroy_of(&self, vmid: i64) {
        self.state.lock().refuse_destroy.insert(vmid);
    }

    pub fn allow_destroy_of(&self, vmid: i64) {
        self.state.lock().refuse_destroy.remove(&vmid);
    }

    pub fn delay_provision(&self, delay: Duration) {
        self.state.lock().provision_delay = Some(delay);
    }

    pub fn provisioned(&self) -> Vec<ProvisionRequest> {
        self.state.lock().provisioned.clone()
    }

    pub fn stopped(&self) -> Vec<i64> {
        self.state.lock().stopped.clone()
    }

    pub fn destroyed(&self) -> Vec<i64> {
        self.state.lock().destroyed.clone()
    }

    /// Plaintext bootstrap token the guest for `vmid` would have received.
    pub fn last_bootstrap_token(&self, vmid: i64) -> Option<String> {
        self.state
            .lock()
            .provisioned
            .iter()
            .rev()
            .find(|request| request.vmid == vmid)
            .map(|request| request.bootstrap_token.clone())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn next_vmid(&self) -> Result<i64> {
        let mut state = self.state.lock();
        if let Some(vmid) = state.queued_vmids.pop_front() {
            return Ok(vmid);
        }
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        Ok(vmid)
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.provisioned.push(request.clone());
            if state.fail_provision {
                return Err(anyhow!("clone of template failed for {}", request.vmid));
            }
            state.provision_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn stop(&self, vmid: i64) -> Result<()> {
        self.state.lock().stopped.push(vmid);
        Ok(())
    }

    async fn destroy(&self, vmid: i64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_destroy || state.refuse_destroy.contains(&vmid) {
            return Err(anyhow!("qm destroy {vmid} failed: VM is locked"));
        }
        state.destroyed.push(vmid);
        Ok(())
    }
}
