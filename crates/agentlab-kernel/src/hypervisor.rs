//! The seam between the controller and whatever actually runs VMs.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::process::run_command;

/// Everything the adapter needs to clone, configure and boot one sandbox.
#[derive(Clone)]
pub struct ProvisionRequest {
    pub vmid: i64,
    pub name: String,
    pub profile: String,
    pub job_id: String,
    /// Plaintext one-shot token handed to the guest through cloud-init.
    pub bootstrap_token: String,
    pub controller_url: Option<String>,
    /// Volume to attach as the persistent workspace disk.
    pub workspace_volume: Option<String>,
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("vmid", &self.vmid)
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("job_id", &self.job_id)
            .field("bootstrap_token", &"<redacted>")
            .field("controller_url", &self.controller_url)
            .field("workspace_volume", &self.workspace_volume)
            .finish()
    }
}

/// Hypervisor adapter. Implementations report failures as `anyhow` errors;
/// the controller classifies them.
#[async_trait]
pub trait Hypervisor: Send + Sync + 'static {
    /// Next free VMID. Callers still rely on the sandbox insert to detect
    /// collisions.
    async fn next_vmid(&self) -> Result<i64>;

    /// Clone the template, apply cloud-init and start the VM.
    async fn provision(&self, request: &ProvisionRequest) -> Result<()>;

    async fn stop(&self, vmid: i64) -> Result<()>;

    /// Remove the VM and its disks. Must succeed when the VM is already gone.
    async fn destroy(&self, vmid: i64) -> Result<()>;
}

/// Backend selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HypervisorBackend {
    #[default]
    Shell,
    Api,
}

impl HypervisorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorBackend::Shell => "shell",
            HypervisorBackend::Api => "api",
        }
    }
}

impl fmt::Display for HypervisorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypervisorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "shell" => Ok(HypervisorBackend::Shell),
            "api" => Ok(HypervisorBackend::Api),
            other => Err(anyhow!(
                "unknown proxmox backend {other:?} (expected \"shell\" or \"api\")"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellHypervisorConfig {
    pub qm_path: PathBuf,
    pub pvesh_path: PathBuf,
    pub template_vmid: i64,
    /// Directory Proxmox serves as `<snippet_storage>:snippets/`.
    pub snippets_dir: PathBuf,
    pub snippet_storage: String,
    pub command_timeout: Duration,
}

impl Default for ShellHypervisorConfig {
    fn default() -> Self {
        Self {
            qm_path: PathBuf::from("qm"),
            pvesh_path: PathBuf::from("pvesh"),
            template_vmid: 9000,
            snippets_dir: PathBuf::from("/var/lib/vz/snippets"),
            snippet_storage: "local".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Drives Proxmox through the `qm` and `pvesh` CLIs on the local node.
#[derive(Debug, Clone)]
pub struct ShellHypervisor {
    config: ShellHypervisorConfig,
}

impl ShellHypervisor {
    pub fn new(config: ShellHypervisorConfig) -> Self {
        Self { config }
    }

    pub fn snippet_path(&self, vmid: i64) -> PathBuf {
        self.config.snippets_dir.join(snippet_name(vmid))
    }

    async fn qm(&self, args: &[String]) -> Result<String> {
        let output = run_command(
            self.config.qm_path.as_os_str(),
            args,
            self.config.command_timeout,
        )
        .await?;
        Ok(output.stdout_str())
    }

    async fn write_snippet(&self, request: &ProvisionRequest) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.snippets_dir)
            .await
            .with_context(|| format!("create {}", self.config.snippets_dir.display()))?;
        let path = self.snippet_path(request.vmid);
        let user_data = render_user_data(request)?;
        fs::write(&path, user_data)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        restrict_permissions(&path).await?;
        Ok(path)
    }
}

#[async_trait]
impl Hypervisor for ShellHypervisor {
    async fn next_vmid(&self) -> Result<i64> {
        let output = run_command(
            self.config.pvesh_path.as_os_str(),
            ["get", "/cluster/nextid", "--output-format", "json"],
            self.config.command_timeout,
        )
        .await?;
        parse_vmid(&output.stdout_str())
    }

    #[instrument(skip(self, request), fields(vmid = request.vmid))]
    async fn provision(&self, request: &ProvisionRequest) -> Result<()> {
        let vmid = request.vmid.to_string();
        self.qm(&[
            "clone".into(),
            self.config.template_vmid.to_string(),
            vmid.clone(),
            "--name".into(),
            request.name.clone(),
        ])
        .await?;

        self.write_snippet(request).await?;
        self.qm(&[
            "set".into(),
            vmid.clone(),
            "--cicustom".into(),
            format!(
                "user={}:snippets/{}",
                self.config.snippet_storage,
                snippet_name(request.vmid)
            ),
        ])
        .await?;

        if let Some(volume) = &request.workspace_volume {
            self.qm(&["set".into(), vmid.clone(), "--scsi1".into(), volume.clone()])
                .await?;
        }

        self.qm(&["start".into(), vmid]).await?;
        info!(vmid = request.vmid, "vm started");
        Ok(())
    }

    async fn stop(&self, vmid: i64) -> Result<()> {
        self.qm(&["stop".into(), vmid.to_string()]).await.map(|_| ())
    }

    async fn destroy(&self, vmid: i64) -> Result<()> {
        let destroyed = self
            .qm(&[
                "destroy".into(),
                vmid.to_string(),
                "--purge".into(),
                "1".into(),
            ])
            .await;
        match destroyed {
            Ok(_) => {}
            Err(err) if is_missing_vm(&err) => {
                debug!(vmid, error = %err, "vm already gone");
            }
            Err(err) => return Err(err),
        }

        match fs::remove_file(self.snippet_path(vmid)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("remove cloud-init snippet"),
        }
        Ok(())
    }
}

/// `qm` reports an unknown VMID as a missing `qemu-server/<vmid>.conf`.
fn is_missing_vm(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("does not exist")
}

fn snippet_name(vmid: i64) -> String {
    format!("agentlab-{vmid}.yaml")
}

/// `pvesh` prints the id either bare or as a JSON string.
fn parse_vmid(raw: &str) -> Result<i64> {
    let trimmed = raw.trim().trim_matches('"');
    let vmid: i64 = trimmed
        .parse()
        .with_context(|| format!("unexpected nextid output {raw:?}"))?;
    if vmid <= 0 {
        return Err(anyhow!("hypervisor returned non-positive vmid {vmid}"));
    }
    Ok(vmid)
}

/// Minimal cloud-config that drops the bootstrap descriptor where the guest
/// agent looks for it.
fn render_user_data(request: &ProvisionRequest) -> Result<String> {
    let descriptor = json!({
        "vmid": request.vmid,
        "job_id": request.job_id,
        "token": request.bootstrap_token,
        "controller_url": request.controller_url,
    });
    let document = json!({
        "hostname": request.name,
        "write_files": [{
            "path": "/etc/agentlab/bootstrap.json",
            "permissions": "0600",
            "content": descriptor.to_string(),
        }],
    });
    let body = serde_yaml::to_string(&document).context("render cloud-init user data")?;
    Ok(format!("#cloud-config\n{body}"))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
