//! Daemon configuration: YAML file, then `AGENTLAB_*` environment overrides,
//! then derived paths, then validation.

use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use agentlab_kernel::{
    hypervisor::ShellHypervisorConfig, secrets::CommandDecryptor, ControllerConfig,
    HypervisorBackend, RetentionPolicy, SecretStore,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use url::Url;

use crate::duration::GoDuration;

pub const ENV_PREFIX: &str = "AGENTLAB";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agentlab/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("environment override {var}: {reason}")]
    Env { var: String, reason: String },
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// String that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Redacted(pub String);

impl Redacted {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"<redacted>\"")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub default_grace: GoDuration,
    pub profiles: BTreeMap<String, GoDuration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_grace: GoDuration::from_secs(168 * 60 * 60),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profiles_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub run_dir: PathBuf,
    pub socket_path: PathBuf,
    pub db_path: PathBuf,
    pub snippets_dir: PathBuf,
    pub artifact_dir: PathBuf,

    pub bootstrap_listen: String,
    pub artifact_listen: String,
    /// Empty disables the metrics listener.
    pub metrics_listen: String,
    pub controller_url: String,
    pub artifact_upload_url: String,
    pub agent_subnet: String,

    pub artifact_max_bytes: u64,
    pub artifact_token_ttl_minutes: u64,
    pub bootstrap_token_ttl: GoDuration,
    pub workspace_lease_ttl: GoDuration,
    pub reconcile_interval: GoDuration,
    pub artifact_retention: RetentionConfig,

    pub secrets_dir: PathBuf,
    /// Bundle handed to guests at bootstrap. Empty (the default) disables
    /// secret delivery.
    pub secrets_bundle: String,
    pub secrets_age_key_path: PathBuf,
    pub secrets_sops_path: PathBuf,
    pub secrets_allow_plaintext: bool,

    pub proxmox_backend: String,
    pub proxmox_command_timeout: GoDuration,
    pub provisioning_timeout: GoDuration,
    pub proxmox_api_url: String,
    pub proxmox_api_token: Redacted,
    pub proxmox_node: String,
    pub proxmox_template_vmid: i64,
    pub snippet_storage: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiles_dir: PathBuf::from("/etc/agentlab/profiles"),
            data_dir: PathBuf::from("/var/lib/agentlab"),
            log_dir: PathBuf::from("/var/log/agentlab"),
            run_dir: PathBuf::from("/run/agentlab"),
            socket_path: PathBuf::new(),
            db_path: PathBuf::new(),
            snippets_dir: PathBuf::new(),
            artifact_dir: PathBuf::new(),
            bootstrap_listen: "127.0.0.1:8844".to_string(),
            artifact_listen: "127.0.0.1:8846".to_string(),
            metrics_listen: String::new(),
            controller_url: String::new(),
            artifact_upload_url: String::new(),
            agent_subnet: String::new(),
            artifact_max_bytes: 256 * 1024 * 1024,
            artifact_token_ttl_minutes: 24 * 60,
            bootstrap_token_ttl: GoDuration::from_secs(10 * 60),
            workspace_lease_ttl: GoDuration::from_secs(8 * 60 * 60),
            reconcile_interval: GoDuration::from_secs(30),
            artifact_retention: RetentionConfig::default(),
            secrets_dir: PathBuf::from("/etc/agentlab/secrets"),
            secrets_bundle: String::new(),
            secrets_age_key_path: PathBuf::from("/etc/agentlab/keys/age.key"),
            secrets_sops_path: PathBuf::from("sops"),
            secrets_allow_plaintext: false,
            proxmox_backend: "shell".to_string(),
            proxmox_command_timeout: GoDuration::from_secs(2 * 60),
            provisioning_timeout: GoDuration::from_secs(10 * 60),
            proxmox_api_url: String::new(),
            proxmox_api_token: Redacted::default(),
            proxmox_node: String::new(),
            proxmox_template_vmid: 9000,
            snippet_storage: "local".to_string(),
        }
    }
}

impl Config {
    /// Reads `path` and applies overrides from the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |var| std::env::var(var).ok())
    }

    pub fn load_with_env(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, lookup)
    }

    pub fn from_yaml_str(
        text: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut document = match serde_yaml::from_str::<Value>(text)? {
            Value::Null => Mapping::new(),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::Invalid(vec![
                    "top level of the config file must be a mapping".to_string(),
                ]))
            }
        };
        let defaults = match serde_yaml::to_value(Config::default())? {
            Value::Mapping(mapping) => mapping,
            _ => Mapping::new(),
        };
        apply_env_overrides(&mut document, &defaults, ENV_PREFIX, &lookup)?;

        let mut config: Config = serde_yaml::from_value(Value::Mapping(document))?;
        config.fill_derived();
        config.validate()?;
        Ok(config)
    }

    fn fill_derived(&mut self) {
        let derive = |target: &mut PathBuf, base: &Path, leaf: &str| {
            if target.as_os_str().is_empty() && !base.as_os_str().is_empty() {
                *target = base.join(leaf);
            }
        };
        derive(&mut self.socket_path, &self.run_dir, "agentlabd.sock");
        derive(&mut self.db_path, &self.data_dir, "agentlab.db");
        derive(&mut self.snippets_dir, &self.data_dir, "snippets");
        derive(&mut self.artifact_dir, &self.data_dir, "artifacts");
    }

    /// Every problem is collected; none short-circuits the rest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("profiles_dir", &self.profiles_dir),
            ("data_dir", &self.data_dir),
            ("log_dir", &self.log_dir),
            ("run_dir", &self.run_dir),
        ] {
            if value.as_os_str().is_empty() {
                errors.push(format!("{field} is required"));
            }
        }

        let subnet_ok = if self.agent_subnet.trim().is_empty() {
            false
        } else {
            match self.agent_subnet.trim().parse::<IpNet>() {
                Ok(_) => true,
                Err(err) => {
                    errors.push(format!("agent_subnet {:?}: {err}", self.agent_subnet));
                    false
                }
            }
        };

        for (field, listen, url_field, url) in [
            (
                "bootstrap_listen",
                &self.bootstrap_listen,
                "controller_url",
                &self.controller_url,
            ),
            (
                "artifact_listen",
                &self.artifact_listen,
                "artifact_upload_url",
                &self.artifact_upload_url,
            ),
        ] {
            match split_host_port(listen) {
                Ok((host, _)) if is_wildcard(host) => {
                    if !subnet_ok {
                        errors.push(format!(
                            "{field} {listen:?} listens on all interfaces; agent_subnet is required"
                        ));
                    }
                    if url.trim().is_empty() {
                        errors.push(format!(
                            "{field} {listen:?} listens on all interfaces; {url_field} is required"
                        ));
                    }
                }
                Ok(_) => {}
                Err(reason) => errors.push(format!("{field} {listen:?}: {reason}")),
            }
        }

        if !self.metrics_listen.trim().is_empty() {
            match split_host_port(&self.metrics_listen) {
                Ok((host, _)) if is_loopback(host) => {}
                Ok(_) => errors.push(format!(
                    "metrics_listen {:?} must be a loopback address",
                    self.metrics_listen
                )),
                Err(reason) => errors.push(format!("metrics_listen {:?}: {reason}", self.metrics_listen)),
            }
        }

        if self.artifact_max_bytes == 0 {
            errors.push("artifact_max_bytes must be greater than zero".to_string());
        }
        if self.artifact_token_ttl_minutes == 0 {
            errors.push("artifact_token_ttl_minutes must be greater than zero".to_string());
        }

        match self.proxmox_backend.parse::<HypervisorBackend>() {
            Ok(HypervisorBackend::Api) => {
                if self.proxmox_api_token.is_empty() {
                    errors.push("proxmox_api_token is required for the api backend".to_string());
                }
                if self.proxmox_api_url.trim().is_empty() {
                    errors.push("proxmox_api_url is required for the api backend".to_string());
                }
            }
            Ok(HypervisorBackend::Shell) => {}
            Err(err) => errors.push(format!("proxmox_backend: {err}")),
        }

        for (field, value) in [
            ("controller_url", &self.controller_url),
            ("artifact_upload_url", &self.artifact_upload_url),
            ("proxmox_api_url", &self.proxmox_api_url),
        ] {
            if let Err(reason) = check_url(value) {
                errors.push(format!("{field} {value:?}: {reason}"));
            }
        }

        if !self.secrets_bundle.trim().is_empty() && self.secrets_dir.as_os_str().is_empty() {
            errors.push("secrets_dir is required when secrets_bundle is set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn backend(&self) -> anyhow::Result<HypervisorBackend> {
        self.proxmox_backend.parse()
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            controller_url: non_empty(&self.controller_url),
            artifact_upload_url: non_empty(&self.artifact_upload_url),
            artifact_dir: self.artifact_dir.clone(),
            artifact_max_bytes: self.artifact_max_bytes,
            artifact_token_ttl: Duration::from_secs(self.artifact_token_ttl_minutes * 60),
            bootstrap_token_ttl: self.bootstrap_token_ttl.get(),
            command_timeout: self.proxmox_command_timeout.get(),
            provisioning_timeout: self.provisioning_timeout.get(),
            secrets_bundle: non_empty(&self.secrets_bundle),
            workspace_lease_ttl: self.workspace_lease_ttl.get(),
            ..ControllerConfig::default()
        }
    }

    pub fn shell_hypervisor_config(&self) -> ShellHypervisorConfig {
        ShellHypervisorConfig {
            template_vmid: self.proxmox_template_vmid,
            snippets_dir: self.snippets_dir.clone(),
            snippet_storage: self.snippet_storage.clone(),
            command_timeout: self.proxmox_command_timeout.get(),
            ..ShellHypervisorConfig::default()
        }
    }

    /// `None` when no bundle is configured.
    pub fn secret_store(&self) -> Option<SecretStore> {
        non_empty(&self.secrets_bundle)?;
        let decryptor = CommandDecryptor {
            age_key_path: (!self.secrets_age_key_path.as_os_str().is_empty())
                .then(|| self.secrets_age_key_path.clone()),
            sops_path: self.secrets_sops_path.clone(),
            timeout: self.proxmox_command_timeout.get(),
            ..CommandDecryptor::default()
        };
        Some(SecretStore::new(
            &self.secrets_dir,
            self.secrets_allow_plaintext,
            Arc::new(decryptor),
        ))
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            default_grace: self.artifact_retention.default_grace.get(),
            profiles: self
                .artifact_retention
                .profiles
                .iter()
                .map(|(name, grace)| (name.clone(), grace.get()))
                .collect(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Overrides leaf keys from `<prefix>_<KEY>` variables. The type of each
/// default decides how the raw string is read.
fn apply_env_overrides(
    document: &mut Mapping,
    defaults: &Mapping,
    prefix: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for (key, default) in defaults {
        let Some(name) = key.as_str() else { continue };
        let var = format!("{prefix}_{}", name.to_ascii_uppercase());
        match default {
            Value::Mapping(nested_defaults) => {
                let entry = document
                    .entry(key.clone())
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if entry.is_null() {
                    *entry = Value::Mapping(Mapping::new());
                }
                if let Value::Mapping(nested) = entry {
                    apply_env_overrides(nested, nested_defaults, &var, lookup)?;
                }
            }
            _ => {
                if let Some(raw) = lookup(&var) {
                    document.insert(key.clone(), env_value(default, &raw, &var)?);
                }
            }
        }
    }
    Ok(())
}

fn env_value(default: &Value, raw: &str, var: &str) -> Result<Value, ConfigError> {
    let invalid = |reason: String| ConfigError::Env {
        var: var.to_string(),
        reason,
    };
    let trimmed = raw.trim();
    match default {
        Value::Bool(_) => match trimmed.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Value::Bool(false)),
            other => Err(invalid(format!("{other:?} is not a boolean"))),
        },
        Value::Number(_) => {
            if let Ok(value) = trimmed.parse::<u64>() {
                Ok(Value::Number(value.into()))
            } else if let Ok(value) = trimmed.parse::<i64>() {
                Ok(Value::Number(value.into()))
            } else {
                Err(invalid(format!("{trimmed:?} is not an integer")))
            }
        }
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
        _ => serde_yaml::from_str(raw).map_err(|err| invalid(err.to_string())),
    }
}

fn split_host_port(listen: &str) -> Result<(&str, u16), String> {
    let listen = listen.trim();
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| "expected host:port".to_string())?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| "unterminated IPv6 bracket".to_string())?,
        None if host.contains(':') => {
            return Err("IPv6 hosts must be bracketed, e.g. [::1]:9090".to_string())
        }
        None => host,
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port {port:?}"))?;
    Ok((host, port))
}

fn is_wildcard(host: &str) -> bool {
    match host {
        "" => true,
        other => other
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false),
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Address string for `TcpListener::bind`; an empty host binds every IPv4
/// interface.
pub fn bind_address(listen: &str) -> Result<String, String> {
    let (host, port) = split_host_port(listen)?;
    Ok(match host {
        "" => format!("0.0.0.0:{port}"),
        host if host.contains(':') => format!("[{host}]:{port}"),
        host => format!("{host}:{port}"),
    })
}

fn check_url(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Ok(());
    }
    let url = Url::parse(value.trim()).map_err(|err| err.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("scheme {:?} is not http or https", url.scheme()));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err("missing host".to_string()),
    }
}
