//! Secret bundle discovery and decryption.
//!
//! A bundle named `default` is looked up under the secrets directory as
//! `default.age`, then `default.sops.{yaml,yml,json}`, then (only when
//! plaintext is allowed) `default.{yaml,yml,json}`. The decrypted payload is
//! parsed as YAML, which also covers JSON.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{process::run_command, ControllerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFormat {
    Age,
    Sops,
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLocation {
    pub path: PathBuf,
    pub format: BundleFormat,
}

const ENCRYPTED_CANDIDATES: &[(&str, BundleFormat)] = &[
    ("age", BundleFormat::Age),
    ("sops.yaml", BundleFormat::Sops),
    ("sops.yml", BundleFormat::Sops),
    ("sops.json", BundleFormat::Sops),
];

const PLAINTEXT_CANDIDATES: &[&str] = &["yaml", "yml", "json"];

/// Turns a located bundle into cleartext bytes.
#[async_trait]
pub trait BundleDecryptor: Send + Sync + 'static {
    async fn decrypt(&self, location: &BundleLocation) -> Result<Vec<u8>>;
}

/// Shells out to `age` and `sops`.
#[derive(Debug, Clone)]
pub struct CommandDecryptor {
    pub age_path: PathBuf,
    pub age_key_path: Option<PathBuf>,
    pub sops_path: PathBuf,
    pub timeout: Duration,
}

impl Default for CommandDecryptor {
    fn default() -> Self {
        Self {
            age_path: PathBuf::from("age"),
            age_key_path: None,
            sops_path: PathBuf::from("sops"),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl BundleDecryptor for CommandDecryptor {
    async fn decrypt(&self, location: &BundleLocation) -> Result<Vec<u8>> {
        match location.format {
            BundleFormat::Plaintext => tokio::fs::read(&location.path)
                .await
                .with_context(|| format!("read {}", location.path.display())),
            BundleFormat::Age => {
                let key = self
                    .age_key_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("secrets_age_key_path is not configured"))?;
                let args = [
                    OsStr::new("-d"),
                    OsStr::new("-i"),
                    key.as_os_str(),
                    location.path.as_os_str(),
                ];
                let output = run_command(self.age_path.as_os_str(), args, self.timeout).await?;
                Ok(output.stdout)
            }
            BundleFormat::Sops => {
                let args = [OsStr::new("-d"), location.path.as_os_str()];
                let output = run_command(self.sops_path.as_os_str(), args, self.timeout).await?;
                Ok(output.stdout)
            }
        }
    }
}

/// Finds and decrypts named bundles under one directory.
#[derive(Clone)]
pub struct SecretStore {
    dir: PathBuf,
    allow_plaintext: bool,
    decryptor: Arc<dyn BundleDecryptor>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("dir", &self.dir)
            .field("allow_plaintext", &self.allow_plaintext)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        allow_plaintext: bool,
        decryptor: Arc<dyn BundleDecryptor>,
    ) -> Self {
        Self {
            dir: dir.into(),
            allow_plaintext,
            decryptor,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locate(&self, name: &str) -> Result<BundleLocation, ControllerError> {
        validate_bundle_name(name)?;

        let encrypted = ENCRYPTED_CANDIDATES
            .iter()
            .map(|(ext, format)| (format!("{name}.{ext}"), *format));
        let plaintext = PLAINTEXT_CANDIDATES
            .iter()
            .filter(|_| self.allow_plaintext)
            .map(|ext| (format!("{name}.{ext}"), BundleFormat::Plaintext));

        encrypted
            .chain(plaintext)
            .map(|(file, format)| BundleLocation {
                path: self.dir.join(file),
                format,
            })
            .find(|location| location.path.is_file())
            .ok_or_else(|| ControllerError::NotFound {
                entity: "secret bundle",
                key: name.to_string(),
            })
    }

    /// Locates, decrypts and parses the bundle.
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> Result<Value, ControllerError> {
        let location = self.locate(name)?;
        debug!(path = %location.path.display(), format = ?location.format, "decrypting secret bundle");

        let bytes = self
            .decryptor
            .decrypt(&location)
            .await
            .map_err(|source| ControllerError::Decrypt {
                bundle: name.to_string(),
                source,
            })?;
        serde_yaml::from_slice::<Value>(&bytes).map_err(|err| ControllerError::Decrypt {
            bundle: name.to_string(),
            source: anyhow!(err).context("bundle is not valid YAML or JSON"),
        })
    }
}

fn validate_bundle_name(name: &str) -> Result<(), ControllerError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ControllerError::validation(
            "secrets_bundle",
            format!("invalid bundle name {name:?}"),
        ));
    }
    Ok(())
}
