use std::{path::Path, process::Command, time::Duration};

use agentlabd::{server, Config};
use anyhow::Result;
use tokio_util::sync::CancellationToken;

fn config_in(root: &Path, extra: &str) -> Result<Config> {
    let yaml = format!(
        "profiles_dir: {root}/profiles\n\
         data_dir: {root}/data\n\
         log_dir: {root}/log\n\
         run_dir: {root}/run\n\
         bootstrap_listen: \"127.0.0.1:0\"\n\
         artifact_listen: \"127.0.0.1:0\"\n\
         secrets_bundle: \"\"\n\
         {extra}",
        root = root.display()
    );
    Ok(Config::from_yaml_str(&yaml, |_| None)?)
}

#[tokio::test]
async fn serve_creates_layout_and_stops_on_cancel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_in(dir.path(), "metrics_listen: \"127.0.0.1:0\"\n")?;
    let db_path = config.db_path.clone();
    let artifact_dir = config.artifact_dir.clone();

    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(server::serve(config, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!daemon.is_finished(), "daemon exited before shutdown");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), daemon).await???;
    assert!(db_path.exists());
    assert!(artifact_dir.is_dir());
    assert!(dir.path().join("data/snippets").is_dir());
    Ok(())
}

#[tokio::test]
async fn api_backend_is_refused_at_startup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_in(
        dir.path(),
        "proxmox_backend: api\nproxmox_api_url: https://pve.local:8006/api2/json\nproxmox_api_token: root@pam!t=s\n",
    )?;
    let err = server::serve(config, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not available"), "{err:#}");
    Ok(())
}

#[tokio::test]
async fn occupied_port_is_fatal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = taken.local_addr()?.port();
    let mut config = config_in(dir.path(), "")?;
    config.artifact_listen = format!("127.0.0.1:{port}");

    let err = server::serve(config, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("failed to bind artifact listener"),
        "{err:#}"
    );
    Ok(())
}

#[test]
fn binary_prints_version() -> Result<()> {
    let output = Command::new(env!("CARGO_BIN_EXE_agentlabd"))
        .arg("-version")
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.starts_with("agentlabd version="), "{stdout}");
    assert!(stdout.contains("commit=") && stdout.contains("date="), "{stdout}");
    Ok(())
}

#[test]
fn binary_exits_one_on_missing_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = Command::new(env!("CARGO_BIN_EXE_agentlabd"))
        .arg("-config")
        .arg(dir.path().join("missing.yaml"))
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("failed to read config"), "{stderr}");
    Ok(())
}
