use std::sync::Arc;

use agentlab_db::{hash_token, Clock, EventScope, JobStatus, NewWorkspace, SandboxState};
use agentlab_kernel::{
    secrets::CommandDecryptor,
    testing::{setup_db, test_config, FakeHypervisor},
    ArtifactUpload, Controller, ControllerError, JobRequest, Reconciler, SecretStore,
};
use anyhow::Result;
use sha2::{Digest, Sha256};

fn request() -> JobRequest {
    JobRequest::new("https://github.com/example/repo", "main", "default")
}

async fn sandbox_transitions(controller: &Controller<FakeHypervisor>, vmid: i64) -> Result<Vec<String>> {
    let events = controller
        .db()
        .list_events_tail(&EventScope::Sandbox(vmid), 200)
        .await?;
    Ok(events
        .into_iter()
        .map(|event| event.kind)
        .filter(|kind| kind.starts_with("sandbox_") && kind != "sandbox_created")
        .collect())
}

#[tokio::test]
async fn job_runs_from_request_to_destroyed() -> Result<()> {
    let (db, clock) = setup_db().await;
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("default.yaml"),
        "git:\n  token: ghp_example\n",
    )?;
    let mut config = test_config();
    config.artifact_dir = dir.path().join("artifacts");
    config.secrets_bundle = Some("default".into());
    let hypervisor = Arc::new(FakeHypervisor::new());
    let controller = Controller::new(db.clone(), hypervisor.clone(), config).with_secrets(
        SecretStore::new(dir.path(), true, Arc::new(CommandDecryptor::default())),
    );

    let launch = controller.start_job(request()).await?;
    let vmid = launch.sandbox.vmid;
    assert_eq!(vmid, 100);
    let token = hypervisor
        .last_bootstrap_token(vmid)
        .expect("provisioned with a token");
    let stored = db.get_bootstrap_token(&hash_token(&token)).await?;
    assert_eq!(stored.vmid, vmid);
    assert_eq!(
        stored.expires_at,
        clock.now() + chrono::Duration::minutes(10)
    );

    clock.advance(chrono::Duration::minutes(1));
    let handoff = controller
        .handle_bootstrap(vmid, &token, Some("10.77.0.23"))
        .await?;
    assert_eq!(handoff.job_id, launch.job.id);
    assert_eq!(handoff.secrets.as_ref().unwrap()["git"]["token"], "ghp_example");
    assert!(!format!("{handoff:?}").contains(&handoff.artifact_token));

    clock.advance(chrono::Duration::minutes(1));
    let replay = controller.handle_bootstrap(vmid, &token, None).await;
    assert!(matches!(replay, Err(ControllerError::AlreadyConsumed)));

    let sandbox = db.get_sandbox(vmid).await?;
    assert_eq!(sandbox.state, SandboxState::Running);
    assert_eq!(sandbox.ip.as_deref(), Some("10.77.0.23"));

    let result = br#"{"status":"COMPLETED","summary":"done"}"#;
    controller
        .accept_artifact_upload(ArtifactUpload {
            token: handoff.artifact_token.clone(),
            job_id: handoff.job_id.clone(),
            name: "result.json".into(),
            size: Some(result.len() as u64),
            sha256: hex::encode(Sha256::digest(result)),
            mime: Some("application/json".into()),
            content: result.to_vec(),
            final_result: true,
        })
        .await?;

    let job = db.get_job(&launch.job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.sandbox_vmid, Some(100));
    assert_eq!(
        sandbox_transitions(&controller, vmid).await?,
        vec![
            "sandbox_provisioning",
            "sandbox_booting",
            "sandbox_ready",
            "sandbox_running",
            "sandbox_completed",
            "sandbox_stopped",
            "sandbox_destroyed",
        ]
    );
    assert_eq!(hypervisor.stopped(), Vec::<i64>::new());
    assert_eq!(hypervisor.destroyed(), vec![100]);
    Ok(())
}

#[tokio::test]
async fn keepalive_sandbox_survives_completion_until_stopped() -> Result<()> {
    let (db, _clock) = setup_db().await;
    let hypervisor = Arc::new(FakeHypervisor::new());
    let controller = Controller::new(db.clone(), hypervisor.clone(), test_config());

    let mut keepalive = request();
    keepalive.keepalive = true;
    let launch = controller.start_job(keepalive).await?;
    let vmid = launch.sandbox.vmid;
    let token = hypervisor.last_bootstrap_token(vmid).expect("token");
    controller.handle_bootstrap(vmid, &token, None).await?;

    controller
        .complete_job(&launch.job.id, JobStatus::Completed, None)
        .await?;
    assert_eq!(db.get_sandbox(vmid).await?.state, SandboxState::Completed);
    assert!(hypervisor.destroyed().is_empty());

    let err = controller
        .complete_job(&launch.job.id, JobStatus::Failed, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    let job = controller.stop_job(&launch.job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(db.get_sandbox(vmid).await?.state, SandboxState::Destroyed);

    let again = controller
        .destroy_sandbox(vmid, agentlab_kernel::DestroyReason::Stopped)
        .await?;
    assert_eq!(again.state, SandboxState::Destroyed);
    assert_eq!(hypervisor.destroyed(), vec![vmid]);
    Ok(())
}

#[tokio::test]
async fn stop_fails_running_job() -> Result<()> {
    let (db, _clock) = setup_db().await;
    let hypervisor = Arc::new(FakeHypervisor::new());
    let controller = Controller::new(db.clone(), hypervisor.clone(), test_config());

    let launch = controller.start_job(request()).await?;
    let vmid = launch.sandbox.vmid;
    let token = hypervisor.last_bootstrap_token(vmid).expect("token");
    controller.handle_bootstrap(vmid, &token, None).await?;

    let job = controller.stop_job(&launch.job.id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_json.unwrap()["kind"], "stopped");
    assert_eq!(hypervisor.stopped(), vec![vmid]);
    assert_eq!(db.get_sandbox(vmid).await?.state, SandboxState::Destroyed);
    Ok(())
}

#[tokio::test]
async fn workspace_follows_jobs_across_sandboxes() -> Result<()> {
    let (db, _clock) = setup_db().await;
    db.create_workspace(NewWorkspace {
        id: "ws-1",
        name: "scratch",
        storage: "local-zfs",
        volume_id: "vm-0-disk-9",
        size_gb: 20,
    })
    .await?;
    let hypervisor = Arc::new(FakeHypervisor::new());
    let controller = Controller::new(db.clone(), hypervisor.clone(), test_config());

    let mut with_workspace = request();
    with_workspace.workspace_id = Some("ws-1".into());

    for expected_vmid in [100, 101] {
        let launch = controller.start_job(with_workspace.clone()).await?;
        assert_eq!(launch.sandbox.vmid, expected_vmid);
        assert_eq!(launch.sandbox.workspace_id.as_deref(), Some("ws-1"));
        let workspace = db.get_workspace("ws-1").await?;
        assert_eq!(workspace.attached_vmid, Some(expected_vmid));

        let token = hypervisor
            .last_bootstrap_token(expected_vmid)
            .expect("token");
        controller
            .handle_bootstrap(expected_vmid, &token, None)
            .await?;
        controller
            .complete_job(&launch.job.id, JobStatus::Completed, None)
            .await?;

        let workspace = db.get_workspace("ws-1").await?;
        assert!(workspace.attached_vmid.is_none());
        assert!(workspace.lease.is_none());
    }

    let volumes: Vec<Option<String>> = hypervisor
        .provisioned()
        .into_iter()
        .map(|request| request.workspace_volume)
        .collect();
    assert_eq!(
        volumes,
        vec![
            Some("local-zfs:vm-0-disk-9".to_string()),
            Some("local-zfs:vm-0-disk-9".to_string())
        ]
    );
    Ok(())
}

#[tokio::test]
async fn provisioning_is_bounded() -> Result<()> {
    let (db, _clock) = setup_db().await;
    let hypervisor = Arc::new(FakeHypervisor::new());
    hypervisor.delay_provision(std::time::Duration::from_secs(5));
    let mut config = test_config();
    config.provisioning_timeout = std::time::Duration::from_millis(50);
    let controller = Controller::new(db.clone(), hypervisor, config);

    let err = controller.start_job(request()).await.unwrap_err();
    assert_eq!(err.kind(), "timeout");
    let job = db.get_job_by_sandbox_vmid(100).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_json.unwrap()["kind"], "timeout");
    assert_eq!(db.get_sandbox(100).await?.state, SandboxState::Destroyed);
    Ok(())
}

#[tokio::test]
async fn failed_provisioning_frees_workspace_for_next_job() -> Result<()> {
    let (db, _clock) = setup_db().await;
    db.create_workspace(NewWorkspace {
        id: "ws-1",
        name: "scratch",
        storage: "local-zfs",
        volume_id: "vm-0-disk-9",
        size_gb: 20,
    })
    .await?;
    let hypervisor = Arc::new(FakeHypervisor::new());
    hypervisor.fail_provision(true);
    let controller = Controller::new(db.clone(), hypervisor.clone(), test_config());

    let mut with_workspace = request();
    with_workspace.workspace_id = Some("ws-1".into());
    controller
        .start_job(with_workspace.clone())
        .await
        .unwrap_err();

    assert_eq!(db.get_sandbox(100).await?.state, SandboxState::Destroyed);
    let workspace = db.get_workspace("ws-1").await?;
    assert!(workspace.attached_vmid.is_none());
    assert!(workspace.lease.is_none());
    let job = db.get_job_by_sandbox_vmid(100).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.result_json.unwrap()["kind"], "adapter");

    hypervisor.fail_provision(false);
    let launch = controller.start_job(with_workspace).await?;
    assert_eq!(launch.sandbox.workspace_id.as_deref(), Some("ws-1"));
    Ok(())
}

#[tokio::test]
async fn refused_teardown_is_retried_until_workspace_is_free() -> Result<()> {
    let (db, clock) = setup_db().await;
    db.create_workspace(NewWorkspace {
        id: "ws-1",
        name: "scratch",
        storage: "local-zfs",
        volume_id: "vm-0-disk-9",
        size_gb: 20,
    })
    .await?;
    let hypervisor = Arc::new(FakeHypervisor::new());
    hypervisor.fail_provision(true);
    hypervisor.fail_destroy(true);
    let controller = Controller::new(db.clone(), hypervisor.clone(), test_config());
    let reconciler = Reconciler::new(controller.clone(), std::time::Duration::from_secs(30));

    let mut with_workspace = request();
    with_workspace.workspace_id = Some("ws-1".into());
    let err = controller
        .start_job(with_workspace.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "adapter");

    // The VM may still hold the disk, so the attachment stays until a
    // destroy goes through; the job's lease is gone already.
    let workspace = db.get_workspace("ws-1").await?;
    assert_eq!(workspace.attached_vmid, Some(100));
    assert!(workspace.lease.is_none());
    let sandbox = db.get_sandbox(100).await?;
    assert_eq!(sandbox.state, SandboxState::Stopped);
    assert!(sandbox.is_expired(clock.now()));

    let report = reconciler.tick().await?;
    assert_eq!((report.expired, report.failures), (1, 1));
    assert_eq!(db.get_workspace("ws-1").await?.attached_vmid, Some(100));

    hypervisor.fail_provision(false);
    hypervisor.fail_destroy(false);
    let report = reconciler.tick().await?;
    assert_eq!(report.destroyed, 1);
    assert_eq!(hypervisor.destroyed(), vec![100]);
    assert_eq!(db.get_sandbox(100).await?.state, SandboxState::Destroyed);
    let workspace = db.get_workspace("ws-1").await?;
    assert!(workspace.attached_vmid.is_none());

    let launch = controller.start_job(with_workspace).await?;
    assert_eq!(launch.sandbox.vmid, 101);
    assert_eq!(db.get_workspace("ws-1").await?.attached_vmid, Some(101));
    Ok(())
}
