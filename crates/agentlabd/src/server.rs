use std::{fmt::Write as _, net::IpAddr, net::SocketAddr, sync::Arc};

use agentlab_db::{ArtifactRecord, Database, SandboxState};
use agentlab_kernel::{
    hypervisor::ShellHypervisor, ArtifactUpload, BootstrapHandoff, Controller, ControllerError,
    Hypervisor, HypervisorBackend, Reconciler, RetentionSweeper,
};
use anyhow::{bail, Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{bind_address, Config};

pub const RESULT_HEADER: &str = "x-agentlab-result";

/// Runs the daemon until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });
    let result = serve(config, shutdown).await;
    signals.abort();
    result
}

/// Opens the store, binds every listener, and serves until `shutdown` fires.
pub async fn serve(config: Config, shutdown: CancellationToken) -> Result<()> {
    for dir in [
        &config.data_dir,
        &config.log_dir,
        &config.run_dir,
        &config.artifact_dir,
        &config.snippets_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let db = Database::connect_file(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    match config.backend()? {
        HypervisorBackend::Shell => {}
        HypervisorBackend::Api => {
            bail!("proxmox_backend \"api\" is not available in this build; use \"shell\"")
        }
    }
    let hypervisor = Arc::new(ShellHypervisor::new(config.shell_hypervisor_config()));
    let mut controller = Controller::new(db.clone(), hypervisor, config.controller_config());
    if let Some(store) = config.secret_store() {
        controller = controller.with_secrets(store);
    }
    let state = Arc::new(AppState {
        controller: controller.clone(),
    });

    let bootstrap = bind("bootstrap", &config.bootstrap_listen).await?;
    let artifact = bind("artifact", &config.artifact_listen).await?;
    let metrics = if config.metrics_listen.trim().is_empty() {
        None
    } else {
        Some(bind("metrics", &config.metrics_listen).await?)
    };

    let mut servers = JoinSet::new();
    spawn_server(&mut servers, "bootstrap", bootstrap, bootstrap_router(state.clone()), &shutdown);
    spawn_server(&mut servers, "artifact", artifact, artifact_router(state), &shutdown);
    if let Some(listener) = metrics {
        spawn_server(&mut servers, "metrics", listener, metrics_router(db.clone()), &shutdown);
    }

    let reconciler = Reconciler::new(controller, config.reconcile_interval.get())
        .with_retention(RetentionSweeper::new(db.clone(), config.retention_policy()));
    let reconciler = tokio::spawn(reconciler.run(shutdown.clone()));
    info!(db = %config.db_path.display(), "agentlabd started");

    let mut result = Ok(());
    while let Some(joined) = servers.join_next().await {
        let outcome = joined
            .context("listener task panicked")
            .and_then(|served| served);
        if let Err(err) = outcome {
            error!(error = %err, "listener stopped");
            shutdown.cancel();
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    shutdown.cancel();
    if let Err(err) = reconciler.await {
        warn!(error = %err, "reconciler task ended abnormally");
    }
    db.close().await;
    info!("agentlabd stopped");
    result
}

async fn bind(name: &'static str, listen: &str) -> Result<TcpListener> {
    let address = bind_address(listen).map_err(|reason| anyhow::anyhow!("{name}_listen: {reason}"))?;
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {name} listener on {address}"))?;
    info!(listener = name, addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

fn spawn_server(
    servers: &mut JoinSet<Result<()>>,
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: &CancellationToken,
) {
    let shutdown = shutdown.clone();
    let app = router.layer(TraceLayer::new_for_http());
    servers.spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{name} listener failed"))
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

pub struct AppState<H: Hypervisor> {
    pub controller: Controller<H>,
}

/// Guest-facing `POST /v1/bootstrap`.
pub fn bootstrap_router<H: Hypervisor>(state: Arc<AppState<H>>) -> Router {
    Router::new()
        .route("/v1/bootstrap", post(bootstrap::<H>))
        .with_state(state)
}

/// Guest-facing `POST /upload`. Bodies above `artifact_max_bytes` are
/// refused before they reach the controller.
pub fn artifact_router<H: Hypervisor>(state: Arc<AppState<H>>) -> Router {
    let limit = usize::try_from(state.controller.config().artifact_max_bytes).unwrap_or(usize::MAX);
    Router::new()
        .route("/upload", post(upload_artifact::<H>))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

pub fn metrics_router(db: Database) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(db)
}

#[derive(Deserialize)]
struct BootstrapRequest {
    vmid: i64,
    token: String,
    #[serde(default)]
    ip: Option<String>,
}

async fn bootstrap<H: Hypervisor>(
    State(state): State<Arc<AppState<H>>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<BootstrapRequest>,
) -> Result<Json<BootstrapHandoff>, ApiError> {
    let ip = match request.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) {
        Some(reported) => {
            let parsed: IpAddr = reported
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid ip {reported:?}")))?;
            Some(parsed.to_string())
        }
        None => peer.map(|ConnectInfo(addr)| addr.ip().to_string()),
    };

    let handoff = state
        .controller
        .handle_bootstrap(request.vmid, request.token.trim(), ip.as_deref())
        .await?;
    info!(vmid = request.vmid, job_id = %handoff.job_id, "bootstrap handed off");
    Ok(Json(handoff))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    job_id: String,
    name: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

async fn upload_artifact<H: Hypervisor>(
    State(state): State<Arc<AppState<H>>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ArtifactRecord>), ApiError> {
    let token = require_bearer(&headers)?.to_string();
    let final_result = header_flag(&headers, RESULT_HEADER)?;
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let record = state
        .controller
        .accept_artifact_upload(ArtifactUpload {
            token,
            job_id: query.job_id,
            name: query.name,
            size: query.size,
            sha256: query.sha256.unwrap_or_default(),
            mime,
            content: body.to_vec(),
            final_result,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(db): State<Database>) -> Result<Response, ApiError> {
    let counts = db
        .count_sandboxes_by_state()
        .await
        .map_err(ApiError::internal)?;

    let mut body = String::from(
        "# HELP agentlab_sandboxes Sandboxes by lifecycle state.\n# TYPE agentlab_sandboxes gauge\n",
    );
    for state in SandboxState::ALL {
        let count = counts
            .iter()
            .find(|(counted, _)| *counted == state)
            .map_or(0, |(_, count)| *count);
        let _ = writeln!(body, "agentlab_sandboxes{{state=\"{}\"}} {count}", state.as_str());
    }

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    match value.strip_prefix("Bearer ").map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(ApiError::unauthorized(
            "Authorization header must be a Bearer token",
        )),
    }
}

fn header_flag(headers: &HeaderMap, name: &str) -> Result<bool, ApiError> {
    let Some(value) = headers.get(name) else {
        return Ok(false);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("invalid {name} header")))?;
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        other => Err(ApiError::bad_request(format!(
            "{name} must be true or false, got {other:?}"
        ))),
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        let status = match &err {
            ControllerError::Validation { .. } => StatusCode::BAD_REQUEST,
            ControllerError::InvalidToken => StatusCode::UNAUTHORIZED,
            ControllerError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControllerError::Conflict(_) | ControllerError::AlreadyConsumed => StatusCode::CONFLICT,
            ControllerError::Expired(_) => StatusCode::GONE,
            ControllerError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ControllerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ControllerError::Adapter { .. } => StatusCode::BAD_GATEWAY,
            ControllerError::ForeignKey(_)
            | ControllerError::Decrypt { .. }
            | ControllerError::Io { .. }
            | ControllerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            kind: Some(err.kind()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "request rejected");
        }
        let body = Json(ErrorBody {
            error: self.message,
            kind: self.kind,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentlab_db::{JobStatus, ManualClock};
    use agentlab_kernel::{
        testing::{setup_db, test_config, FakeHypervisor},
        JobLaunch, JobRequest,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use tower::Service;

    struct TestApp {
        controller: Controller<FakeHypervisor>,
        hypervisor: Arc<FakeHypervisor>,
        db: Database,
        _clock: ManualClock,
        _temp: TempDir,
    }

    async fn setup_test_app() -> TestApp {
        let temp = TempDir::new().expect("tempdir");
        let (db, clock) = setup_db().await;
        let mut config = test_config();
        config.artifact_dir = temp.path().join("artifacts");
        config.artifact_max_bytes = 64;
        let hypervisor = Arc::new(FakeHypervisor::new());
        let controller = Controller::new(db.clone(), hypervisor.clone(), config);
        TestApp {
            controller,
            hypervisor,
            db,
            _clock: clock,
            _temp: temp,
        }
    }

    impl TestApp {
        fn state(&self) -> Arc<AppState<FakeHypervisor>> {
            Arc::new(AppState {
                controller: self.controller.clone(),
            })
        }

        async fn launch(&self) -> (JobLaunch, String) {
            let launch = self
                .controller
                .start_job(JobRequest::new("https://github.com/example/repo", "main", "default"))
                .await
                .expect("job starts");
            let token = self
                .hypervisor
                .last_bootstrap_token(launch.sandbox.vmid)
                .expect("bootstrap token");
            (launch, token)
        }

        async fn running(&self) -> (JobLaunch, BootstrapHandoff) {
            let (launch, token) = self.launch().await;
            let handoff = self
                .controller
                .handle_bootstrap(launch.sandbox.vmid, &token, None)
                .await
                .expect("bootstrap");
            (launch, handoff)
        }
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body).expect("json body")
    }

    fn upload(job_id: &str, name: &str, token: Option<&str>, content: &[u8]) -> Request<Body> {
        let digest = hex::encode(Sha256::digest(content));
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/upload?job_id={job_id}&name={name}&sha256={digest}"))
            .header("content-type", "text/plain");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(content.to_vec())).expect("request")
    }

    #[tokio::test]
    async fn bootstrap_hands_off_exactly_once() {
        let app = setup_test_app().await;
        let (launch, token) = app.launch().await;
        let vmid = launch.sandbox.vmid;
        let mut router = bootstrap_router(app.state());

        let request = |token: &str| {
            Request::builder()
                .method("POST")
                .uri("/v1/bootstrap")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"vmid": vmid, "token": token, "ip": "10.77.0.9"}))
                        .unwrap(),
                ))
                .expect("request")
        };

        let response = router.call(request("not-the-token")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router.call(request(&token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let handoff = body_json(response).await;
        assert_eq!(handoff["job_id"], launch.job.id.as_str());
        assert_eq!(handoff["ref"], "main");
        assert_eq!(handoff["artifact_upload_url"], "http://10.77.0.1:8846/upload");
        assert!(!handoff["artifact_token"].as_str().unwrap().is_empty());
        assert!(handoff.get("secrets").is_none());
        assert_eq!(
            app.db.get_sandbox(vmid).await.unwrap().ip.as_deref(),
            Some("10.77.0.9")
        );

        let response = router.call(request(&token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["kind"], "already_consumed");
    }

    #[tokio::test]
    async fn upload_checks_bearer_digest_and_size() {
        let app = setup_test_app().await;
        let (launch, handoff) = app.running().await;
        let job_id = launch.job.id.as_str();
        let token = handoff.artifact_token.as_str();
        let mut router = artifact_router(app.state());

        let response = router.call(upload(job_id, "out.txt", None, b"hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let tampered = Request::builder()
            .method("POST")
            .uri(format!("/upload?job_id={job_id}&name=out.txt&sha256={}", "a".repeat(64)))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from("hello"))
            .unwrap();
        let response = router.call(tampered).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation");

        let unsigned = Request::builder()
            .method("POST")
            .uri(format!("/upload?job_id={job_id}&name=out.txt"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from("hello"))
            .unwrap();
        let response = router.call(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "validation");
        assert!(body["error"].as_str().unwrap().contains("sha256"), "{body}");

        let response = router
            .call(upload(job_id, "out.txt", Some(token), b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let record = body_json(response).await;
        assert_eq!(record["name"], "out.txt");
        assert_eq!(record["size_bytes"], 5);
        assert_eq!(record["mime"], "text/plain");

        let response = router
            .call(upload(job_id, "out.txt", Some(token), b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .call(upload(job_id, "big.bin", Some(token), &[7u8; 65]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = router
            .call(upload("job_other", "out.txt", Some(token), b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(app.db.list_artifacts_by_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn final_result_upload_completes_job() {
        let app = setup_test_app().await;
        let (launch, handoff) = app.running().await;
        let mut router = artifact_router(app.state());

        let content = br#"{"status":"FAILED","error":"tests"}"#;
        let mut request = upload(
            &launch.job.id,
            "result.json",
            Some(&handoff.artifact_token),
            content,
        );
        request
            .headers_mut()
            .insert(RESULT_HEADER, "true".parse().unwrap());
        let response = router.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let job = app.db.get_job(&launch.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(app.hypervisor.destroyed(), vec![launch.sandbox.vmid]);

        let mut bad_flag = upload(
            &launch.job.id,
            "late.txt",
            Some(&handoff.artifact_token),
            b"x",
        );
        bad_flag
            .headers_mut()
            .insert(RESULT_HEADER, "perhaps".parse().unwrap());
        let response = router.call(bad_flag).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_report_sandboxes_by_state() {
        let app = setup_test_app().await;
        app.launch().await;
        let mut router = metrics_router(app.db.clone());

        let response = router
            .call(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("agentlab_sandboxes{state=\"BOOTING\"} 1"), "{text}");
        assert!(text.contains("agentlab_sandboxes{state=\"RUNNING\"} 0"), "{text}");
        assert_eq!(text.matches("agentlab_sandboxes{").count(), SandboxState::ALL.len());
    }

    #[test]
    fn controller_errors_map_to_status_codes() {
        let cases = [
            (ControllerError::validation("name", "empty"), StatusCode::BAD_REQUEST),
            (ControllerError::InvalidToken, StatusCode::UNAUTHORIZED),
            (ControllerError::AlreadyConsumed, StatusCode::CONFLICT),
            (ControllerError::Expired("artifact token"), StatusCode::GONE),
            (
                ControllerError::TooLarge { limit: 1, actual: 2 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ControllerError::Timeout {
                    operation: "provision",
                    after: std::time::Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ControllerError::Adapter {
                    operation: "destroy",
                    source: anyhow::anyhow!("locked"),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ControllerError::ForeignKey("job".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
