//! Supervisor HTTP surface: `/api/management/*` plus the worker proxy.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRef, Query, Request, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tgs_core::{config::ServiceConfig, gateway::UploadError};
use tgs_supervisor::{ProcessSupervisor, StartOutcome, StopOutcome};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    access::{password_page, require_access, submit_password, SharedGuard},
    pages,
    proxy::WorkerProxy,
    ApiResponse,
};

const DEFAULT_LOG_LINES: usize = 100;

#[derive(Clone)]
pub struct ManagementState {
    pub supervisor: ProcessSupervisor,
    pub proxy: WorkerProxy,
    guard: SharedGuard,
}

impl ManagementState {
    pub fn new(supervisor: ProcessSupervisor, proxy: WorkerProxy) -> Self {
        Self {
            guard: Arc::new(supervisor.clone()),
            supervisor,
            proxy,
        }
    }
}

impl FromRef<ManagementState> for SharedGuard {
    fn from_ref(state: &ManagementState) -> Self {
        state.guard.clone()
    }
}

pub fn router(state: ManagementState) -> Router {
    let guard = middleware::from_fn_with_state(state.guard.clone(), require_access);

    let management = Router::new()
        .route("/", get(console))
        .route("/api/management/status", get(status))
        .route("/api/management/start", post(start))
        .route("/api/management/stop", post(stop))
        .route("/api/management/restart", post(restart))
        .route("/api/management/config", get(get_config).post(set_config))
        .route("/api/management/info", get(info))
        .route("/api/management/logs", get(logs))
        .route_layer(guard);

    // The supervisor's password always equals the worker's, so one prompt serves both.
    let public = Router::new()
        .route("/pwd", get(password_page).post(submit_password))
        .route("/d/{token}", get(forward))
        .route(
            "/api",
            post(forward_upload).layer(CorsLayer::permissive()),
        );

    Router::new()
        .merge(management)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn console() -> Html<String> {
    Html(pages::console_page())
}

async fn status(State(state): State<ManagementState>) -> ApiResponse {
    ApiResponse::data(&state.supervisor.status().await)
}

async fn start(State(state): State<ManagementState>) -> ApiResponse {
    match state.supervisor.start().await {
        Ok(StartOutcome::Started { pid }) => {
            ApiResponse::ok("worker started").with_data(&json!({ "pid": pid }))
        }
        Ok(StartOutcome::AlreadyRunning { pid }) => {
            ApiResponse::ok("worker already running").with_data(&json!({ "pid": pid }))
        }
        Err(e) => ApiResponse::fail(format!("failed to start worker: {e}")),
    }
}

async fn stop(State(state): State<ManagementState>) -> ApiResponse {
    match state.supervisor.stop().await {
        Ok(StopOutcome::Stopped { forced: false }) => ApiResponse::ok("worker stopped"),
        Ok(StopOutcome::Stopped { forced: true }) => {
            ApiResponse::ok("worker killed after grace period")
        }
        Ok(StopOutcome::AlreadyStopped) => ApiResponse::ok("worker already stopped"),
        Err(e) => ApiResponse::fail(format!("failed to stop worker: {e}")),
    }
}

async fn restart(State(state): State<ManagementState>) -> ApiResponse {
    match state.supervisor.restart().await {
        Ok(outcome) => {
            ApiResponse::ok("worker restarted").with_data(&json!({ "pid": outcome.pid() }))
        }
        Err(e) => ApiResponse::fail(format!("failed to restart worker: {e}")),
    }
}

/// The full config, token included: this route sits behind the password gate.
async fn get_config(State(state): State<ManagementState>) -> ApiResponse {
    ApiResponse::data(&state.supervisor.config().await)
}

async fn set_config(
    State(state): State<ManagementState>,
    body: Result<Json<ServiceConfig>, JsonRejection>,
) -> Response {
    let cfg = match body {
        Ok(Json(cfg)) => cfg,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::fail(format!("invalid config body: {}", e.body_text()))),
            )
                .into_response()
        }
    };

    if cfg.port == state.supervisor.settings().management_port {
        return ApiResponse::fail(format!(
            "worker port {} is taken by the management API",
            cfg.port
        ))
        .into_response();
    }

    match state.supervisor.set_config(cfg).await {
        Ok(outcome) if outcome.restart_scheduled => {
            ApiResponse::ok("config saved, restarting worker").into_response()
        }
        Ok(_) => ApiResponse::ok("config saved").into_response(),
        Err(e) => ApiResponse::fail(e.to_string()).into_response(),
    }
}

async fn info(State(state): State<ManagementState>) -> ApiResponse {
    ApiResponse::data(&state.supervisor.info().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn logs(State(state): State<ManagementState>, Query(q): Query<LogsQuery>) -> ApiResponse {
    let lines = state
        .supervisor
        .logs(Some(q.lines.unwrap_or(DEFAULT_LOG_LINES)))
        .await;
    ApiResponse::data(&json!({ "lines": lines }))
}

async fn forward(State(state): State<ManagementState>, req: Request) -> Response {
    let port = state.supervisor.config().await.port;
    state.proxy.forward(port, req).await
}

/// Same answer as the worker for an unconfigured service, before any body is read.
async fn forward_upload(State(state): State<ManagementState>, req: Request) -> Response {
    let cfg = state.supervisor.config().await;
    if !cfg.is_configured() {
        return Json(UploadError::NotConfigured.to_response()).into_response();
    }
    state.proxy.forward(cfg.port, req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use tgs_core::{backend::memory::MemoryBackend, config::SupervisorSettings};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use crate::worker::{self, WorkerState};

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            worker_bin: "/nonexistent/tgs-worker".into(),
            management_port: 0,
            auto_start: false,
            stop_grace: Duration::from_millis(500),
            restart_settle: Duration::from_millis(10),
            config_restart_delay: Duration::from_millis(10),
            restart_on_crash: false,
            config_file: None,
        }
    }

    fn config(pass: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            token: "123:abcdefgh".to_string(),
            target: "@files_channel".to_string(),
            pass: pass.to_string(),
            url: "http://img.example.com".to_string(),
            port,
            ..ServiceConfig::default()
        }
    }

    fn app(cfg: ServiceConfig) -> (Router, ProcessSupervisor) {
        let supervisor = ProcessSupervisor::new(settings(), cfg);
        let state = ManagementState::new(supervisor.clone(), WorkerProxy::new().unwrap());
        (router(state), supervisor)
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get_req(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: &str) -> Request<Body> {
        Request::post(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_of_idle_supervisor() {
        let (app, _) = app(config("none", 18089));
        let (code, body) = call(&app, get_req("/api/management/status")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "stopped");
        assert_eq!(body["data"]["pid"], serde_json::Value::Null);
        assert_eq!(body["data"]["restarts"], 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_success_false_with_200() {
        let (app, _) = app(config("none", 18089));
        let (code, body) = call(
            &app,
            Request::post("/api/management/start").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("failed to start worker"));

        let (_, body) = call(&app, get_req("/api/management/status")).await;
        assert_eq!(body["data"]["status"], "stopped");
    }

    #[tokio::test]
    async fn stop_when_stopped_succeeds() {
        let (app, _) = app(config("none", 18089));
        let (code, body) = call(
            &app,
            Request::post("/api/management/stop").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "worker already stopped");
    }

    #[tokio::test]
    async fn config_round_trip() {
        let (app, supervisor) = app(config("none", 18089));

        let (_, body) = call(&app, get_req("/api/management/config")).await;
        assert_eq!(body["data"]["token"], "123:abcdefgh");
        assert_eq!(body["data"]["mode"], "p");

        let (code, body) = call(
            &app,
            post_json(
                "/api/management/config",
                r#"{"token":"456:xyz","target":"-1001234567890","pass":"none","mode":"p","url":"https://img.example.org","port":"8090"}"#,
            ),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "config saved");

        let cfg = supervisor.config().await;
        assert_eq!(cfg.token, "456:xyz");
        assert_eq!(cfg.port, 8090);
    }

    #[tokio::test]
    async fn invalid_config_bodies() {
        let (app, supervisor) = app(config("none", 18089));

        let (code, body) = call(&app, post_json("/api/management/config", "{not json")).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (code, body) = call(
            &app,
            post_json("/api/management/config", r#"{"token":"x","port":0}"#),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(supervisor.config().await.token, "123:abcdefgh");
    }

    #[tokio::test]
    async fn info_and_logs() {
        let (app, _) = app(config("none", 18089));
        let (_, body) = call(&app, get_req("/api/management/info")).await;
        assert_eq!(body["data"]["architecture"], "dual-process");
        assert_eq!(body["data"]["worker_port"], 18089);

        let (_, body) = call(&app, get_req("/api/management/logs?lines=5")).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["lines"], json!([]));
    }

    #[tokio::test]
    async fn management_requires_current_password() {
        let (app, supervisor) = app(config("hunter2", 18089));

        let (code, body) = call(&app, get_req("/api/management/status")).await;
        assert_eq!(code, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let resp = app
            .clone()
            .oneshot(get_req("/api/management/status?p=hunter2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::SET_COOKIE).is_some());

        // A new password takes effect immediately.
        supervisor.set_config(config("swordfish", 18089)).await.unwrap();
        let req = Request::get("/api/management/status")
            .header(header::COOKIE, "p=hunter2")
            .body(Body::empty())
            .unwrap();
        let (code, _) = call(&app, req).await;
        assert_eq!(code, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn proxies_upload_and_download_to_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = config("none", port);
        let worker_state = WorkerState::new(&cfg, Some(Arc::new(MemoryBackend::new())));
        tokio::spawn(async move {
            axum::serve(listener, worker::router(worker_state, false))
                .await
                .unwrap();
        });

        let (app, _) = app(cfg);
        let boundary = "proxy-boundary";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"dog.jpg\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(b"jpeg-bytes");
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        let req = Request::post("/api")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();

        let (code, body) = call(&app, req).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["code"], 1);
        assert_eq!(body["message"], "/d/AAAAAQ");

        let resp = app.clone().oneshot(get_req("/d/AAAAAQ")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/jpeg");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"jpeg-bytes");

        let (code, _) = call(&app, get_req("/d/garbage")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unconfigured_upload_answers_like_the_worker() {
        let cfg = ServiceConfig {
            port: 18089,
            ..ServiceConfig::default()
        };
        let worker_app = worker::router(WorkerState::new(&cfg, None), false);
        let (app, _) = app(cfg);

        let oversized = || {
            Request::post("/api")
                .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
                .header(header::CONTENT_LENGTH, (30 * 1024 * 1024).to_string())
                .body(Body::from("0123456789"))
                .unwrap()
        };
        let direct = call(&worker_app, oversized()).await;
        let proxied = call(&app, oversized()).await;

        assert_eq!(direct.0, StatusCode::OK);
        assert_eq!(direct.1["message"], "tgstate_not_configured");
        assert_eq!(proxied, direct);
    }

    #[tokio::test]
    async fn pwd_redirects_home_without_a_password() {
        let (app, _) = app(config("none", 18089));
        let resp = app.oneshot(get_req("/pwd")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn proxy_reports_unreachable_worker() {
        // Bind and drop to get a port nothing listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (app, _) = app(config("none", port));
        let (code, body) = call(&app, get_req("/d/AAAAAQ")).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], 0);
    }
}
