//! Worker routes: upload, download, password flow, health.

use std::{io, sync::Arc};

use axum::{
    body::Body,
    extract::{
        multipart::{Multipart, MultipartRejection},
        DefaultBodyLimit, FromRef, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::json;
use tgs_core::{
    access::AccessGuard,
    backend::ChatBackend,
    config::ServiceConfig,
    gateway::{StorageGateway, UploadError, UploadResponse, DEFAULT_CONTENT_TYPE},
    utils::iso_timestamp_utc,
};
use tokio_util::io::StreamReader;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    access::{password_page, require_access, submit_password, SharedGuard},
    pages,
};

/// Room for multipart boundaries and part headers on top of the file itself.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Multipart field carrying the file.
pub const UPLOAD_FIELD: &str = "image";

const CACHE_FOREVER: &str = "public, max-age=31536000, immutable";

#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub service: &'static str,
    pub port: u16,
    pub mode: &'static str,
    pub configured: bool,
    pub started_at: String,
}

#[derive(Clone)]
pub struct WorkerState {
    pub gateway: StorageGateway,
    pub guard: SharedGuard,
    pub info: Arc<WorkerInfo>,
}

impl WorkerState {
    pub fn new(cfg: &ServiceConfig, backend: Option<Arc<dyn ChatBackend>>) -> Self {
        Self {
            gateway: StorageGateway::new(cfg, backend),
            guard: Arc::new(AccessGuard::from_config(cfg)),
            info: Arc::new(WorkerInfo {
                service: "tgs",
                port: cfg.port,
                mode: cfg.mode.as_str(),
                configured: cfg.is_configured(),
                started_at: iso_timestamp_utc(),
            }),
        }
    }
}

impl FromRef<WorkerState> for SharedGuard {
    fn from_ref(state: &WorkerState) -> Self {
        state.guard.clone()
    }
}

pub fn router(state: WorkerState, password_enabled: bool) -> Router {
    let body_limit = state.gateway.max_upload() + MULTIPART_OVERHEAD;
    let guard = middleware::from_fn_with_state(state.guard.clone(), require_access);

    let api = Router::new()
        .route("/api", axum::routing::post(upload).options(preflight))
        .route_layer(guard.clone())
        .layer(DefaultBodyLimit::max(body_limit as usize))
        .layer(CorsLayer::permissive());

    let home = Router::new()
        .route("/", get(index))
        .route_layer(guard);

    let mut public = Router::new()
        .route("/d/{token}", get(download))
        .route("/health", get(health))
        .route("/status", get(status));
    if password_enabled {
        public = public.route("/pwd", get(password_page).post(submit_password));
    }

    Router::new()
        .merge(api)
        .merge(home)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<WorkerState>) -> Html<String> {
    Html(pages::upload_page(state.gateway.is_configured()))
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn upload(
    State(state): State<WorkerState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Err(e) = state.gateway.precheck(declared_len) {
        return upload_failed(e);
    }
    let Ok(mut multipart) = multipart else {
        return upload_failed(UploadError::MissingFile);
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return upload_failed(UploadError::MissingFile),
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return upload_failed(UploadError::TooLarge {
                    limit: state.gateway.max_upload(),
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed multipart body");
                return upload_failed(UploadError::MissingFile);
            }
        };
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let filename = client_filename(field.file_name());
        let reader = StreamReader::new(field.map_err(io::Error::other));
        let mut reader = std::pin::pin!(reader);

        return match state.gateway.upload(&filename, declared_len, &mut reader).await {
            Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
            Err(e) => upload_failed(e),
        };
    }
}

fn upload_failed(e: UploadError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::OK);
    match &e {
        UploadError::NotConfigured => tracing::debug!("upload refused: not configured"),
        UploadError::Backend(err) => tracing::error!(error = %err, "upload failed"),
        other => tracing::info!(reason = %other, "upload rejected"),
    }
    let body: UploadResponse = e.to_response();
    (status, Json(body)).into_response()
}

/// Last path component of the client-supplied name.
fn client_filename(raw: Option<&str>) -> String {
    raw.and_then(|name| name.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("upload")
        .to_string()
}

async fn download(State(state): State<WorkerState>, Path(token): Path<String>) -> Response {
    let obj = match state.gateway.download(&token).await {
        Ok(obj) => obj,
        Err(e) => {
            let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::NOT_FOUND);
            if status.is_server_error() {
                tracing::error!(token = %token, error = %e, "download failed");
            }
            return (status, Json(json!({ "code": 0, "message": e.to_string() })))
                .into_response();
        }
    };

    let mut headers = HeaderMap::new();
    let content_type = obj.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_FOREVER));
    if let Some(size) = obj.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Some(name) = obj.filename.as_deref() {
        let value = format!("inline; filename=\"{}\"", name.replace(['"', '\\'], "_"));
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_DISPOSITION, v);
        }
    }

    (headers, Body::from_stream(obj.body)).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "tgs",
        "timestamp": iso_timestamp_utc(),
        "pid": std::process::id(),
    }))
}

async fn status(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    let info = &state.info;
    Json(json!({
        "status": "running",
        "service": info.service,
        "pid": std::process::id(),
        "port": info.port,
        "mode": info.mode,
        "configured": info.configured,
        "started_at": info.started_at,
    }))
}
