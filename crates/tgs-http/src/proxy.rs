//! Forward the worker's public routes from the supervisor port.
//!
//! Lets a deployment expose the supervisor alone: `POST /api` and `GET /d/{token}`
//! are relayed to the worker on loopback, cookies and all, so the worker keeps
//! enforcing its own password gate.

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;
use tgs_core::{
    backend::MAX_UPLOAD_BYTES,
    gateway::{UploadError, UploadResponse},
};

use crate::worker::MULTIPART_OVERHEAD;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that describe one hop, not the message.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Clone, Debug)]
pub struct WorkerProxy {
    client: reqwest::Client,
    body_limit: usize,
}

impl WorkerProxy {
    pub fn new() -> tgs_core::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| tgs_core::Error::Config(format!("failed to build proxy client: {e}")))?;
        Ok(Self {
            client,
            body_limit: (MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD) as usize,
        })
    }

    /// Relay `req` to the worker listening on `127.0.0.1:port`.
    pub async fn forward(&self, port: u16, req: Request) -> Response {
        let (parts, body) = req.into_parts();

        // Size checks on declared lengths are left to the worker, which runs them in
        // its own order. Uploads are buffered: an axum body cannot be handed to
        // reqwest as a stream.
        let body = match to_bytes(body, self.body_limit).await {
            Ok(b) => b,
            Err(_) => {
                return upload_error(UploadError::TooLarge {
                    limit: MAX_UPLOAD_BYTES,
                })
            }
        };

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://127.0.0.1:{port}{path}");

        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        };
        let mut upstream = self.client.request(method, &url);
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            upstream = upstream.header(name.as_str(), value.as_bytes());
        }
        if !body.is_empty() {
            upstream = upstream.body(body);
        }

        let resp = match upstream.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "worker unreachable");
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(UploadResponse::failure(format!("worker unavailable: {e}"))),
                )
                    .into_response();
            }
        };

        let status =
            StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in resp.headers() {
            let name = name.as_str();
            if name != "content-length" && is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(n, v);
            }
        }

        let body = Body::from_stream(resp.bytes_stream().map_err(std::io::Error::other));
        (status, headers, body).into_response()
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn upload_error(e: UploadError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Json(e.to_response())).into_response()
}
