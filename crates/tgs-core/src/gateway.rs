//! Upload/download logic behind `POST /api` and `GET /d/<token>`.
//!
//! The gateway is stateless between requests: durability lives entirely in the backend
//! and tokens are derived from message ids, so there is nothing to persist here.

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::{
    backend::{BackendError, ChatBackend, FetchedObject, MAX_UPLOAD_BYTES},
    codec::{self, TokenError},
    config::ServiceConfig,
};

/// Path prefix of download links.
pub const ROUTE_PREFIX: &str = "/d/";

/// `message` of the upload response while token/channel are unset.
pub const NOT_CONFIGURED: &str = "tgstate_not_configured";

/// Upload allow-list, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg", ".ico", ".mp4", ".webm", ".pdf",
    ".txt", ".zip",
];

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upload envelope. Callers branch on `code` (1 = ok, 0 = failed), not on HTTP status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub code: u8,
    pub message: String,
    #[serde(rename = "imgUrl")]
    pub img_url: String,
}

impl UploadResponse {
    pub fn success(path: String, url: String) -> Self {
        Self {
            code: 1,
            message: path,
            img_url: url,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            img_url: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("tgstate_not_configured")]
    NotConfigured,

    #[error("File size exceeds {}MB limit", .limit / (1024 * 1024))]
    TooLarge { limit: u64 },

    #[error("Unable to get file")]
    MissingFile,

    #[error("Invalid file type {0:?}. Allowed: {}", ALLOWED_EXTENSIONS.join(", "))]
    InvalidExtension(String),

    #[error("{0}")]
    Backend(BackendError),
}

impl UploadError {
    /// Degraded mode and remote failures are expected states: 200 with `code:0`.
    /// Client mistakes are 400.
    pub fn http_status(&self) -> u16 {
        match self {
            UploadError::NotConfigured => 200,
            UploadError::TooLarge { .. }
            | UploadError::MissingFile
            | UploadError::InvalidExtension(_) => 400,
            UploadError::Backend(BackendError::TooLarge { .. }) => 400,
            UploadError::Backend(BackendError::Read(_)) => 400,
            UploadError::Backend(_) => 200,
        }
    }

    pub fn to_response(&self) -> UploadResponse {
        UploadResponse::failure(self.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("not found")]
    NotFound,

    #[error("tgstate_not_configured")]
    NotConfigured,

    #[error("{0}")]
    Backend(BackendError),
}

impl DownloadError {
    /// Malformed and unknown tokens are indistinguishable to clients (404); a backend
    /// that cannot answer is a bad gateway (502).
    pub fn http_status(&self) -> u16 {
        match self {
            DownloadError::InvalidToken(_)
            | DownloadError::NotFound
            | DownloadError::NotConfigured => 404,
            DownloadError::Backend(_) => 502,
        }
    }
}

#[derive(Clone)]
pub struct StorageGateway {
    backend: Option<Arc<dyn ChatBackend>>,
    base_url: String,
    max_upload: u64,
}

impl StorageGateway {
    /// `backend` is `None` when the service is not configured.
    pub fn new(cfg: &ServiceConfig, backend: Option<Arc<dyn ChatBackend>>) -> Self {
        Self {
            backend,
            base_url: cfg.base_url().to_string(),
            max_upload: MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload(mut self, max_upload: u64) -> Self {
        self.max_upload = max_upload;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn max_upload(&self) -> u64 {
        self.max_upload
    }

    pub fn download_path(&self, token: &str) -> String {
        format!("{ROUTE_PREFIX}{token}")
    }

    pub fn download_url(&self, token: &str) -> String {
        format!("{}{}", self.base_url, self.download_path(token))
    }

    /// Checks that need nothing but request headers. Runs before the body is read.
    pub fn precheck(&self, declared_len: Option<u64>) -> Result<(), UploadError> {
        if !self.is_configured() {
            return Err(UploadError::NotConfigured);
        }
        if let Some(len) = declared_len {
            if len > self.max_upload {
                return Err(UploadError::TooLarge {
                    limit: self.max_upload,
                });
            }
        }
        Ok(())
    }

    pub fn check_filename(&self, filename: &str) -> Result<(), UploadError> {
        let ext = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            Ok(())
        } else {
            Err(UploadError::InvalidExtension(ext))
        }
    }

    pub async fn upload(
        &self,
        filename: &str,
        declared_len: Option<u64>,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<UploadResponse, UploadError> {
        self.precheck(declared_len)?;
        self.check_filename(filename)?;
        let backend = self.backend.as_ref().ok_or(UploadError::NotConfigured)?;

        let handle = backend
            .upload(filename, reader, self.max_upload)
            .await
            .map_err(|e| match e {
                BackendError::TooLarge { limit } => UploadError::TooLarge { limit },
                other => UploadError::Backend(other),
            })?;

        let token = codec::encode(handle.message_id);
        tracing::info!(
            filename = %handle.filename,
            message_id = handle.message_id.0,
            token = %token,
            "upload stored"
        );
        Ok(UploadResponse::success(
            self.download_path(&token),
            self.download_url(&token),
        ))
    }

    pub async fn download(&self, token: &str) -> Result<FetchedObject, DownloadError> {
        let id = codec::decode(token)?;
        let backend = self.backend.as_ref().ok_or(DownloadError::NotConfigured)?;

        let mut obj = backend.fetch(id).await.map_err(|e| match e {
            BackendError::NotFound => DownloadError::NotFound,
            other => DownloadError::Backend(other),
        })?;

        if obj.content_type.is_none() {
            obj.content_type = Some(
                obj.filename
                    .as_deref()
                    .and_then(|n| mime_guess::from_path(n).first())
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            );
        }
        Ok(obj)
    }
}
