use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::{FileHandle, MessageId};

/// Upload ceiling. Anything larger is refused before it is transmitted.
pub const MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

pub type ByteStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Failures of a backend call. None of these are retried inside a client; retry policy
/// belongs to the caller so a failure is always attributable to exactly one call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("not found")]
    NotFound,

    #[error("backend rejected: too large (limit {limit} bytes)")]
    TooLarge { limit: u64 },

    #[error("backend rejected: {0}")]
    Rejected(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend call timed out")]
    Timeout,

    #[error("failed to read upload body: {0}")]
    Read(String),
}

/// A resolved object ready to be streamed to a client.
pub struct FetchedObject {
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub filename: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedObject")
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Hexagonal port for the object store.
///
/// Implementations are bound to one bot token + channel for their whole lifetime.
/// A config change builds a new instance (via a worker restart), never mutates one.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `reader` under `filename` with one remote call. Payloads above `max_bytes`
    /// fail with `TooLarge` before anything is sent.
    async fn upload(
        &self,
        filename: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        max_bytes: u64,
    ) -> Result<FileHandle, BackendError>;

    /// Resolve a message id back into a byte stream. Unknown ids are `NotFound`.
    async fn fetch(&self, id: MessageId) -> Result<FetchedObject, BackendError>;
}

/// Read at most `max_bytes` from `reader`; one byte more means the payload is too large.
pub async fn read_capped(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    max_bytes: u64,
) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .await
        .map_err(|e| BackendError::Read(e.to_string()))?;
    if buf.len() as u64 > max_bytes {
        return Err(BackendError::TooLarge { limit: max_bytes });
    }
    Ok(buf)
}
