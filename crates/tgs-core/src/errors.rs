use crate::backend::BackendError;
use crate::codec::TokenError;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so callers can tell an
/// operator mistake (config) from a remote failure
/// (backend) without string matching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid token: {0}")]
    Token(#[from] TokenError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
