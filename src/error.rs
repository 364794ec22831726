use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

// Service-boundary error type. Internal layers (storage, config) use anyhow
// with context strings; everything crossing the service boundary is mapped
// into one of these variants so callers never see raw transport errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Error message extracted from a structured remote error body.
    #[error("{0}")]
    Api(String),

    /// Transport-level failure (unreachable host, timeout, bad TLS, ...).
    #[error("network request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure while reading a streamed response body.
    #[error("error reading response stream: {0}")]
    Stream(String),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// A completion is already in flight for this session.
    #[error("a reply is already being generated for this session")]
    Busy,

    /// Generation was cancelled before any content arrived.
    #[error("generation cancelled")]
    Cancelled,

    /// The request cannot be satisfied by the session's current state.
    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
