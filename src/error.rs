//! Error type shared by the index, the orchestrator and the cache.
//!
//! Conditions that the scan treats as recoverable (a bad record, a missing or
//! corrupt cache entry, a failed cache write) are logged where they happen and
//! never surface here. What remains are configuration errors and failures the
//! caller has to see.

use thiserror::Error;

pub type Result<T, E = AnnoError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AnnoError {
    /// External resolution was requested but no layer carries the EXTERNAL policy.
    #[error("no external layer is configured; external resolution is unavailable")]
    NoExternalLayer,

    /// An unknown policy, category or flag value reached an internal dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache error: {0}")]
    Cache(#[from] heed::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache record error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("layer {layer}: {source}")]
    Source {
        layer: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AnnoError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AnnoError::InvalidArgument(message.into())
    }
}
