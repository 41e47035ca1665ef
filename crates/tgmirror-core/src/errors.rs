use std::{path::PathBuf, time::Duration};

/// Core error type.
///
/// Adapter crates map their transport errors into this type so the delivery engine can
/// tell recoverable signals (rate limits, stale file references) from generic failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Platform asked us to slow down and retry after the given duration.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// A remote media handle is no longer valid; the media must be re-uploaded.
    #[error("stale media reference: {0}")]
    StaleReference(String),

    /// The media payload was rejected (empty, malformed, or of a kind that cannot be sent).
    #[error("invalid media: {0}")]
    InvalidMedia(String),

    /// The operation or content is not supported by this client.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("external error: {0}")]
    External(String),

    /// A multi-message forward stopped after some copies were already made.
    #[error("forward stopped after {} message(s): {cause}", .forwarded.len())]
    PartialForward {
        forwarded: Vec<crate::domain::MessageRef>,
        cause: Box<Error>,
    },
}

impl Error {
    /// Wait requested by the platform, if this is a rate-limit signal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited(d) => Some(*d),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
