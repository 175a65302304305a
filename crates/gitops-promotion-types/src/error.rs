use thiserror::Error;

/// The crate-wide error taxonomy. Every fallible operation in the
/// workspace returns one of these variants, never a bare `anyhow::Error`
/// or a `String` — the CLI front-end needs to tell a soft "no next
/// environment" outcome apart from a hard `Unauthorized` failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("ambiguous: {0}")]
    Ambiguous(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("commit status check has failed {0:?}")]
    StatusFailed(String),

    #[error("commit status check has timed out {0:?}")]
    StatusTimeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid promotion metadata: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code for this error. The specification does not
    /// require distinct codes per kind, only distinct messages, so every
    /// variant maps to the same non-zero status.
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
