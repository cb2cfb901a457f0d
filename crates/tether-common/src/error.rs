use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds as they appear on the wire.
///
/// The names are serialized verbatim (`"NotFound"`, `"Stale"`, ...) so a
/// caller can match on them without knowing the Rust types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Stale,
    Paused,
    Timeout,
    Ambiguous,
    AlreadyActive,
    NotActive,
    InvalidRequest,
    Observer,
}

/// Error payload carried in `{success: false, error: {...}}` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale reference: {0}")]
    Stale(String),

    #[error("Session paused: {0}")]
    Paused(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Ambiguous target: {0}")]
    Ambiguous(String),

    #[error("Already active: {0}")]
    AlreadyActive(String),

    #[error("Not active: {0}")]
    NotActive(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Observer error: {0}")]
    Observer(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NotFound(_) => ErrorKind::NotFound,
            RelayError::Stale(_) => ErrorKind::Stale,
            RelayError::Paused(_) => ErrorKind::Paused,
            RelayError::Timeout(_) => ErrorKind::Timeout,
            RelayError::Ambiguous(_) => ErrorKind::Ambiguous,
            RelayError::AlreadyActive(_) => ErrorKind::AlreadyActive,
            RelayError::NotActive(_) => ErrorKind::NotActive,
            RelayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RelayError::Observer(_) => ErrorKind::Observer,
        }
    }

    /// The human-readable detail without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            RelayError::NotFound(s)
            | RelayError::Stale(s)
            | RelayError::Paused(s)
            | RelayError::Timeout(s)
            | RelayError::Ambiguous(s)
            | RelayError::AlreadyActive(s)
            | RelayError::NotActive(s)
            | RelayError::InvalidRequest(s)
            | RelayError::Observer(s) => s,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.detail().to_string(),
        }
    }
}

impl From<ErrorBody> for RelayError {
    fn from(body: ErrorBody) -> Self {
        let ErrorBody { kind, message } = body;
        match kind {
            ErrorKind::NotFound => RelayError::NotFound(message),
            ErrorKind::Stale => RelayError::Stale(message),
            ErrorKind::Paused => RelayError::Paused(message),
            ErrorKind::Timeout => RelayError::Timeout(message),
            ErrorKind::Ambiguous => RelayError::Ambiguous(message),
            ErrorKind::AlreadyActive => RelayError::AlreadyActive(message),
            ErrorKind::NotActive => RelayError::NotActive(message),
            ErrorKind::InvalidRequest => RelayError::InvalidRequest(message),
            ErrorKind::Observer => RelayError::Observer(message),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::InvalidRequest(e.to_string())
    }
}
