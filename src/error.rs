//! Crate-wide error type and the OK/CLOSED reason-string mapping.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Every error kind the core produces, paired with the standardized reason
/// prefix a client uses to classify the failure.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Detail is logged, never shown to the client verbatim -- the client
    /// only ever sees the fixed `invalid:` reason body.
    #[error("{0}")]
    MalformedFrame(String),

    #[error("event id is computed incorrectly")]
    BadId,

    /// Detail is logged, not sent to the client -- the fixed reason body is
    /// always `signature is invalid`.
    #[error("signature is invalid")]
    BadSignature(String),

    #[error("event was deleted, not storing it again")]
    Tombstoned,

    #[error("not replacing newer replaceable event")]
    ReplaceableOlder,

    #[error("not replacing newer parameterized replaceable event")]
    ParameterizedReplaceableOlder,

    #[error("cannot delete events from other authors")]
    DeletionAuthorMismatch,

    #[error("{0}")]
    DeletionInvalidTarget(String),

    #[error("auth-required")]
    AuthRequired,

    #[error("{0}")]
    StoreTransient(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// The standardized prefix used in OK/CLOSED reason strings.
    pub fn reason_prefix(&self) -> &'static str {
        match self {
            RelayError::MalformedFrame(_) => "invalid:",
            RelayError::BadId => "invalid:",
            RelayError::BadSignature(_) => "error:",
            RelayError::Tombstoned => "blocked:",
            RelayError::ReplaceableOlder => "invalid:",
            RelayError::ParameterizedReplaceableOlder => "error:",
            RelayError::DeletionAuthorMismatch => "blocked:",
            RelayError::DeletionInvalidTarget(_) => "error:",
            RelayError::AuthRequired => "auth-required:",
            RelayError::StoreTransient(_) => "error:",
            RelayError::Unsupported(_) => "unsupported:",
            RelayError::Internal(_) => "error:",
        }
    }

    /// Full reason string as sent in an OK/CLOSED message body.
    pub fn reason(&self) -> String {
        match self {
            RelayError::AuthRequired => format!("{}", self.reason_prefix()),
            _ => format!("{}{}", self.reason_prefix(), self),
        }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::StoreTransient(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::MalformedFrame(e.to_string())
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        RelayError::StoreTransient(e.to_string())
    }
}
