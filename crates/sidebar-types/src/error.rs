use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category carried on the wire in `GatewayEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    Transient,
}

/// Failure of a single DM operation. Every variant is rejected
/// synchronously to the caller with no partial state change and no
/// broadcast; `Transient` is the only retryable one.
#[derive(Debug, Clone, Error)]
pub enum DmError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not allowed: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("temporary failure, retry: {0}")]
    Transient(String),
}

impl DmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }
}
