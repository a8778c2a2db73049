//! Error taxonomy for orchestration operations
//!
//! Every mutating operation either succeeds or fails with one of these
//! classified errors. Cache and notification failures never surface here;
//! they are logged where they happen.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;
use crate::variables::CodecError;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Transient failure: {0}")]
    Transient(String),
}

/// Coarse classification used by callers that map errors onto a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidState,
    Conflict,
    PermissionDenied,
    NotFound,
    Transient,
}

impl OrchestrationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Transient(_) => ErrorKind::Transient,
        }
    }

    /// Only storage/infrastructure hiccups are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for OrchestrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Duplicate { entity, id } => {
                Self::Conflict(format!("{} already exists: {}", entity, id))
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<CodecError> for OrchestrationError {
    fn from(err: CodecError) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
