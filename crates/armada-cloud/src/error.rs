//! Compute backend error types

use thiserror::Error;

/// Errors reported by a compute backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation not implemented by backend: {0}")]
    NotImplemented(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Duplicate resource: {0}")]
    Duplicate(String),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("API error: {0}")]
    Api(String),
}

impl BackendError {
    /// The requested resource does not exist on the backend.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    /// The backend does not support the requested operation.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, BackendError::NotImplemented(_))
    }

    /// The failure is worth retrying after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    /// The backend rejected the caller's credentials.
    pub fn is_auth_denied(&self) -> bool {
        matches!(
            self,
            BackendError::Unauthorized(_) | BackendError::Forbidden(_)
        )
    }
}

/// Classifies backend errors that invalidate the session's credentials.
///
/// Batch operations consult the classifier after every backend call; a
/// positive answer stops the batch so a revoked account does not get
/// hammered with further calls.
pub trait CredentialClassifier: Send + Sync {
    /// Whether the error means the cloud account itself is denied.
    fn is_auth_failure(&self, error: &BackendError) -> bool;
}

/// Default classifier: unauthorized and forbidden responses invalidate.
#[derive(Debug, Clone, Default)]
pub struct DeniedStatusClassifier;

impl CredentialClassifier for DeniedStatusClassifier {
    fn is_auth_failure(&self, error: &BackendError) -> bool {
        error.is_auth_denied()
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
