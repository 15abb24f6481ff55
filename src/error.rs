//! Error types for the Kong ingress controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kong Admin API error
    #[error("kong error: {0}")]
    Kong(#[from] crate::kong::KongError),

    /// Validation error on user-provided specs (Ingress rules, Domain
    /// specs). Reconcilers catch these at the boundary, surface an Event and
    /// report success so the key is not requeued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Reconciliation error, requeued with backoff
    #[error("{0}")]
    Sync(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a sync error with the given message
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }
}
