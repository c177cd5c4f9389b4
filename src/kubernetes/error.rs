//! Classified node-drain failures.

use thiserror::Error;

/// High-level category of a drain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainErrorKind {
    /// Communication with the Kubernetes API server failed.
    ApiCall,
    /// The underlying infrastructure misbehaved.
    CloudProvider,
    /// A bug inside the operator.
    Internal,
    /// Worth retrying on the next detection tick without further action.
    Transient,
}

/// A drain failure with its category.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DrainError {
    kind: DrainErrorKind,
    message: String,
}

impl DrainError {
    pub fn new(kind: DrainErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn api_call(message: impl Into<String>) -> Self {
        Self::new(DrainErrorKind::ApiCall, message)
    }

    pub fn cloud_provider(message: impl Into<String>) -> Self {
        Self::new(DrainErrorKind::CloudProvider, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DrainErrorKind::Internal, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(DrainErrorKind::Transient, message)
    }

    pub fn kind(&self) -> DrainErrorKind {
        self.kind
    }

    /// Whether the failure should clear itself by the next tick.
    pub fn is_transient(&self) -> bool {
        self.kind == DrainErrorKind::Transient
    }
}
