//! Crate-wide error types.

use std::time::Duration;

use thiserror::Error;

use crate::kubernetes::DrainError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the operator core.
#[derive(Debug, Error)]
pub enum Error {
    /// Data was rejected before being written to the store.
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage I/O, encoding, or transaction failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transport or server error from the cluster API.
    #[error("cluster API error: {0}")]
    ClusterApi(String),

    /// Error from the cloud actuator.
    #[error("cloud API error: {0}")]
    CloudApi(String),

    /// An operation was requested on a node in the wrong state.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// A bounded step exceeded its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The surrounding task was asked to stop.
    #[error("operation cancelled")]
    Cancelled,

    /// The persisted repair state no longer matches the configuration.
    #[error("configuration drift: {0}")]
    ConfigDrift(String),

    /// A classified node-drain failure.
    #[error(transparent)]
    Drain(#[from] DrainError),

    /// A failure whose cleanup also failed.
    #[error("{root}; additionally: {secondary}")]
    Combined {
        root: Box<Error>,
        secondary: Box<Error>,
    },
}

impl Error {
    /// Combines a root failure with a secondary failure from its
    /// cleanup path.
    pub fn combined(root: Error, secondary: Error) -> Error {
        Error::Combined {
            root: Box::new(root),
            secondary: Box::new(secondary),
        }
    }

    pub fn validation(message: impl Into<String>) -> Error {
        Error::Validation(message.into())
    }

    pub fn state_violation(message: impl Into<String>) -> Error {
        Error::StateViolation(message.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Error {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::ClusterApi(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("JSON encoding: {err}"))
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::Storage(err.to_string())
                }
            }
        )+
    };
}

storage_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_error_display() {
        let err = Error::combined(
            Error::ClusterApi("taint update failed".into()),
            Error::Storage("commit aborted".into()),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("taint update failed"));
        assert!(rendered.contains("additionally"));
        assert!(rendered.contains("commit aborted"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("drain", Duration::from_secs(600));
        assert!(err.to_string().contains("drain"));
        assert!(err.to_string().contains("600"));
    }
}
