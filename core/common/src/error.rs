//! Common error types for Lodestar.

use thiserror::Error;

use crate::types::ActionName;

/// Top-level error type for Lodestar operations.
///
/// `Clone` so that one failed fetch can be handed to every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No execution order resolved to any backend for this action.
    #[error("No backends configured for {action}")]
    NoBackendsConfigured { action: ActionName },

    /// A backend handler rejected the action.
    #[error("Backend '{backend}' failed on {action}: {source}")]
    BackendActionFailed {
        backend: String,
        action: ActionName,
        #[source]
        source: Box<Error>,
    },

    /// A revert handler itself failed; remaining reverts were skipped.
    #[error("Revert failed on backend '{backend}' for {action}: {source}")]
    RevertFailed {
        backend: String,
        action: ActionName,
        #[source]
        source: Box<Error>,
    },

    /// Action invoked on the wrong kind of path.
    #[error("Invalid target: {0}")]
    InvalidTargetKind(String),

    /// Execution order names a backend that was never registered.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Generic failure raised by a backend adapter.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Background work was dropped before it produced a result.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Wrap an adapter error with the backend and action that produced it.
    pub fn backend_failed(backend: impl Into<String>, action: ActionName, source: Error) -> Self {
        Self::BackendActionFailed {
            backend: backend.into(),
            action,
            source: Box::new(source),
        }
    }

    /// The adapter error behind a `BackendActionFailed`, or `self`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::BackendActionFailed { source, .. } | Self::RevertFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
