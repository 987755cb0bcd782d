//! Unified error types for the carte workspace.
//!
//! Variants follow the engine's failure taxonomy: validation problems are
//! reported before any state is touched, resource and process errors abort
//! the current operation, and state errors describe lifecycle precondition
//! violations.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CarteError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// User input (manifest, limits, names, configuration) is invalid.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identity already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("cannot {operation} container {id}: {reason}")]
    InvalidState {
        /// Container name.
        id: String,
        /// Operation that was refused.
        operation: &'static str,
        /// Why the operation was refused.
        reason: String,
    },

    /// A kernel resource (cgroup, mount, device node, namespace) could not be set up.
    #[error("resource error: {message}")]
    Resource {
        /// Description of the failure.
        message: String,
    },

    /// Spawning, signaling, or waiting on a process failed.
    #[error("process error: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    /// Bridge, veth, namespace, or plugin network setup failed.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CarteError {
    /// Builds an [`CarteError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`CarteError::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by bad input rather than the host.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CarteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_operation() {
        let err = CarteError::InvalidState {
            id: "c1".into(),
            operation: "remove",
            reason: "container is running; stop it first".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot remove container c1: container is running; stop it first"
        );
    }

    #[test]
    fn not_found_is_validation() {
        let err = CarteError::NotFound {
            kind: "image",
            id: "alpine".into(),
        };
        assert!(err.is_validation());
        assert!(!CarteError::Process { message: "x".into() }.is_validation());
    }
}
