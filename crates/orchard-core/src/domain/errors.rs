//! Domain error types.

use thiserror::Error;

/// Errors raised by domain-level validation and state transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid object name (empty, contains `/`, or over NAME_MAX)
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid identifier format
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Invalid content hash format
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Attempted sync-state transition that the state machine forbids
    #[error("Invalid sync state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// A sibling with the same `(name, extension)` already exists
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DomainError::InvalidName("a/b".to_string());
        assert_eq!(err.to_string(), "Invalid name: a/b");

        let err = DomainError::InvalidTransition {
            from: "synced".to_string(),
            to: "pending_pull".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid sync state transition from synced to pending_pull"
        );
    }

    #[test]
    fn test_equality() {
        let a = DomainError::AlreadyExists("note.txt".to_string());
        let b = DomainError::AlreadyExists("note.txt".to_string());
        assert_eq!(a, b);
    }
}
