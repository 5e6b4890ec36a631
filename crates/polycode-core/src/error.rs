//! Error types for Polycode

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for collaborative editing operations
#[derive(Error, Debug)]
pub enum CollabError {
    /// Error during gossip topic operations (rendezvous)
    #[error("Gossip error: {0}")]
    Gossip(String),

    /// Network-related error (endpoint, connection, stream)
    #[error("Network error: {0}")]
    Network(String),

    /// Peer connection failed or is gone
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Target document could not be opened or edited
    #[error("Document error for {path}: {reason}")]
    Document {
        /// Resolved document path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Document does not exist and the policy forbids creating it
    #[error("Document not found: {0}")]
    DocumentNotFound(PathBuf),

    /// Relative path escapes the workspace root
    #[error("Path escapes workspace: {0}")]
    PathOutsideWorkspace(String),

    /// External command exited unsuccessfully
    #[error("Command '{step}' failed: {reason}")]
    Command {
        /// Step name
        step: String,
        /// Exit status or spawn failure
        reason: String,
    },

    /// External command exceeded its time budget
    #[error("Command '{step}' timed out after {timeout:?}")]
    Timeout {
        /// Step name
        step: String,
        /// Configured budget
        timeout: Duration,
    },

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using CollabError
pub type CollabResult<T> = Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::DocumentNotFound(PathBuf::from("src/a.txt"));
        assert_eq!(format!("{}", err), "Document not found: src/a.txt");

        let err = CollabError::Timeout {
            step: "git fetch".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(format!("{}", err), "Command 'git fetch' timed out after 30s");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CollabError = io_err.into();
        assert!(matches!(err, CollabError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CollabError = json_err.into();
        assert!(matches!(err, CollabError::Json(_)));
    }
}
