// crates/memvault-vault/src/error.rs
// Error types for the key vault

use crate::protocol::ErrorCode;
use thiserror::Error;

/// Main error type for the vault library
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task failed: {0}")]
    Task(String),
}

/// Convenience type alias for Result using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound(_))
    }

    /// Stable prefix used on the wire so clients can branch on the kind
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            VaultError::NotFound(_) => ErrorCode::NotFound,
            VaultError::InvalidRequest(_) | VaultError::Json(_) => ErrorCode::InvalidRequest,
            VaultError::StorageFailure(_)
            | VaultError::Config(_)
            | VaultError::Io(_)
            | VaultError::Task(_) => ErrorCode::StorageFailure,
        }
    }

    /// `"<code>: <message>"` form carried by `VaultResponse::Error`
    pub fn to_wire_message(&self) -> String {
        format!("{}: {}", self.wire_code().as_str(), self)
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            VaultError::Task("cancelled".to_string())
        } else {
            VaultError::Task(err.to_string())
        }
    }
}
