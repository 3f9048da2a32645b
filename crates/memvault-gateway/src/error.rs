// crates/memvault-gateway/src/error.rs
// Error taxonomy surfaced by the gateway

use crate::crypto::CryptoError;
use crate::vault_client::VaultClientError;
use memvault_types::ErrorCode;
use thiserror::Error;

/// Main error type for the gateway library
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("vault connection failure: {0}")]
    ConnectionFailure(String),

    #[error("vault protocol error: {0}")]
    ProtocolError(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Result using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Kind reported to API callers
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            GatewayError::StorageFailure(_) | GatewayError::Db(_) => ErrorCode::StorageFailure,
            GatewayError::ConnectionFailure(_) => ErrorCode::ConnectionFailure,
            GatewayError::ProtocolError(_) => ErrorCode::ProtocolError,
            GatewayError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            GatewayError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            GatewayError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            GatewayError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        GatewayError::InvalidArgument(msg.into())
    }
}

impl From<VaultClientError> for GatewayError {
    fn from(err: VaultClientError) -> Self {
        match err {
            VaultClientError::ConnectionFailure(msg) => GatewayError::ConnectionFailure(msg),
            VaultClientError::Timeout(after) => {
                GatewayError::ConnectionFailure(format!("vault did not answer within {after:?}"))
            }
            VaultClientError::ProtocolError(msg) => GatewayError::ProtocolError(msg),
            // A record referencing a key the vault no longer has
            VaultClientError::NotFound(key_id) => {
                GatewayError::Internal(format!("encryption key {key_id} missing from vault"))
            }
            VaultClientError::RemoteError(msg) => GatewayError::StorageFailure(msg),
        }
    }
}

impl From<CryptoError> for GatewayError {
    fn from(err: CryptoError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("stored JSON is corrupt: {err}"))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GatewayError>() {
            Ok(inner) => inner,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(db) => GatewayError::Db(db),
                Err(other) => GatewayError::StorageFailure(format!("{other:#}")),
            },
        }
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        GatewayError::Internal(format!("task failed: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::DeadlineExceeded
    }
}
