// crates/memvault-types/src/lib.rs
// Shared types for the memvault gateway API
// Serde only; safe to depend on from any client

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ═══════════════════════════════════════
// MEMORY RECORDS
// ═══════════════════════════════════════

/// A decrypted memory as seen by API callers.
///
/// Never carries the embedding or the encryption key identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds
    pub updated_at: i64,
}

/// One similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMatch {
    pub memory: Memory,
    pub similarity_score: f32,
}

/// Filter-only query. Every listed tag must be present and every metadata
/// pair must match exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryFilter {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl MemoryFilter {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
            && self.tags.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }
}

// ═══════════════════════════════════════
// REQUESTS / RESPONSES
// ═══════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMemoryRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Precomputed embedding; computed by the gateway when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreMemoryResponse {
    pub memory_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMemoriesRequest {
    pub query_embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Cosine similarity floor in [0, 1]; 0.7 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub filters: MemoryFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchMemoriesResponse {
    pub matches: Vec<MemoryMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoriesResponse {
    pub memories: Vec<Memory>,
    pub total_count: usize,
}

/// Replaces tags and/or metadata; content is immutable after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchMemoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteMemoryResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateKeyRequest {
    pub scope: String,
    /// Re-encrypt the scope's records under the new key right away
    #[serde(default)]
    pub reencrypt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotateKeyResponse {
    pub scope: String,
    pub key_id: String,
    pub version: u32,
    pub retired_key_id: Option<String>,
    pub reencrypted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub vault: bool,
    pub version: String,
    pub uptime_secs: u64,
}

// ═══════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════

/// Error kinds surfaced to API callers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    StorageFailure,
    ConnectionFailure,
    ProtocolError,
    Unauthenticated,
    PermissionDenied,
    DeadlineExceeded,
    Internal,
}

impl ErrorCode {
    /// Whether a caller should retry with backoff
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailure | ErrorCode::StorageFailure | ErrorCode::DeadlineExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::ConnectionFailure => "connection_failure",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Body of every error response: `{"error": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}
