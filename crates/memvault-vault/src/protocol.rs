// crates/memvault-vault/src/protocol.rs
// NDJSON request/response types for the vault socket

use crate::error::VaultError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

/// Request sent by a vault client.
///
/// One JSON value per line, externally tagged:
/// `{"RetrieveKey":{"key_id":"k1"}}`, `"Ping"` (or `{"Ping":null}`).
#[derive(Serialize, Deserialize)]
pub enum VaultRequest {
    Ping,
    StoreKey {
        key_id: String,
        key_data: Zeroizing<Vec<u8>>,
        #[serde(default)]
        metadata: HashMap<String, String>,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    RetrieveKey {
        key_id: String,
    },
    DeleteKey {
        key_id: String,
    },
    KeyExists {
        key_id: String,
    },
    ListKeys,
}

impl VaultRequest {
    /// Variant name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            VaultRequest::Ping => "Ping",
            VaultRequest::StoreKey { .. } => "StoreKey",
            VaultRequest::RetrieveKey { .. } => "RetrieveKey",
            VaultRequest::DeleteKey { .. } => "DeleteKey",
            VaultRequest::KeyExists { .. } => "KeyExists",
            VaultRequest::ListKeys => "ListKeys",
        }
    }

    /// The key this request touches, if any
    pub fn key_id(&self) -> Option<&str> {
        match self {
            VaultRequest::StoreKey { key_id, .. }
            | VaultRequest::RetrieveKey { key_id }
            | VaultRequest::DeleteKey { key_id }
            | VaultRequest::KeyExists { key_id } => Some(key_id),
            VaultRequest::Ping | VaultRequest::ListKeys => None,
        }
    }
}

impl fmt::Debug for VaultRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultRequest::StoreKey {
                key_id,
                key_data,
                metadata,
                expires_at,
            } => f
                .debug_struct("StoreKey")
                .field("key_id", key_id)
                .field("key_data", &format_args!("[REDACTED; {}]", key_data.len()))
                .field("metadata", metadata)
                .field("expires_at", expires_at)
                .finish(),
            other => match other.key_id() {
                Some(key_id) => f.debug_struct(other.kind()).field("key_id", &key_id).finish(),
                None => f.write_str(other.kind()),
            },
        }
    }
}

/// Response written by the daemon, one per request, in order.
#[derive(Serialize, Deserialize)]
pub enum VaultResponse {
    Pong,
    Success,
    KeyData {
        key_data: Zeroizing<Vec<u8>>,
        #[serde(default)]
        metadata: HashMap<String, String>,
        created_at: i64,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    KeyList(Vec<String>),
    Exists(bool),
    /// `"<code>: <message>"`, see [`ErrorCode`]
    Error(String),
}

impl VaultResponse {
    pub fn from_error(err: &VaultError) -> Self {
        VaultResponse::Error(err.to_wire_message())
    }

    pub fn error(code: ErrorCode, message: impl fmt::Display) -> Self {
        VaultResponse::Error(format!("{}: {message}", code.as_str()))
    }

    /// Variant name, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            VaultResponse::Pong => "Pong",
            VaultResponse::Success => "Success",
            VaultResponse::KeyData { .. } => "KeyData",
            VaultResponse::KeyList(_) => "KeyList",
            VaultResponse::Exists(_) => "Exists",
            VaultResponse::Error(_) => "Error",
        }
    }
}

impl fmt::Debug for VaultResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultResponse::KeyData {
                key_data,
                metadata,
                created_at,
                expires_at,
            } => f
                .debug_struct("KeyData")
                .field("key_data", &format_args!("[REDACTED; {}]", key_data.len()))
                .field("metadata", metadata)
                .field("created_at", created_at)
                .field("expires_at", expires_at)
                .finish(),
            VaultResponse::KeyList(ids) => f.debug_tuple("KeyList").field(ids).finish(),
            VaultResponse::Exists(b) => f.debug_tuple("Exists").field(b).finish(),
            VaultResponse::Error(msg) => f.debug_tuple("Error").field(msg).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// Stable error classes carried as a prefix of `VaultResponse::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    StorageFailure,
    InvalidRequest,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Timeout => "timeout",
        }
    }

    /// Split `"<code>: <message>"`. Messages without a known prefix come back
    /// whole with no code.
    pub fn parse(message: &str) -> (Option<ErrorCode>, &str) {
        let Some((code, rest)) = message.split_once(": ") else {
            return (None, message);
        };
        let code = match code {
            "not_found" => ErrorCode::NotFound,
            "storage_failure" => ErrorCode::StorageFailure,
            "invalid_request" => ErrorCode::InvalidRequest,
            "timeout" => ErrorCode::Timeout,
            _ => return (None, message),
        };
        (Some(code), rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_wire_format() {
        let req: VaultRequest = serde_json::from_str(
            r#"{"StoreKey":{"key_id":"k1","key_data":[1,2,3,4,5],"metadata":{"algo":"chacha20poly1305"},"expires_at":null}}"#,
        )
        .unwrap();
        match req {
            VaultRequest::StoreKey {
                key_id,
                key_data,
                metadata,
                expires_at,
            } => {
                assert_eq!(key_id, "k1");
                assert_eq!(key_data.as_slice(), &[1, 2, 3, 4, 5]);
                assert_eq!(metadata["algo"], "chacha20poly1305");
                assert_eq!(expires_at, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn store_key_optional_fields_default() {
        let req: VaultRequest =
            serde_json::from_str(r#"{"StoreKey":{"key_id":"k1","key_data":[9]}}"#).unwrap();
        assert!(matches!(
            req,
            VaultRequest::StoreKey { ref metadata, expires_at: None, .. } if metadata.is_empty()
        ));
    }

    #[test]
    fn unit_variants_accept_both_forms() {
        let a: VaultRequest = serde_json::from_str(r#""Ping""#).unwrap();
        let b: VaultRequest = serde_json::from_str(r#"{"Ping":null}"#).unwrap();
        assert!(matches!(a, VaultRequest::Ping));
        assert!(matches!(b, VaultRequest::Ping));

        let ok: VaultResponse = serde_json::from_str(r#"{"Success":null}"#).unwrap();
        assert!(matches!(ok, VaultResponse::Success));
        assert_eq!(serde_json::to_string(&VaultResponse::Success).unwrap(), r#""Success""#);
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(serde_json::from_str::<VaultRequest>(r#"{"DropAllKeys":null}"#).is_err());
        assert!(serde_json::from_str::<VaultRequest>(r#""Shutdown""#).is_err());
    }

    #[test]
    fn response_wire_format() {
        let json = serde_json::to_string(&VaultResponse::Exists(true)).unwrap();
        assert_eq!(json, r#"{"Exists":true}"#);

        let json = serde_json::to_string(&VaultResponse::KeyList(vec!["a".into()])).unwrap();
        assert_eq!(json, r#"{"KeyList":["a"]}"#);

        let json = serde_json::to_string(&VaultResponse::error(ErrorCode::NotFound, "k1")).unwrap();
        assert_eq!(json, r#"{"Error":"not_found: k1"}"#);
    }

    #[test]
    fn key_data_response_parses() {
        let resp: VaultResponse = serde_json::from_str(
            r#"{"KeyData":{"key_data":[7,7],"metadata":{},"created_at":1700000000,"expires_at":null}}"#,
        )
        .unwrap();
        match resp {
            VaultResponse::KeyData {
                key_data,
                created_at,
                ..
            } => {
                assert_eq!(key_data.as_slice(), &[7, 7]);
                assert_eq!(created_at, 1_700_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let req = VaultRequest::StoreKey {
            key_id: "k1".into(),
            key_data: Zeroizing::new(vec![0xDE, 0xAD]),
            metadata: HashMap::new(),
            expires_at: None,
        };
        let dbg = format!("{req:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("222"));

        let resp = VaultResponse::KeyData {
            key_data: Zeroizing::new(vec![0xDE, 0xAD]),
            metadata: HashMap::new(),
            created_at: 0,
            expires_at: None,
        };
        assert!(format!("{resp:?}").contains("REDACTED"));
        assert_eq!(format!("{:?}", VaultRequest::ListKeys), "ListKeys");
    }

    #[test]
    fn error_code_parse() {
        assert_eq!(
            ErrorCode::parse("not_found: key not found: k1"),
            (Some(ErrorCode::NotFound), "key not found: k1")
        );
        assert_eq!(
            ErrorCode::parse("storage_failure: locked"),
            (Some(ErrorCode::StorageFailure), "locked")
        );
        assert_eq!(ErrorCode::parse("something odd"), (None, "something odd"));
        assert_eq!(ErrorCode::parse("weird: thing"), (None, "weird: thing"));
    }

    #[test]
    fn request_key_id() {
        let req = VaultRequest::DeleteKey { key_id: "k".into() };
        assert_eq!(req.key_id(), Some("k"));
        assert_eq!(req.kind(), "DeleteKey");
        assert_eq!(VaultRequest::Ping.key_id(), None);
    }
}
