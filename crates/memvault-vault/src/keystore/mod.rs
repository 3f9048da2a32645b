// crates/memvault-vault/src/keystore/mod.rs
// Uniform contract over OS secret stores

mod memory;
mod native;

pub use memory::MemoryKeyStore;
pub use native::NativeKeyStore;

use crate::error::{Result, VaultError};
use crate::secure::SecureBuffer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Longest accepted key identifier
pub const MAX_KEY_ID_LEN: usize = 200;

/// Suffix of the companion entry that holds a key's metadata
pub const METADATA_SUFFIX: &str = "_metadata";

/// Which secret store is behind a [`KeyStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    CredentialManager,
    SecretService,
    Keychain,
    Memory,
}

impl Backend {
    /// Native store for the platform this binary was built for.
    pub fn native() -> Self {
        if cfg!(target_os = "windows") {
            Backend::CredentialManager
        } else if cfg!(target_os = "macos") {
            Backend::Keychain
        } else {
            Backend::SecretService
        }
    }

    /// Whether `list_keys` can return what is actually stored.
    pub fn can_enumerate(self) -> bool {
        matches!(self, Backend::Memory)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::CredentialManager => "credential-manager",
            Backend::SecretService => "secret-service",
            Backend::Keychain => "keychain",
            Backend::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Back-end selection from config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Native,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "memory" => Ok(BackendKind::Memory),
            other => Err(VaultError::Config(format!("unknown key store backend: {other}"))),
        }
    }
}

/// A fully read key record. The key bytes stay inside a [`SecureBuffer`].
#[derive(Debug)]
pub struct KeyRecord {
    pub key: SecureBuffer,
    pub metadata: HashMap<String, String>,
    /// Epoch seconds
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// Storage contract shared by every secret-store back-end.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
/// `store` replaces any previous record for the id as a whole.
pub trait KeyStore: Send + Sync {
    fn backend(&self) -> Backend;

    fn store(
        &self,
        key_id: &str,
        key: &[u8],
        metadata: &HashMap<String, String>,
        expires_at: Option<i64>,
    ) -> Result<()>;

    /// `NotFound` when nothing is stored under `key_id`.
    fn retrieve(&self, key_id: &str) -> Result<KeyRecord>;

    /// `NotFound` when nothing is stored under `key_id`.
    fn delete(&self, key_id: &str) -> Result<()>;

    /// Never fails; lookup errors are logged and read as absent.
    fn exists(&self, key_id: &str) -> bool;

    /// Empty on back-ends that cannot enumerate their entries.
    fn list_keys(&self) -> Result<Vec<String>>;
}

/// Open the configured back-end. Called once at daemon start.
pub fn open(kind: BackendKind, service_name: &str) -> Result<Arc<dyn KeyStore>> {
    let store: Arc<dyn KeyStore> = match kind {
        BackendKind::Native => Arc::new(NativeKeyStore::new(service_name)?),
        BackendKind::Memory => {
            tracing::warn!("Using in-memory key store; keys are lost when the daemon exits");
            Arc::new(MemoryKeyStore::new())
        }
    };
    tracing::info!(backend = %store.backend(), service = service_name, "Key store ready");
    Ok(store)
}

/// Reject identifiers that would collide with metadata entries or that
/// secret stores handle inconsistently.
pub fn validate_key_id(key_id: &str) -> Result<()> {
    if key_id.is_empty() {
        return Err(VaultError::InvalidRequest("key_id is empty".to_string()));
    }
    if key_id.len() > MAX_KEY_ID_LEN {
        return Err(VaultError::InvalidRequest(format!(
            "key_id longer than {MAX_KEY_ID_LEN} bytes"
        )));
    }
    if let Some(bad) = key_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '-')))
    {
        return Err(VaultError::InvalidRequest(format!(
            "key_id contains invalid character {bad:?}"
        )));
    }
    if key_id.ends_with(METADATA_SUFFIX) {
        return Err(VaultError::InvalidRequest(format!(
            "key_id may not end with {METADATA_SUFFIX}"
        )));
    }
    Ok(())
}

pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_id_accepts_common_forms() {
        for id in ["k1", "memvault.user-1.v2", "svc:key@host", "a_b"] {
            assert!(validate_key_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_validate_key_id_rejects() {
        assert!(validate_key_id("").is_err());
        assert!(validate_key_id("has space").is_err());
        assert!(validate_key_id("slash/inside").is_err());
        assert!(validate_key_id("k1_metadata").is_err());
        assert!(validate_key_id(&"x".repeat(MAX_KEY_ID_LEN + 1)).is_err());
        assert!(matches!(
            validate_key_id("bad key"),
            Err(VaultError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" Memory ".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("dpapi".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_native_backend_matches_platform() {
        let backend = Backend::native();
        #[cfg(target_os = "macos")]
        assert_eq!(backend, Backend::Keychain);
        #[cfg(target_os = "windows")]
        assert_eq!(backend, Backend::CredentialManager);
        #[cfg(all(unix, not(target_os = "macos")))]
        assert_eq!(backend, Backend::SecretService);
        assert!(!backend.can_enumerate());
    }

    #[test]
    fn test_open_memory_backend() {
        let store = open(BackendKind::Memory, "memvault-test").unwrap();
        assert_eq!(store.backend(), Backend::Memory);
        assert_eq!(store.backend().to_string(), "memory");
    }
}
