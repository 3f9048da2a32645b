// crates/memvault-vault/src/keystore/native.rs
// keyring-backed store: Keychain, Secret Service or Credential Manager

use super::{Backend, KeyRecord, KeyStore, METADATA_SUFFIX, now_epoch, validate_key_id};
use crate::error::{Result, VaultError};
use crate::secure::SecureBuffer;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Credential Manager rejects secrets above this many bytes.
const CREDENTIAL_BLOB_LIMIT: usize = 2560;

/// Companion entry written next to each key.
///
/// `fingerprint` ties the metadata to one specific key value, so a reader
/// that races an interrupted overwrite sees an error instead of old bytes
/// paired with new metadata.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMetadata {
    #[serde(default)]
    attributes: HashMap<String, String>,
    created_at: i64,
    #[serde(default)]
    expires_at: Option<i64>,
    fingerprint: String,
}

/// Secret store of the host OS, reached through the `keyring` crate.
///
/// The key is written base64-encoded under `key_id`; metadata is JSON under
/// `key_id + "_metadata"`. None of the supported stores can enumerate
/// entries for a service, so `list_keys` is always empty.
pub struct NativeKeyStore {
    service: String,
    backend: Backend,
}

impl NativeKeyStore {
    pub fn new(service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        if service.trim().is_empty() {
            return Err(VaultError::Config("service name is empty".to_string()));
        }
        Ok(Self {
            service,
            backend: Backend::native(),
        })
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| VaultError::StorageFailure(format!("{name}: {e}")))
    }

    fn metadata_entry(&self, key_id: &str) -> Result<keyring::Entry> {
        self.entry(&format!("{key_id}{METADATA_SUFFIX}"))
    }

    fn check_size(&self, what: &str, value: &str) -> Result<()> {
        if self.backend == Backend::CredentialManager && value.len() > CREDENTIAL_BLOB_LIMIT {
            return Err(VaultError::StorageFailure(format!(
                "{what} is {} bytes, credential manager limit is {CREDENTIAL_BLOB_LIMIT}",
                value.len()
            )));
        }
        Ok(())
    }
}

fn fingerprint(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

/// NoEntry means absent; everything else is a storage failure.
fn map_keyring(key_id: &str, err: keyring::Error) -> VaultError {
    match err {
        keyring::Error::NoEntry => VaultError::NotFound(key_id.to_string()),
        other => VaultError::StorageFailure(format!("{key_id}: {other}")),
    }
}

/// One named secret. `keyring::Entry` in production.
trait SecretSlot {
    fn get(&self) -> keyring::Result<String>;
    fn set(&self, secret: &str) -> keyring::Result<()>;
    fn remove(&self) -> keyring::Result<()>;
}

impl SecretSlot for keyring::Entry {
    fn get(&self) -> keyring::Result<String> {
        self.get_password()
    }

    fn set(&self, secret: &str) -> keyring::Result<()> {
        self.set_password(secret)
    }

    fn remove(&self) -> keyring::Result<()> {
        self.delete_credential()
    }
}

/// Write metadata, then the key. When the key write fails the metadata slot
/// is put back as it was, so the previous record stays readable and a fresh
/// id stays absent.
fn write_record(
    key_id: &str,
    meta: &dyn SecretSlot,
    key: &dyn SecretSlot,
    meta_json: &str,
    encoded: &str,
) -> Result<()> {
    let previous = match meta.get() {
        Ok(json) => Some(Zeroizing::new(json)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => return Err(map_keyring(key_id, e)),
    };

    meta.set(meta_json).map_err(|e| map_keyring(key_id, e))?;

    if let Err(e) = key.set(encoded) {
        let rollback = match &previous {
            Some(json) => meta.set(json),
            None => match meta.remove() {
                Err(keyring::Error::NoEntry) => Ok(()),
                other => other,
            },
        };
        if let Err(re) = rollback {
            warn!(key_id, error = %re, "Failed to roll back key metadata");
        }
        return Err(VaultError::StorageFailure(format!("{key_id}: {e}")));
    }
    Ok(())
}

impl KeyStore for NativeKeyStore {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn store(
        &self,
        key_id: &str,
        key: &[u8],
        metadata: &HashMap<String, String>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        validate_key_id(key_id)?;

        let encoded = Zeroizing::new(BASE64.encode(key));
        let meta_json = serde_json::to_string(&StoredMetadata {
            attributes: metadata.clone(),
            created_at: now_epoch(),
            expires_at,
            fingerprint: fingerprint(key),
        })?;
        self.check_size("key", &encoded)?;
        self.check_size("metadata", &meta_json)?;

        write_record(
            key_id,
            &self.metadata_entry(key_id)?,
            &self.entry(key_id)?,
            &meta_json,
            &encoded,
        )?;

        debug!(key_id, backend = %self.backend, "Stored key");
        Ok(())
    }

    fn retrieve(&self, key_id: &str) -> Result<KeyRecord> {
        validate_key_id(key_id)?;

        let encoded = Zeroizing::new(
            self.entry(key_id)?
                .get_password()
                .map_err(|e| map_keyring(key_id, e))?,
        );
        let key = Zeroizing::new(BASE64.decode(encoded.as_bytes()).map_err(|e| {
            VaultError::StorageFailure(format!("{key_id}: stored key is not base64: {e}"))
        })?);

        let meta_json = match self.metadata_entry(key_id)?.get_password() {
            Ok(json) => json,
            Err(keyring::Error::NoEntry) => {
                return Err(VaultError::StorageFailure(format!(
                    "{key_id}: metadata entry missing"
                )));
            }
            Err(e) => return Err(map_keyring(key_id, e)),
        };
        let stored: StoredMetadata = serde_json::from_str(&meta_json).map_err(|e| {
            VaultError::StorageFailure(format!("{key_id}: corrupt metadata: {e}"))
        })?;

        if stored.fingerprint != fingerprint(&key) {
            return Err(VaultError::StorageFailure(format!(
                "{key_id}: key and metadata do not match (interrupted write?)"
            )));
        }

        Ok(KeyRecord {
            key: SecureBuffer::from_zeroizing(key),
            metadata: stored.attributes,
            created_at: stored.created_at,
            expires_at: stored.expires_at,
        })
    }

    fn delete(&self, key_id: &str) -> Result<()> {
        validate_key_id(key_id)?;

        // Key first so readers stop seeing the record immediately.
        self.entry(key_id)?
            .delete_credential()
            .map_err(|e| map_keyring(key_id, e))?;

        match self.metadata_entry(key_id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => warn!(key_id, error = %e, "Failed to delete key metadata entry"),
        }

        debug!(key_id, backend = %self.backend, "Deleted key");
        Ok(())
    }

    fn exists(&self, key_id: &str) -> bool {
        if validate_key_id(key_id).is_err() {
            return false;
        }
        let entry = match self.entry(key_id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key_id, error = %e, "Key existence check failed");
                return false;
            }
        };
        match entry.get_password() {
            Ok(secret) => {
                drop(Zeroizing::new(secret));
                true
            }
            Err(keyring::Error::NoEntry) => false,
            Err(e) => {
                warn!(key_id, error = %e, "Key existence check failed");
                false
            }
        }
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        warn!(
            backend = %self.backend,
            "list_keys is not supported by the native key store; returning an empty list"
        );
        Ok(Vec::new())
    }
}
