// crates/memvault-vault/src/keystore/memory.rs
// Process-local key store for tests and throwaway dev runs

use super::{Backend, KeyRecord, KeyStore, now_epoch, validate_key_id};
use crate::error::{Result, VaultError};
use crate::secure::SecureBuffer;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use zeroize::Zeroizing;

struct Entry {
    key: Zeroizing<Vec<u8>>,
    metadata: HashMap<String, String>,
    created_at: i64,
    expires_at: Option<i64>,
}

/// Keys live in a map behind one `RwLock`; a store swaps the whole entry.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn store(
        &self,
        key_id: &str,
        key: &[u8],
        metadata: &HashMap<String, String>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        validate_key_id(key_id)?;
        let entry = Entry {
            key: Zeroizing::new(key.to_vec()),
            metadata: metadata.clone(),
            created_at: now_epoch(),
            expires_at,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key_id.to_string(), entry);
        Ok(())
    }

    fn retrieve(&self, key_id: &str) -> Result<KeyRecord> {
        validate_key_id(key_id)?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get(key_id)
            .ok_or_else(|| VaultError::NotFound(key_id.to_string()))?;
        Ok(KeyRecord {
            key: SecureBuffer::from_slice(&entry.key),
            metadata: entry.metadata.clone(),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        })
    }

    fn delete(&self, key_id: &str) -> Result<()> {
        validate_key_id(key_id)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key_id)
            .map(drop)
            .ok_or_else(|| VaultError::NotFound(key_id.to_string()))
    }

    fn exists(&self, key_id: &str) -> bool {
        if validate_key_id(key_id).is_err() {
            return false;
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key_id)
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}
