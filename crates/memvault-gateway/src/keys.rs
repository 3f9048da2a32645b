// crates/memvault-gateway/src/keys.rs
// Per-scope data keys: provisioning, lookup and rotation

use crate::crypto;
use crate::db::{self, DataKeyRow, DatabasePool};
use crate::error::{GatewayError, Result};
use crate::vault_client::VaultClient;
use memvault_vault::SecureBuffer;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const KEY_PREFIX: &str = "memvault";
const PURPOSE: &str = "memory-data-key";
const MAX_SLUG_LEN: usize = 64;
/// Versions probed past the index before giving up on a free key id
const MAX_VERSION_PROBES: u32 = 100;

/// A data key fetched from the vault
pub struct DataKey {
    pub key_id: String,
    pub key: SecureBuffer,
}

/// Scope as it appears inside a key id. Scopes that are not plain
/// `[A-Za-z0-9_-]` words are replaced by a hash.
pub fn scope_slug(scope: &str) -> String {
    let plain = !scope.is_empty()
        && scope.len() <= MAX_SLUG_LEN
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if plain {
        scope.to_string()
    } else {
        let digest = Sha256::digest(scope.as_bytes());
        format!("h{}", &hex::encode(digest)[..32])
    }
}

pub fn key_id_for(scope: &str, version: u32) -> String {
    format!("{KEY_PREFIX}.{}.v{version}", scope_slug(scope))
}

pub struct KeyManager {
    vault: Arc<VaultClient>,
    pool: Arc<DatabasePool>,
    provision_lock: Mutex<()>,
}

impl KeyManager {
    pub fn new(vault: Arc<VaultClient>, pool: Arc<DatabasePool>) -> Self {
        Self {
            vault,
            pool,
            provision_lock: Mutex::new(()),
        }
    }

    /// Active key for `scope`, provisioning version 1 on first use.
    pub async fn active_key(&self, scope: &str) -> Result<DataKey> {
        if let Some(row) = self.active_row(scope).await? {
            return self.fetch(&row.key_id).await;
        }

        let _guard = self.provision_lock.lock().await;
        // Another request may have provisioned while we waited
        if let Some(row) = self.active_row(scope).await? {
            return self.fetch(&row.key_id).await;
        }
        let (key, _) = self.provision(scope).await?;
        Ok(key)
    }

    /// Key bytes for any key id the index has seen, active or retired.
    pub async fn fetch(&self, key_id: &str) -> Result<DataKey> {
        let retrieved = self.vault.retrieve_key(key_id).await?;
        Ok(DataKey {
            key_id: key_id.to_string(),
            key: retrieved.key,
        })
    }

    /// Provision the next version for `scope` and retire the current one.
    /// The retired key stays in the vault so old records still open.
    pub async fn rotate(&self, scope: &str) -> Result<(DataKeyRow, Option<String>)> {
        let _guard = self.provision_lock.lock().await;
        let (key, retired) = self.provision(scope).await?;
        let row = self
            .active_row(scope)
            .await?
            .filter(|row| row.key_id == key.key_id)
            .ok_or_else(|| GatewayError::Internal(format!("rotated key {} not active", key.key_id)))?;
        Ok((row, retired))
    }

    pub async fn list(&self, scope: Option<&str>) -> Result<Vec<DataKeyRow>> {
        let scope = scope.map(str::to_string);
        self.pool
            .run(move |conn| db::list_keys_sync(conn, scope.as_deref()))
            .await
    }

    async fn active_row(&self, scope: &str) -> Result<Option<DataKeyRow>> {
        let scope = scope.to_string();
        self.pool
            .run(move |conn| db::active_key_sync(conn, &scope))
            .await
    }

    /// Caller holds `provision_lock`.
    async fn provision(&self, scope: &str) -> Result<(DataKey, Option<String>)> {
        let owned_scope = scope.to_string();
        let latest = self
            .pool
            .run(move |conn| db::latest_version_sync(conn, &owned_scope))
            .await?;

        // Never overwrite a key the vault already holds, even one the index
        // does not know about (e.g. after the database was replaced).
        let mut version = latest + 1;
        let mut key_id = key_id_for(scope, version);
        let mut probes = 0;
        while self.vault.key_exists(&key_id).await? {
            probes += 1;
            if probes > MAX_VERSION_PROBES {
                return Err(GatewayError::Internal(format!(
                    "no free key version for scope {scope} after {MAX_VERSION_PROBES} probes"
                )));
            }
            warn!(key_id = %key_id, "Vault already holds key id, skipping version");
            version += 1;
            key_id = key_id_for(scope, version);
        }

        let key = crypto::generate_key();
        let metadata = HashMap::from([
            ("algorithm".to_string(), crypto::ALGORITHM.to_string()),
            ("purpose".to_string(), PURPOSE.to_string()),
            ("scope".to_string(), scope.to_string()),
            ("version".to_string(), version.to_string()),
        ]);
        self.vault.store_key(&key_id, &key, &metadata, None).await?;

        let now = chrono::Utc::now().timestamp();
        let (id, s) = (key_id.clone(), scope.to_string());
        let retired = self
            .pool
            .run_with_retry(move |conn| db::activate_key_sync(conn, &id, &s, version, now))
            .await?;

        info!(key_id = %key_id, retired = ?retired, "Provisioned data key");
        Ok((DataKey { key_id, key }, retired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_scopes_kept() {
        assert_eq!(scope_slug("u1"), "u1");
        assert_eq!(scope_slug("user_42-a"), "user_42-a");
        assert_eq!(key_id_for("u1", 3), "memvault.u1.v3");
    }

    #[test]
    fn test_unsafe_scopes_hashed() {
        let slug = scope_slug("alice@example.com");
        assert!(slug.starts_with('h'));
        assert_eq!(slug.len(), 33);
        assert_eq!(slug, scope_slug("alice@example.com"));
        assert_ne!(slug, scope_slug("bob@example.com"));

        assert!(scope_slug("").starts_with('h'));
        assert!(scope_slug("a.b").starts_with('h'));
        assert!(scope_slug(&"x".repeat(65)).starts_with('h'));
    }

    #[test]
    fn test_key_ids_are_vault_safe() {
        for scope in ["u1", "alice@example.com", "ünïcode", "default"] {
            let id = key_id_for(scope, 12);
            memvault_vault::keystore::validate_key_id(&id).unwrap();
        }
    }
}
