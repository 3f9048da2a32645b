// crates/memvault-gateway/src/service.rs
// Encrypt/store and retrieve/decrypt pipeline behind every API call

use crate::auth::Caller;
use crate::config::Limits;
use crate::crypto;
use crate::db::{self, DatabasePool, NewMemory, RecordQuery, StoredMemory};
use crate::embeddings::Embedder;
use crate::error::{GatewayError, Result};
use crate::keys::KeyManager;
use crate::vault_client::VaultClient;
use memvault_types::{
    DeleteMemoryResponse, HealthResponse, MemoriesResponse, Memory, MemoryFilter, MemoryMatch,
    PatchMemoryRequest, RotateKeyResponse, SearchMemoriesRequest, SearchMemoriesResponse,
    StoreMemoryRequest, StoreMemoryResponse,
};
use memvault_vault::SecureBuffer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_RECENT_LIMIT: usize = 10;
pub const DEFAULT_QUERY_LIMIT: usize = 50;
/// Scope used when neither a principal nor a `user_id` is available
pub const DEFAULT_SCOPE: &str = "default";
/// Rows re-encrypted per database round trip
const REENCRYPT_BATCH: usize = 100;

pub struct MemoryService {
    pool: Arc<DatabasePool>,
    vault: Arc<VaultClient>,
    keys: KeyManager,
    embedder: Arc<dyn Embedder>,
    limits: Limits,
    started: Instant,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Metadata keys usable in filters and JSON paths
fn valid_metadata_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Tags are a set; keep first occurrences in order.
fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

impl MemoryService {
    pub fn new(
        pool: Arc<DatabasePool>,
        vault: Arc<VaultClient>,
        embedder: Arc<dyn Embedder>,
        limits: Limits,
    ) -> Self {
        let keys = KeyManager::new(vault.clone(), pool.clone());
        Self {
            pool,
            vault,
            keys,
            embedder,
            limits,
            started: Instant::now(),
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    // ═══════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════

    fn check_embedding(&self, embedding: &[f32], what: &str) -> Result<()> {
        let dims = self.pool.dimensions();
        if embedding.len() != dims {
            return Err(GatewayError::invalid(format!(
                "{what} has {} dimensions, expected {dims}",
                embedding.len()
            )));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(GatewayError::invalid(format!("{what} contains NaN or infinity")));
        }
        if embedding.iter().all(|x| *x == 0.0) {
            return Err(GatewayError::invalid(format!("{what} is all zeros")));
        }
        Ok(())
    }

    fn check_tags(&self, tags: &[String]) -> Result<()> {
        if tags.len() > self.limits.max_tags {
            return Err(GatewayError::invalid(format!(
                "{} tags exceeds the limit of {}",
                tags.len(),
                self.limits.max_tags
            )));
        }
        if tags.iter().any(|t| t.trim().is_empty()) {
            return Err(GatewayError::invalid("tags must not be empty"));
        }
        Ok(())
    }

    fn check_metadata(&self, metadata: &HashMap<String, String>) -> Result<()> {
        if metadata.len() > self.limits.max_metadata_entries {
            return Err(GatewayError::invalid(format!(
                "{} metadata entries exceeds the limit of {}",
                metadata.len(),
                self.limits.max_metadata_entries
            )));
        }
        Ok(())
    }

    fn check_filter(&self, filter: &MemoryFilter) -> Result<()> {
        if let Some(bad) = filter.metadata.keys().find(|k| !valid_metadata_key(k)) {
            return Err(GatewayError::invalid(format!(
                "metadata filter key '{bad}' must match [A-Za-z0-9_.-]+"
            )));
        }
        self.check_metadata(&filter.metadata)?;
        self.check_tags(&filter.tags)?;
        if let (Some(after), Some(before)) = (filter.created_after, filter.created_before)
            && after >= before
        {
            return Err(GatewayError::invalid("created_after must be before created_before"));
        }
        Ok(())
    }

    fn check_limit(&self, limit: Option<usize>, default: usize) -> Result<usize> {
        let limit = limit.unwrap_or(default);
        if limit == 0 || limit > self.limits.max_results {
            return Err(GatewayError::invalid(format!(
                "limit must be between 1 and {}",
                self.limits.max_results
            )));
        }
        Ok(limit)
    }

    /// Key scope for a new record.
    fn write_scope(caller: &Caller, metadata: &HashMap<String, String>) -> String {
        if let Some(p) = caller.principal() {
            return p.subject.clone();
        }
        metadata
            .get("user_id")
            .filter(|u| !u.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
    }

    // ═══════════════════════════════════════
    // Decryption
    // ═══════════════════════════════════════

    /// Fetch each distinct key once, then open every row off the async
    /// runtime.
    async fn open_all(&self, rows: Vec<StoredMemory>) -> Result<Vec<Memory>> {
        let mut keys: HashMap<String, SecureBuffer> = HashMap::new();
        for row in &rows {
            if !keys.contains_key(&row.key_id) {
                let key = self.keys.fetch(&row.key_id).await?;
                keys.insert(key.key_id, key.key);
            }
        }

        tokio::task::spawn_blocking(move || {
            rows.into_iter()
                .map(|row| {
                    let key = keys.get(&row.key_id).ok_or_else(|| {
                        GatewayError::Internal(format!("key {} not loaded", row.key_id))
                    })?;
                    open_row(key, row)
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?
    }

    // ═══════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════

    pub async fn store(&self, caller: &Caller, req: StoreMemoryRequest) -> Result<StoreMemoryResponse> {
        if req.content.trim().is_empty() {
            return Err(GatewayError::invalid("content cannot be empty"));
        }
        if req.content.len() > self.limits.max_content_bytes {
            return Err(GatewayError::invalid(format!(
                "content is {} bytes, limit is {}",
                req.content.len(),
                self.limits.max_content_bytes
            )));
        }
        self.check_metadata(&req.metadata)?;
        let tags = dedup_tags(req.tags);
        self.check_tags(&tags)?;

        let embedding = match req.embedding {
            Some(e) => {
                self.check_embedding(&e, "embedding")?;
                e
            }
            None => {
                let e = self.embedder.embed(&req.content).await?;
                self.check_embedding(&e, "computed embedding")?;
                e
            }
        };

        let scope = Self::write_scope(caller, &req.metadata);
        let key = self.keys.active_key(&scope).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let content = req.content;
        let aad = id.clone();
        let sealing_key = key.key;
        let sealed = tokio::task::spawn_blocking(move || {
            crypto::seal(&sealing_key, content.as_bytes(), aad.as_bytes())
        })
        .await??;

        let new = NewMemory {
            id: id.clone(),
            owner: scope,
            key_id: key.key_id,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            metadata: req.metadata,
            tags,
            embedding,
            created_at: now(),
        };
        let bytes = new.ciphertext.len();
        self.pool
            .run_with_retry(move |conn| db::insert_memory_sync(conn, &new))
            .await?;

        info!(memory_id = %id, ciphertext_bytes = bytes, "Stored memory");
        Ok(StoreMemoryResponse {
            memory_id: id,
            success: true,
            message: "Memory stored successfully".to_string(),
        })
    }

    pub async fn search(
        &self,
        caller: &Caller,
        req: SearchMemoriesRequest,
    ) -> Result<SearchMemoriesResponse> {
        self.check_embedding(&req.query_embedding, "query_embedding")?;
        let limit = self.check_limit(req.limit, DEFAULT_SEARCH_LIMIT)?;
        let threshold = req.similarity_threshold.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(GatewayError::invalid("similarity_threshold must be within [0, 1]"));
        }
        self.check_filter(&req.filters)?;

        let query = RecordQuery {
            owner: caller.owner_filter(),
            filter: req.filters,
        };
        let embedding = req.query_embedding;
        let hits = self
            .pool
            .run(move |conn| db::search_memories_sync(conn, &embedding, threshold, limit, &query))
            .await?;

        let scores: Vec<f32> = hits.iter().map(|h| h.similarity).collect();
        let memories = self
            .open_all(hits.into_iter().map(|h| h.memory).collect())
            .await?;

        Ok(SearchMemoriesResponse {
            matches: memories
                .into_iter()
                .zip(scores)
                .map(|(memory, similarity_score)| MemoryMatch {
                    memory,
                    similarity_score,
                })
                .collect(),
        })
    }

    pub async fn recent(&self, caller: &Caller, limit: Option<usize>) -> Result<MemoriesResponse> {
        let limit = self.check_limit(limit, DEFAULT_RECENT_LIMIT)?;
        self.select(RecordQuery::owned_by(caller.owner_filter()), limit)
            .await
    }

    pub async fn query(&self, caller: &Caller, filter: MemoryFilter) -> Result<MemoriesResponse> {
        self.check_filter(&filter)?;
        let limit = self.check_limit(filter.limit, DEFAULT_QUERY_LIMIT)?;
        let query = RecordQuery {
            owner: caller.owner_filter(),
            filter,
        };
        self.select(query, limit).await
    }

    async fn select(&self, query: RecordQuery, limit: usize) -> Result<MemoriesResponse> {
        let rows = self
            .pool
            .run(move |conn| db::query_memories_sync(conn, &query, limit))
            .await?;
        let memories = self.open_all(rows).await?;
        Ok(MemoriesResponse {
            total_count: memories.len(),
            memories,
        })
    }

    pub async fn get(&self, caller: &Caller, id: &str) -> Result<Memory> {
        let owner = caller.owner_filter();
        let id_owned = id.to_string();
        let row = self
            .pool
            .run(move |conn| db::get_memory_sync(conn, &id_owned, owner.as_deref()))
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("memory {id}")))?;

        self.open_all(vec![row])
            .await?
            .pop()
            .ok_or_else(|| GatewayError::Internal("decryption returned nothing".into()))
    }

    pub async fn delete(&self, caller: &Caller, id: &str) -> Result<DeleteMemoryResponse> {
        let owner = caller.owner_filter();
        let id_owned = id.to_string();
        let deleted = self
            .pool
            .run_with_retry(move |conn| db::delete_memory_sync(conn, &id_owned, owner.as_deref()))
            .await?;
        if !deleted {
            return Err(GatewayError::NotFound(format!("memory {id}")));
        }
        info!(memory_id = %id, "Deleted memory");
        Ok(DeleteMemoryResponse { success: true })
    }

    /// Replace tags and/or metadata. Content stays sealed as-is.
    pub async fn patch(&self, caller: &Caller, id: &str, req: PatchMemoryRequest) -> Result<Memory> {
        if req.metadata.is_none() && req.tags.is_none() {
            return Err(GatewayError::invalid("nothing to update"));
        }
        if let Some(metadata) = &req.metadata {
            self.check_metadata(metadata)?;
        }
        let tags = req.tags.map(dedup_tags);
        if let Some(tags) = &tags {
            self.check_tags(tags)?;
        }

        let owner = caller.owner_filter();
        let id_owned = id.to_string();
        let metadata = req.metadata;
        let updated = self
            .pool
            .run_with_retry(move |conn| {
                db::patch_memory_sync(
                    conn,
                    &id_owned,
                    owner.as_deref(),
                    metadata.as_ref(),
                    tags.as_deref(),
                    now(),
                )
            })
            .await?;
        if !updated {
            return Err(GatewayError::NotFound(format!("memory {id}")));
        }
        self.get(caller, id).await
    }

    /// New key version for `scope`; optionally move its records onto it.
    pub async fn rotate(&self, caller: &Caller, scope: &str, reencrypt: bool) -> Result<RotateKeyResponse> {
        if !caller.is_admin() {
            return Err(GatewayError::PermissionDenied("key rotation requires admin".into()));
        }
        if scope.trim().is_empty() {
            return Err(GatewayError::invalid("scope cannot be empty"));
        }

        let (row, retired_key_id) = self.keys.rotate(scope).await?;
        let reencrypted = if reencrypt {
            self.reencrypt(caller, scope).await?
        } else {
            0
        };

        Ok(RotateKeyResponse {
            scope: scope.to_string(),
            key_id: row.key_id,
            version: row.version,
            retired_key_id,
            reencrypted,
        })
    }

    /// Re-seal every record of `scope` still under an older key. Each row
    /// is its own transaction; a row changed concurrently is skipped.
    pub async fn reencrypt(&self, caller: &Caller, scope: &str) -> Result<usize> {
        if !caller.is_admin() {
            return Err(GatewayError::PermissionDenied("re-encryption requires admin".into()));
        }
        let active = self.keys.active_key(scope).await?;
        let active_id = active.key_id;
        let active_key = Arc::new(active.key);
        let mut old_keys: HashMap<String, Arc<SecureBuffer>> = HashMap::new();
        let mut done = 0;

        loop {
            let (owner, current) = (scope.to_string(), active_id.clone());
            let batch = self
                .pool
                .run(move |conn| db::stale_memories_sync(conn, &owner, &current, REENCRYPT_BATCH))
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut work = Vec::with_capacity(batch.len());
            for row in batch {
                if !old_keys.contains_key(&row.key_id) {
                    let key = self.keys.fetch(&row.key_id).await?;
                    old_keys.insert(key.key_id, Arc::new(key.key));
                }
                let old_key = old_keys.get(&row.key_id).cloned().ok_or_else(|| {
                    GatewayError::Internal(format!("key {} not loaded", row.key_id))
                })?;
                work.push((row, old_key));
            }

            let new_key = active_key.clone();
            let resealed = tokio::task::spawn_blocking(move || {
                work.into_iter()
                    .map(|(row, old_key)| {
                        let aad = row.id.as_bytes();
                        let plaintext = crypto::open(&old_key, &row.ciphertext, &row.nonce, aad)?;
                        let sealed = crypto::seal(&new_key, &plaintext, aad)?;
                        Ok((row.id, row.key_id, sealed))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .await??;

            let mut progressed = false;
            for (id, old_id, sealed) in resealed {
                let (row_id, new_id) = (id.clone(), active_id.clone());
                let moved = self
                    .pool
                    .run_with_retry(move |conn| {
                        db::reseal_memory_sync(
                            conn,
                            &row_id,
                            &old_id,
                            &new_id,
                            &sealed.ciphertext,
                            &sealed.nonce,
                            now(),
                        )
                    })
                    .await?;
                if moved {
                    done += 1;
                    progressed = true;
                } else {
                    warn!(memory_id = %id, "Record changed during re-encryption, skipped");
                }
            }
            if !progressed {
                break;
            }
        }

        info!(scope = %scope, key_id = %active_id, reencrypted = done, "Re-encryption finished");
        Ok(done)
    }

    pub async fn health(&self) -> HealthResponse {
        let vault = match self.vault.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Vault health check failed");
                false
            }
        };
        HealthResponse {
            status: if vault { "ok" } else { "degraded" }.to_string(),
            vault,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Decrypt one row into its API shape. The memory id is the associated data.
fn open_row(key: &SecureBuffer, row: StoredMemory) -> Result<Memory> {
    let plaintext = crypto::open(key, &row.ciphertext, &row.nonce, row.id.as_bytes())?;
    let content = String::from_utf8(plaintext.to_vec())
        .map_err(|_| GatewayError::Internal(format!("memory {} is not UTF-8", row.id)))?;
    Ok(Memory {
        id: row.id,
        content,
        metadata: row.metadata,
        tags: row.tags,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
