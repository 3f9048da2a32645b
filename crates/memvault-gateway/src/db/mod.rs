// crates/memvault-gateway/src/db/mod.rs
// SQLite memory store with sqlite-vec embeddings

pub mod keys;
pub mod memory;
pub mod pool;
pub mod schema;

pub use keys::{
    DataKeyRow, activate_key_sync, active_key_sync, latest_version_sync, list_keys_sync,
};
pub use memory::{
    NewMemory, RecordQuery, ScoredMemory, StoredMemory, count_memories_sync, delete_memory_sync,
    get_memory_sync, insert_memory_sync, patch_memory_sync, query_memories_sync,
    reseal_memory_sync, search_memories_sync, stale_memories_sync,
};
pub use pool::DatabasePool;
