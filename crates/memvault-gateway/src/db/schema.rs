// crates/memvault-gateway/src/db/schema.rs
// Table definitions and startup migrations

use anyhow::{Result, bail};
use rusqlite::{Connection, OptionalExtension};

/// `store_state` key holding the embedding width
pub const DIMENSIONS_KEY: &str = "embedding_dimensions";

/// `seq` is the rowid shared with `vec_memories`; an explicit INTEGER
/// PRIMARY KEY keeps it stable across VACUUM.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    key_id TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    nonce BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(owner, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_key ON memories(key_id);

CREATE TABLE IF NOT EXISTS data_keys (
    key_id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    version INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    retired_at INTEGER,
    UNIQUE(scope, version)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_data_keys_active ON data_keys(scope) WHERE active = 1;

CREATE TABLE IF NOT EXISTS store_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub fn run_migrations(conn: &Connection, dimensions: usize) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    ensure_vec_table_dimensions(conn, dimensions)?;
    Ok(())
}

/// Width of `vec_memories`, parsed from its DDL (`embedding float[384]`).
fn current_vec_dims(conn: &Connection) -> Option<usize> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_memories'",
        [],
        |row| {
            let sql: String = row.get(0)?;
            if let Some(start) = sql.find("float[") {
                let rest = &sql[start + 6..];
                if let Some(end) = rest.find(']')
                    && let Ok(dim) = rest[..end].parse::<usize>()
                {
                    return Ok(Some(dim));
                }
            }
            Ok(None)
        },
    )
    .unwrap_or(None)
}

fn create_vec_table(conn: &Connection, dims: usize) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS vec_memories USING vec0(embedding float[{dims}])"
    ))
}

/// Create `vec_memories` at `target_dims`, or refuse to start if stored
/// embeddings have another width. An empty store is rebuilt at the new width.
pub fn ensure_vec_table_dimensions(conn: &Connection, target_dims: usize) -> Result<()> {
    if target_dims == 0 {
        bail!("embedding dimensions must be positive");
    }

    match current_vec_dims(conn) {
        Some(dim) if dim == target_dims => {}
        Some(dim) => {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            if count > 0 {
                bail!(
                    "store holds {count} memories embedded at {dim} dimensions but \
                     {target_dims} are configured"
                );
            }
            tracing::info!(
                "vec_memories dimensions changed on an empty store ({} -> {}), recreating",
                dim,
                target_dims
            );
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch("DROP TABLE IF EXISTS vec_memories")?;
            create_vec_table(&tx, target_dims)?;
            tx.commit()?;
        }
        None => {
            tracing::info!("Creating vec_memories with {} dimensions", target_dims);
            create_vec_table(conn, target_dims)?;
        }
    }

    set_state(conn, DIMENSIONS_KEY, &target_dims.to_string())?;
    Ok(())
}

pub fn get_state(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM store_state WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

pub fn set_state(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO store_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ensure_sqlite_vec_registered;

    fn conn() -> Connection {
        ensure_sqlite_vec_registered();
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = conn();
        run_migrations(&conn, 8).unwrap();
        run_migrations(&conn, 8).unwrap();
        assert_eq!(current_vec_dims(&conn), Some(8));
        assert_eq!(get_state(&conn, DIMENSIONS_KEY).unwrap().as_deref(), Some("8"));
    }

    #[test]
    fn test_empty_store_accepts_new_dimensions() {
        let conn = conn();
        run_migrations(&conn, 8).unwrap();
        run_migrations(&conn, 16).unwrap();
        assert_eq!(current_vec_dims(&conn), Some(16));
        assert_eq!(get_state(&conn, DIMENSIONS_KEY).unwrap().as_deref(), Some("16"));
    }

    #[test]
    fn test_populated_store_rejects_new_dimensions() {
        let conn = conn();
        run_migrations(&conn, 4).unwrap();
        conn.execute(
            "INSERT INTO memories (id, owner, key_id, ciphertext, nonce, created_at, updated_at)
             VALUES ('m1', 'u1', 'memvault.u1.v1', x'00', x'00', 1, 1)",
            [],
        )
        .unwrap();

        let err = run_migrations(&conn, 8).unwrap_err();
        assert!(err.to_string().contains("4 dimensions"), "{err}");
        assert_eq!(current_vec_dims(&conn), Some(4));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let conn = conn();
        conn.execute_batch(SCHEMA).unwrap();
        assert!(ensure_vec_table_dimensions(&conn, 0).is_err());
    }

    #[test]
    fn test_single_active_key_per_scope() {
        let conn = conn();
        run_migrations(&conn, 4).unwrap();
        conn.execute(
            "INSERT INTO data_keys (key_id, scope, version, active, created_at)
             VALUES ('memvault.u1.v1', 'u1', 1, 1, 1)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO data_keys (key_id, scope, version, active, created_at)
             VALUES ('memvault.u1.v2', 'u1', 2, 1, 2)",
            [],
        );
        assert!(dup.is_err());
    }
}
