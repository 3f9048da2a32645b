// crates/memvault-gateway/src/db/memory.rs
// Encrypted memory rows and their embeddings

use memvault_types::MemoryFilter;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashMap;

/// A row as stored: content is still sealed
#[derive(Debug, Clone)]
pub struct StoredMemory {
    pub id: String,
    pub owner: String,
    pub key_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: StoredMemory,
    pub similarity: f32,
}

/// Everything one insert writes
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub id: String,
    pub owner: String,
    pub key_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

/// Row selection shared by search and filter queries. `owner: None` means
/// every owner.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub owner: Option<String>,
    pub filter: MemoryFilter,
}

impl RecordQuery {
    pub fn owned_by(owner: Option<String>) -> Self {
        Self {
            owner,
            filter: MemoryFilter::default(),
        }
    }
}

const MEMORY_COLUMNS: &str = "m.id, m.owner, m.key_id, m.ciphertext, m.nonce, \
                              m.metadata, m.tags, m.created_at, m.updated_at";

fn embedding_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn map_memory(row: &Row) -> rusqlite::Result<StoredMemory> {
    Ok(StoredMemory {
        id: row.get(0)?,
        owner: row.get(1)?,
        key_id: row.get(2)?,
        ciphertext: row.get(3)?,
        nonce: row.get(4)?,
        metadata: json_column(row, 5)?,
        tags: json_column(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Append WHERE clauses for `query`. Every value is bound, including the
/// JSON path for metadata keys.
fn push_filters(query: &RecordQuery, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
    if let Some(owner) = &query.owner {
        clauses.push("m.owner = ?".into());
        params.push(Value::Text(owner.clone()));
    }

    // Sorted so identical filters produce identical SQL
    let mut entries: Vec<_> = query.filter.metadata.iter().collect();
    entries.sort();
    for (key, value) in entries {
        clauses.push("json_extract(m.metadata, ?) = ?".into());
        params.push(Value::Text(format!("$.\"{key}\"")));
        params.push(Value::Text(value.clone()));
    }

    for tag in &query.filter.tags {
        clauses.push("EXISTS (SELECT 1 FROM json_each(m.tags) WHERE json_each.value = ?)".into());
        params.push(Value::Text(tag.clone()));
    }

    if let Some(after) = query.filter.created_after {
        clauses.push("m.created_at > ?".into());
        params.push(Value::Integer(after));
    }
    if let Some(before) = query.filter.created_before {
        clauses.push("m.created_at < ?".into());
        params.push(Value::Integer(before));
    }
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// Insert the row and its embedding in one transaction.
pub fn insert_memory_sync(conn: &Connection, new: &NewMemory) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO memories (id, owner, key_id, ciphertext, nonce, metadata, tags, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            new.id,
            new.owner,
            new.key_id,
            new.ciphertext,
            new.nonce,
            to_json(&new.metadata)?,
            to_json(&new.tags)?,
            new.created_at,
        ],
    )?;
    let seq = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO vec_memories (rowid, embedding) VALUES (?1, ?2)",
        params![seq, embedding_bytes(&new.embedding)],
    )?;
    tx.commit()
}

pub fn get_memory_sync(
    conn: &Connection,
    id: &str,
    owner: Option<&str>,
) -> rusqlite::Result<Option<StoredMemory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.id = ?1 AND (?2 IS NULL OR m.owner = ?2)"
    );
    conn.query_row(&sql, params![id, owner], map_memory).optional()
}

/// Remove a row and its embedding. False when no visible row has that id.
pub fn delete_memory_sync(conn: &Connection, id: &str, owner: Option<&str>) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let seq: Option<i64> = tx
        .query_row(
            "SELECT seq FROM memories WHERE id = ?1 AND (?2 IS NULL OR owner = ?2)",
            params![id, owner],
            |row| row.get(0),
        )
        .optional()?;
    let Some(seq) = seq else {
        return Ok(false);
    };
    tx.execute("DELETE FROM vec_memories WHERE rowid = ?1", [seq])?;
    tx.execute("DELETE FROM memories WHERE seq = ?1", [seq])?;
    tx.commit()?;
    Ok(true)
}

/// Replace tags and/or metadata, leaving the sealed content alone.
pub fn patch_memory_sync(
    conn: &Connection,
    id: &str,
    owner: Option<&str>,
    metadata: Option<&HashMap<String, String>>,
    tags: Option<&[String]>,
    now: i64,
) -> rusqlite::Result<bool> {
    let metadata = metadata.map(to_json).transpose()?;
    let tags = tags.map(to_json).transpose()?;
    let changed = conn.execute(
        "UPDATE memories
         SET metadata = COALESCE(?3, metadata),
             tags = COALESCE(?4, tags),
             updated_at = ?5
         WHERE id = ?1 AND (?2 IS NULL OR owner = ?2)",
        params![id, owner, metadata, tags, now],
    )?;
    Ok(changed > 0)
}

/// Rank filtered rows by cosine similarity to `query_embedding`, best first.
/// Rows under `threshold` are dropped in SQL.
pub fn search_memories_sync(
    conn: &Connection,
    query_embedding: &[f32],
    threshold: f32,
    limit: usize,
    query: &RecordQuery,
) -> rusqlite::Result<Vec<ScoredMemory>> {
    let mut clauses = Vec::new();
    let mut values = vec![Value::Blob(embedding_bytes(query_embedding))];
    push_filters(query, &mut clauses, &mut values);

    let sql = format!(
        "SELECT * FROM (
             SELECT {MEMORY_COLUMNS},
                    1.0 - vec_distance_cosine(v.embedding, ?) AS similarity
             FROM memories m
             JOIN vec_memories v ON v.rowid = m.seq
             {where_clause}
         )
         WHERE similarity >= ?
         ORDER BY similarity DESC, created_at DESC
         LIMIT ?",
        where_clause = where_sql(&clauses)
    );
    values.push(Value::Real(f64::from(threshold)));
    values.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        Ok(ScoredMemory {
            memory: map_memory(row)?,
            similarity: row.get::<_, f64>(9)? as f32,
        })
    })?;
    rows.collect()
}

/// Filter-only retrieval, newest first.
pub fn query_memories_sync(
    conn: &Connection,
    query: &RecordQuery,
    limit: usize,
) -> rusqlite::Result<Vec<StoredMemory>> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    push_filters(query, &mut clauses, &mut values);
    values.push(Value::Integer(limit as i64));

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         {where_clause}
         ORDER BY m.created_at DESC, m.seq DESC
         LIMIT ?",
        where_clause = where_sql(&clauses)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), map_memory)?;
    rows.collect()
}

pub fn count_memories_sync(conn: &Connection, owner: Option<&str>) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE ?1 IS NULL OR owner = ?1",
        params![owner],
        |row| row.get(0),
    )
}

/// Rows of `owner` sealed under anything but `current_key_id`.
pub fn stale_memories_sync(
    conn: &Connection,
    owner: &str,
    current_key_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<StoredMemory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m
         WHERE m.owner = ?1 AND m.key_id != ?2
         ORDER BY m.seq
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![owner, current_key_id, limit as i64], map_memory)?;
    rows.collect()
}

/// Swap in new ciphertext if the row is still sealed under `old_key_id`.
pub fn reseal_memory_sync(
    conn: &Connection,
    id: &str,
    old_key_id: &str,
    new_key_id: &str,
    ciphertext: &[u8],
    nonce: &[u8],
    now: i64,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE memories
         SET key_id = ?3, ciphertext = ?4, nonce = ?5, updated_at = ?6
         WHERE id = ?1 AND key_id = ?2",
        params![id, old_key_id, new_key_id, ciphertext, nonce, now],
    )?;
    Ok(changed > 0)
}
