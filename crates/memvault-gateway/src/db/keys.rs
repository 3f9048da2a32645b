// crates/memvault-gateway/src/db/keys.rs
// Side index of data keys provisioned in the vault

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataKeyRow {
    pub key_id: String,
    pub scope: String,
    pub version: u32,
    pub active: bool,
    pub created_at: i64,
    pub retired_at: Option<i64>,
}

const KEY_COLUMNS: &str = "key_id, scope, version, active, created_at, retired_at";

fn map_key(row: &Row) -> rusqlite::Result<DataKeyRow> {
    Ok(DataKeyRow {
        key_id: row.get(0)?,
        scope: row.get(1)?,
        version: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
        retired_at: row.get(5)?,
    })
}

pub fn active_key_sync(conn: &Connection, scope: &str) -> rusqlite::Result<Option<DataKeyRow>> {
    conn.query_row(
        &format!("SELECT {KEY_COLUMNS} FROM data_keys WHERE scope = ?1 AND active = 1"),
        [scope],
        map_key,
    )
    .optional()
}

/// Highest version ever recorded for `scope`, 0 if none.
pub fn latest_version_sync(conn: &Connection, scope: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM data_keys WHERE scope = ?1",
        [scope],
        |row| row.get(0),
    )
}

/// Record `key_id` as the active key of its scope, retiring the previous
/// one. Returns the retired key id.
pub fn activate_key_sync(
    conn: &Connection,
    key_id: &str,
    scope: &str,
    version: u32,
    now: i64,
) -> rusqlite::Result<Option<String>> {
    let tx = conn.unchecked_transaction()?;
    let previous: Option<String> = tx
        .query_row(
            "SELECT key_id FROM data_keys WHERE scope = ?1 AND active = 1",
            [scope],
            |row| row.get(0),
        )
        .optional()?;
    tx.execute(
        "UPDATE data_keys SET active = 0, retired_at = ?2 WHERE scope = ?1 AND active = 1",
        params![scope, now],
    )?;
    tx.execute(
        "INSERT INTO data_keys (key_id, scope, version, active, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![key_id, scope, version, now],
    )?;
    tx.commit()?;
    Ok(previous)
}

pub fn list_keys_sync(conn: &Connection, scope: Option<&str>) -> rusqlite::Result<Vec<DataKeyRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {KEY_COLUMNS} FROM data_keys
         WHERE ?1 IS NULL OR scope = ?1
         ORDER BY scope, version"
    ))?;
    let rows = stmt.query_map([scope], map_key)?;
    rows.collect()
}
