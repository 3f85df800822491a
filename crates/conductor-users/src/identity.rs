use conductor_core::{AccessLevel, CallerId};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::types::Caller;

pub fn get_caller(conn: &Connection, caller_id: &str) -> Result<Option<Caller>> {
    match conn.query_row(
        "SELECT id, display_name, access_level FROM callers WHERE id = ?1",
        params![caller_id],
        row_to_caller,
    ) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn find_caller_by_identity(
    conn: &Connection,
    channel: &str,
    external_id: &str,
) -> Result<Option<Caller>> {
    match conn.query_row(
        "SELECT c.id, c.display_name, c.access_level
         FROM callers c
         JOIN caller_identities i ON i.caller_id = c.id
         WHERE i.channel = ?1 AND i.external_id = ?2",
        params![channel, external_id],
        row_to_caller,
    ) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn create_caller(
    conn: &Connection,
    display_name: &str,
    access_level: AccessLevel,
) -> Result<Caller> {
    let id = Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO callers (id, display_name, access_level, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, display_name, access_level.to_string(), now],
    )?;
    Ok(Caller {
        id: CallerId(id),
        display_name: display_name.to_string(),
        access_level,
    })
}

pub fn add_identity(
    conn: &Connection,
    caller_id: &str,
    channel: &str,
    external_id: &str,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR REPLACE INTO caller_identities (channel, external_id, caller_id, linked_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![channel, external_id, caller_id, now],
    )?;
    Ok(())
}

pub fn set_access_level(conn: &Connection, caller_id: &str, level: AccessLevel) -> Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE callers SET access_level = ?2, updated_at = ?3 WHERE id = ?1",
        params![caller_id, level.to_string(), now],
    )?;
    Ok(rows)
}

fn row_to_caller(row: &rusqlite::Row<'_>) -> rusqlite::Result<Caller> {
    let id: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let level_str: String = row.get(2)?;
    let access_level = level_str.parse().unwrap_or(AccessLevel::Guest);
    Ok(Caller {
        id: CallerId(id),
        display_name,
        access_level,
    })
}
