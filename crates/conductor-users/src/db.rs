use rusqlite::Connection;

use crate::error::Result;

/// Initialise the caller/identity schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS callers (
            id            TEXT PRIMARY KEY,
            display_name  TEXT NOT NULL,
            access_level  TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caller_identities (
            channel     TEXT NOT NULL,
            external_id TEXT NOT NULL,
            caller_id   TEXT NOT NULL REFERENCES callers(id) ON DELETE CASCADE,
            linked_at   TEXT NOT NULL,
            PRIMARY KEY (channel, external_id)
        );",
    )?;
    Ok(())
}
