use rusqlite::Connection;

use crate::error::Result;

/// Initialise the sessions schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key    TEXT PRIMARY KEY,
            channel        TEXT NOT NULL,
            chat_id        TEXT NOT NULL,
            branch         TEXT,
            title          TEXT,
            config_json    TEXT NOT NULL DEFAULT '{}',
            message_count  INTEGER NOT NULL DEFAULT 0,
            total_tokens   INTEGER NOT NULL DEFAULT 0,
            last_model     TEXT,
            created_at     TEXT NOT NULL,
            last_active_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_last_active
            ON sessions(last_active_at);

        CREATE TABLE IF NOT EXISTS session_entries (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key  TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
            user_text    TEXT NOT NULL,
            assistant_text TEXT NOT NULL,
            at           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_session
            ON session_entries(session_key, id);

        CREATE TABLE IF NOT EXISTS session_facts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
            fact        TEXT NOT NULL
        );",
    )?;
    Ok(())
}
