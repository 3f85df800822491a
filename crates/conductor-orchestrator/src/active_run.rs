//! Active-run table: one persisted row per in-flight agent run. Written on
//! run start, deleted on completion; rows surviving a process restart mark
//! runs to resume.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub user_message: String,
    pub started_at: DateTime<Utc>,
}

pub struct ActiveRunTable {
    db: Mutex<Connection>,
}

impl ActiveRunTable {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS active_runs (
                session_key  TEXT PRIMARY KEY,
                channel      TEXT NOT NULL,
                chat_id      TEXT NOT NULL,
                user_message TEXT NOT NULL,
                started_at   TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Upsert: a resumed run re-records under the same session key.
    #[instrument(skip(self, run), fields(key = %run.session_key))]
    pub fn record(&self, run: &ActiveRun) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO active_runs
                 (session_key, channel, chat_id, user_message, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.session_key,
                run.channel,
                run.chat_id,
                run.user_message,
                run.started_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn clear(&self, session_key: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM active_runs WHERE session_key = ?1", params![session_key])?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<ActiveRun>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_key, channel, chat_id, user_message, started_at
             FROM active_runs ORDER BY started_at ASC",
        )?;
        let runs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(session_key, channel, chat_id, user_message, started_at)| ActiveRun {
                session_key,
                channel,
                chat_id,
                user_message,
                started_at: started_at.parse().unwrap_or_else(|_| Utc::now()),
            })
            .collect();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(key: &str) -> ActiveRun {
        ActiveRun {
            session_key: key.to_string(),
            channel: "telegram".to_string(),
            chat_id: "42".to_string(),
            user_message: "what's the weather".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn record_and_load_roundtrip() {
        let table = ActiveRunTable::open_in_memory().unwrap();
        table.record(&run("telegram:42")).unwrap();
        let rows = table.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_key, "telegram:42");
        assert_eq!(rows[0].user_message, "what's the weather");
    }

    #[test]
    fn clear_removes_row() {
        let table = ActiveRunTable::open_in_memory().unwrap();
        table.record(&run("telegram:42")).unwrap();
        table.clear("telegram:42").unwrap();
        assert!(table.load_all().unwrap().is_empty());
    }

    #[test]
    fn record_is_upsert() {
        let table = ActiveRunTable::open_in_memory().unwrap();
        table.record(&run("telegram:42")).unwrap();
        let mut second = run("telegram:42");
        second.user_message = "retry".to_string();
        table.record(&second).unwrap();
        let rows = table.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_message, "retry");
    }

    #[test]
    fn clear_unknown_key_is_noop() {
        let table = ActiveRunTable::open_in_memory().unwrap();
        table.clear("ghost").unwrap();
    }
}
