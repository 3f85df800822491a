use std::sync::Mutex;

use conductor_core::{ChannelId, ChatId, SessionKey};
use rusqlite::{params, Connection};
use tracing::instrument;

use crate::db::init_db;
use crate::error::{Result, SessionError};
use crate::types::{HistoryEntry, Session, SessionConfigOverride};

/// Persistence collaborator for the session store.
///
/// Calls are fire-and-forget from the store's perspective: the store
/// releases its per-session lock before invoking these, keeping I/O off
/// the hot path (the store spawns persistence calls onto a blocking task
/// via `tokio::task::spawn_blocking` in the orchestrator binary).
pub trait SessionPersister: Send + Sync {
    fn save_entry(&self, key: &SessionKey, entry: &HistoryEntry) -> Result<()>;
    fn load_session(&self, key: &SessionKey) -> Result<Option<Session>>;
    fn save_facts(&self, key: &SessionKey, facts: &[String]) -> Result<()>;
    fn save_meta(&self, session: &Session) -> Result<()>;
    /// Replaces the stored entry log with the post-compaction set (the
    /// synthetic summary entry plus whatever was kept).
    fn save_compaction(&self, key: &SessionKey, kept: &[HistoryEntry]) -> Result<()>;
    fn delete_session(&self, key: &SessionKey) -> Result<()>;
    /// Drops entries/facts for sessions deleted longer ago than retention
    /// allows; returns the number of session rows removed.
    fn rotate(&self, older_than_secs: i64) -> Result<usize>;
    fn load_all(&self) -> Result<Vec<Session>>;
    fn close(&self) -> Result<()>;
}

/// SQLite-backed persister, one connection guarded by a mutex; a
/// connection pool is unnecessary at single-node scale.
pub struct SqlitePersister {
    db: Mutex<Connection>,
}

impl SqlitePersister {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }
}

impl SessionPersister for SqlitePersister {
    #[instrument(skip(self, entry), fields(key = %key))]
    fn save_entry(&self, key: &SessionKey, entry: &HistoryEntry) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO session_entries (session_key, user_text, assistant_text, at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.as_str(), entry.user, entry.assistant, entry.at.to_rfc3339()],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    fn load_session(&self, key: &SessionKey) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        let row = db.query_row(
            "SELECT channel, chat_id, branch, title, config_json,
                    message_count, total_tokens, last_model, created_at, last_active_at
             FROM sessions WHERE session_key = ?1",
            params![key.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            },
        );

        let (channel, chat_id, branch, title, config_json, message_count, total_tokens, last_model, created_at, last_active_at) =
            match row {
                Ok(r) => r,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(SessionError::Database(e)),
            };

        let mut stmt = db.prepare(
            "SELECT user_text, assistant_text, at FROM session_entries
             WHERE session_key = ?1 ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map(params![key.as_str()], |row| {
                let user: String = row.get(0)?;
                let assistant: String = row.get(1)?;
                let at: String = row.get(2)?;
                Ok((user, assistant, at))
            })?
            .filter_map(|r| r.ok())
            .map(|(user, assistant, at)| HistoryEntry {
                user,
                assistant,
                at: at.parse().unwrap_or_else(|_| chrono::Utc::now()),
            })
            .collect();

        let mut fstmt = db.prepare("SELECT fact FROM session_facts WHERE session_key = ?1")?;
        let facts = fstmt
            .query_map(params![key.as_str()], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();

        let config: SessionConfigOverride =
            serde_json::from_str(&config_json).unwrap_or_default();

        Ok(Some(Session {
            key: key.clone(),
            channel: ChannelId::from(channel),
            chat_id: ChatId::from(chat_id),
            branch,
            title,
            history,
            facts,
            config,
            message_count: message_count as u64,
            total_tokens: total_tokens as u64,
            last_model,
            processing: false,
            created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
            last_active_at: last_active_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    #[instrument(skip(self, facts), fields(key = %key))]
    fn save_facts(&self, key: &SessionKey, facts: &[String]) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_facts WHERE session_key = ?1",
            params![key.as_str()],
        )?;
        for fact in facts {
            db.execute(
                "INSERT INTO session_facts (session_key, fact) VALUES (?1, ?2)",
                params![key.as_str(), fact],
            )?;
        }
        Ok(())
    }

    #[instrument(skip(self, session), fields(key = %session.key))]
    fn save_meta(&self, session: &Session) -> Result<()> {
        let config_json = serde_json::to_string(&session.config)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions
             (session_key, channel, chat_id, branch, title, config_json,
              message_count, total_tokens, last_model, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(session_key) DO UPDATE SET
               title = excluded.title,
               config_json = excluded.config_json,
               message_count = excluded.message_count,
               total_tokens = excluded.total_tokens,
               last_model = excluded.last_model,
               last_active_at = excluded.last_active_at",
            params![
                session.key.as_str(),
                session.channel.as_str(),
                session.chat_id.as_str(),
                session.branch,
                session.title,
                config_json,
                session.message_count as i64,
                session.total_tokens as i64,
                session.last_model,
                session.created_at.to_rfc3339(),
                session.last_active_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self, kept), fields(key = %key))]
    fn save_compaction(&self, key: &SessionKey, kept: &[HistoryEntry]) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_entries WHERE session_key = ?1",
            params![key.as_str()],
        )?;
        for entry in kept {
            db.execute(
                "INSERT INTO session_entries (session_key, user_text, assistant_text, at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.as_str(), entry.user, entry.assistant, entry.at.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    fn delete_session(&self, key: &SessionKey) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM sessions WHERE session_key = ?1",
            params![key.as_str()],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn rotate(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(older_than_secs)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let removed = db.execute(
            "DELETE FROM sessions WHERE last_active_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    #[instrument(skip(self))]
    fn load_all(&self) -> Result<Vec<Session>> {
        let keys: Vec<String> = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare("SELECT session_key FROM sessions")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let mut out = Vec::with_capacity(keys.len());
        for key_str in keys {
            if let Some(session) = self.load_session(&SessionKey(key_str))? {
                out.push(session);
            }
        }
        Ok(out)
    }

    fn close(&self) -> Result<()> {
        // rusqlite::Connection closes on drop; nothing additional to flush.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{ChannelId, ChatId};

    fn persister() -> SqlitePersister {
        SqlitePersister::open_in_memory().unwrap()
    }

    #[test]
    fn save_and_load_roundtrip() {
        let p = persister();
        let mut session = Session::new(ChannelId::from("telegram"), ChatId::from("1"), None);
        session.append(HistoryEntry::new("hi", "hello"));
        p.save_meta(&session).unwrap();
        p.save_entry(&session.key, &session.history[0]).unwrap();
        p.save_facts(&session.key, &["likes rust".to_string()]).unwrap();

        let loaded = p.load_session(&session.key).unwrap().unwrap();
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].assistant, "hello");
        assert_eq!(loaded.facts, vec!["likes rust".to_string()]);
    }

    #[test]
    fn load_missing_session_returns_none() {
        let p = persister();
        let key = SessionKey::new(&ChannelId::from("telegram"), &ChatId::from("999"), None);
        assert!(p.load_session(&key).unwrap().is_none());
    }

    #[test]
    fn delete_removes_session() {
        let p = persister();
        let session = Session::new(ChannelId::from("discord"), ChatId::from("g1"), None);
        p.save_meta(&session).unwrap();
        p.delete_session(&session.key).unwrap();
        assert!(p.load_session(&session.key).unwrap().is_none());
    }
}
