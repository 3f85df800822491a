use std::sync::{Arc, Mutex};

use chrono::Duration;
use conductor_core::{ChannelId, ChatId, SessionKey};
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::error::{Result, SessionError};
use crate::persist::SessionPersister;
use crate::types::{HistoryEntry, Session, SessionMeta};

/// In-process session store. Each session gets its own lock so that one
/// session's agent run never blocks another session's.
///
/// A persister is optional: without one, sessions live purely in memory and
/// do not survive a process restart.
pub struct SessionStore {
    sessions: DashMap<SessionKey, Arc<Mutex<Session>>>,
    persister: Option<Arc<dyn SessionPersister>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl_secs: u64, persister: Option<Arc<dyn SessionPersister>>) -> Self {
        Self {
            sessions: DashMap::new(),
            persister,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Loads every persisted session into memory. Call once at startup if a
    /// persister is configured.
    pub fn load_all(&self) -> Result<usize> {
        let Some(persister) = &self.persister else {
            return Ok(0);
        };
        let sessions = persister.load_all()?;
        let count = sessions.len();
        for session in sessions {
            self.sessions
                .insert(session.key.clone(), Arc::new(Mutex::new(session)));
        }
        Ok(count)
    }

    /// Returns the existing session for `(channel, chatID, branch)`, loading
    /// it from the persister on a cache miss, or creates a fresh one.
    #[instrument(skip(self))]
    pub fn get_or_create(
        &self,
        channel: &ChannelId,
        chat_id: &ChatId,
        branch: Option<&str>,
    ) -> Result<Arc<Mutex<Session>>> {
        let key = SessionKey::new(channel, chat_id, branch);

        if let Some(existing) = self.sessions.get(&key) {
            return Ok(existing.clone());
        }

        // Slow path: build the replacement off-lock, then insert — if another
        // caller raced us, `entry` below hands back whichever one landed first.
        let loaded = match &self.persister {
            Some(persister) => persister.load_session(&key)?,
            None => None,
        };
        let fresh = match loaded {
            Some(session) => {
                debug!(key = %key, "loaded session from persister");
                Arc::new(Mutex::new(session))
            }
            None => {
                let session =
                    Session::new(channel.clone(), chat_id.clone(), branch.map(String::from));
                if let Some(persister) = &self.persister {
                    persister.save_meta(&session)?;
                }
                Arc::new(Mutex::new(session))
            }
        };

        let entry = self.sessions.entry(key).or_insert(fresh);
        Ok(entry.clone())
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(key).map(|e| e.clone())
    }

    #[instrument(skip(self))]
    pub fn delete(&self, key: &SessionKey) -> Result<()> {
        self.sessions.remove(key);
        if let Some(persister) = &self.persister {
            persister.delete_session(key)?;
        }
        Ok(())
    }

    pub fn rename(&self, key: &SessionKey, title: &str) -> Result<()> {
        let entry = self
            .sessions
            .get(key)
            .ok_or_else(|| SessionError::NotFound { key: key.as_str().to_string() })?;
        let mut session = entry.lock().unwrap();
        session.title = Some(title.to_string());
        let meta_snapshot = session.clone();
        drop(session);
        if let Some(persister) = &self.persister {
            persister.save_meta(&meta_snapshot)?;
        }
        Ok(())
    }

    /// Serializes a session's full history as JSON, for user-facing export.
    pub fn export(&self, key: &SessionKey) -> Result<String> {
        let entry = self
            .sessions
            .get(key)
            .ok_or_else(|| SessionError::NotFound { key: key.as_str().to_string() })?;
        let session = entry.lock().unwrap();
        Ok(serde_json::to_string_pretty(&*session)?)
    }

    pub fn list_meta(&self) -> Vec<SessionMeta> {
        self.sessions
            .iter()
            .map(|e| e.value().lock().unwrap().meta())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Persists one conversation entry. Best-effort: failures are logged and
    /// swallowed, never surfaced to the user turn (call off the session lock,
    /// typically from a `spawn_blocking` task).
    pub fn persist_entry(&self, key: &SessionKey, entry: &HistoryEntry) {
        if let Some(persister) = &self.persister {
            if let Err(e) = persister.save_entry(key, entry) {
                warn!(key = %key, error = %e, "failed to persist session entry");
            }
        }
    }

    /// Persists the post-compaction entry set, replacing the stored log.
    pub fn persist_compaction(&self, key: &SessionKey, kept: &[HistoryEntry]) {
        if let Some(persister) = &self.persister {
            if let Err(e) = persister.save_compaction(key, kept) {
                warn!(key = %key, error = %e, "failed to persist compaction");
            }
        }
    }

    /// Persists the session's facts list. Best-effort, like `persist_entry`.
    pub fn persist_facts(&self, key: &SessionKey, facts: &[String]) {
        if let Some(persister) = &self.persister {
            if let Err(e) = persister.save_facts(key, facts) {
                warn!(key = %key, error = %e, "failed to persist session facts");
            }
        }
    }

    /// Asks the persister to drop rows for sessions deleted longer ago than
    /// the retention window. Best-effort, like the other persistence calls.
    pub fn rotate(&self, older_than_secs: i64) -> usize {
        let Some(persister) = &self.persister else {
            return 0;
        };
        match persister.rotate(older_than_secs) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "persister rotation failed");
                0
            }
        }
    }

    /// Removes sessions whose `last_active_at` is older than the TTL.
    /// Intended to run on a tick (default TTL/2) from the orchestrator.
    #[instrument(skip(self))]
    pub fn prune(&self) -> usize {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|e| e.value().lock().unwrap().is_expired(self.ttl))
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.sessions.remove(key);
            if let Some(persister) = &self.persister {
                if let Err(e) = persister.delete_session(key) {
                    warn!(key = %key, error = %e, "failed to delete pruned session from persister");
                }
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = SessionStore::new(3600, None);
        let channel = ChannelId::from("telegram");
        let chat = ChatId::from("1");
        let a = store.get_or_create(&channel, &chat, None).unwrap();
        let b = store.get_or_create(&channel, &chat, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn delete_removes_from_store() {
        let store = SessionStore::new(3600, None);
        let channel = ChannelId::from("telegram");
        let chat = ChatId::from("1");
        let session = store.get_or_create(&channel, &chat, None).unwrap();
        let key = session.lock().unwrap().key.clone();
        store.delete(&key).unwrap();
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn prune_evicts_expired_sessions() {
        let store = SessionStore::new(0, None);
        let channel = ChannelId::from("telegram");
        let chat = ChatId::from("1");
        let session = store.get_or_create(&channel, &chat, None).unwrap();
        session.lock().unwrap().last_active_at = chrono::Utc::now() - Duration::seconds(10);
        let pruned = store.prune();
        assert_eq!(pruned, 1);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn branch_creates_distinct_session() {
        let store = SessionStore::new(3600, None);
        let channel = ChannelId::from("telegram");
        let chat = ChatId::from("1");
        let main = store.get_or_create(&channel, &chat, None).unwrap();
        let dev = store.get_or_create(&channel, &chat, Some("dev")).unwrap();
        assert!(!Arc::ptr_eq(&main, &dev));
        assert_eq!(store.count(), 2);
    }
}
