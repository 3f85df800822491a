use chrono::{DateTime, Utc};
use conductor_core::{ChannelId, ChatId, SessionKey};
use serde::{Deserialize, Serialize};

/// One round of conversation. Compaction collapses many of these into a
/// single synthetic entry carrying the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user: String,
    pub assistant: String,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
            at: Utc::now(),
        }
    }

    fn compacted(summary: impl Into<String>) -> Self {
        Self {
            user: "[session compacted]".to_string(),
            assistant: summary.into(),
            at: Utc::now(),
        }
    }
}

/// Per-session overrides layered on top of global/profile defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfigOverride {
    pub model: Option<String>,
    pub verbose: Option<bool>,
    pub tts_mode: Option<String>,
    /// Keyword that activates the assistant in group chats.
    pub trigger: Option<String>,
    pub language: Option<String>,
    /// Extra context string injected into the prompt's volatile tier.
    pub business_context: Option<String>,
    #[serde(default)]
    pub active_skills: Vec<String>,
}

/// Lightweight metadata row, cheap to list without loading full history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub key: SessionKey,
    pub title: Option<String>,
    pub message_count: u64,
    pub total_tokens: u64,
    pub last_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// One conversation's full in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub channel: ChannelId,
    pub chat_id: ChatId,
    pub branch: Option<String>,
    pub title: Option<String>,
    pub history: Vec<HistoryEntry>,
    /// Facts extracted during compaction, handed off to a memory collaborator.
    pub facts: Vec<String>,
    pub config: SessionConfigOverride,
    pub message_count: u64,
    pub total_tokens: u64,
    pub last_model: Option<String>,
    /// Set while an agent run owns this session; used by the busy policy.
    #[serde(skip)]
    pub processing: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel: ChannelId, chat_id: ChatId, branch: Option<String>) -> Self {
        let key = SessionKey::new(&channel, &chat_id, branch.as_deref());
        let now = Utc::now();
        Self {
            key,
            channel,
            chat_id,
            branch,
            title: None,
            history: Vec::new(),
            facts: Vec::new(),
            config: SessionConfigOverride::default(),
            message_count: 0,
            total_tokens: 0,
            last_model: None,
            processing: false,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            key: self.key.clone(),
            title: self.title.clone(),
            message_count: self.message_count,
            total_tokens: self.total_tokens,
            last_model: self.last_model.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        self.message_count += 1;
        self.last_active_at = Utc::now();
    }

    /// Evicts oldest entries until `history.len() <= max_history`.
    /// `max_history == 0` means unbounded.
    pub fn enforce_max_history(&mut self, max_history: usize) {
        if max_history > 0 && self.history.len() > max_history {
            let excess = self.history.len() - max_history;
            self.history.drain(..excess);
        }
    }

    pub fn record_usage(&mut self, tokens: u64, model: &str) {
        self.total_tokens += tokens;
        self.last_model = Some(model.to_string());
        self.last_active_at = Utc::now();
    }

    /// Collapses all but the most recent `keep_recent` entries into a single
    /// synthetic `{user: "[session compacted]", assistant: summary}` entry,
    /// returning the entries that were removed so the caller can forward
    /// them to long-term memory.
    pub fn compact(&mut self, summary: impl Into<String>, keep_recent: usize) -> Vec<HistoryEntry> {
        if self.history.len() <= keep_recent {
            return Vec::new();
        }
        let split_at = self.history.len() - keep_recent;
        let removed: Vec<HistoryEntry> = self.history.drain(..split_at).collect();
        self.history.insert(0, HistoryEntry::compacted(summary));
        removed
    }

    pub fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.last_active_at > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ChannelId::from("telegram"), ChatId::from("42"), None)
    }

    #[test]
    fn append_bumps_counters() {
        let mut s = session();
        s.append(HistoryEntry::new("hi", "hello"));
        assert_eq!(s.message_count, 1);
        assert_eq!(s.history.len(), 1);
    }

    #[test]
    fn compact_keeps_recent_and_summarizes_rest() {
        let mut s = session();
        for i in 0..10 {
            s.append(HistoryEntry::new(format!("u{i}"), format!("a{i}")));
        }
        let removed = s.compact("summary of 7 turns", 3);
        assert_eq!(removed.len(), 7);
        assert_eq!(s.history.len(), 4); // synthetic + 3 kept
        assert_eq!(s.history[0].user, "[session compacted]");
        assert_eq!(s.history[0].assistant, "summary of 7 turns");
        assert_eq!(s.history[1].user, "u7");
        assert_eq!(s.history.last().unwrap().user, "u9");
    }

    #[test]
    fn max_history_evicts_oldest() {
        let mut s = session();
        for i in 0..10 {
            s.append(HistoryEntry::new(format!("u{i}"), format!("a{i}")));
        }
        s.enforce_max_history(4);
        assert_eq!(s.history.len(), 4);
        assert_eq!(s.history[0].user, "u6");
        s.enforce_max_history(0);
        assert_eq!(s.history.len(), 4);
    }

    #[test]
    fn compact_is_noop_when_under_threshold() {
        let mut s = session();
        s.append(HistoryEntry::new("u0", "a0"));
        let removed = s.compact("x", 10);
        assert!(removed.is_empty());
        assert_eq!(s.history.len(), 1);
    }
}
