use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Caller trust level; determines tool gating in the Tool Guard.
///
/// Ordered low to high so `>=` comparisons against a per-tool minimum work
/// directly via the derived `PartialOrd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Anonymous,
    Guest,
    Trusted,
    Owner,
}

impl AccessLevel {
    pub fn is_at_least(&self, minimum: AccessLevel) -> bool {
        *self >= minimum
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessLevel::Owner => "owner",
            AccessLevel::Trusted => "trusted",
            AccessLevel::Guest => "guest",
            AccessLevel::Anonymous => "anonymous",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AccessLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "owner" => Ok(AccessLevel::Owner),
            "trusted" => Ok(AccessLevel::Trusted),
            "guest" => Ok(AccessLevel::Guest),
            "anonymous" => Ok(AccessLevel::Anonymous),
            other => Err(CoreError::InvalidAccessLevel(other.to_string())),
        }
    }
}

/// Identifies a messaging channel (e.g. "telegram", "discord", "whatsapp").
/// An opaque label — the core never branches on its value, only threads it
/// through to the channel adapter contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Channel-scoped chat/conversation identifier (DM id, group id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies the caller within a channel (e.g. their JID, numeric user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Session identity: one per `(channel, chatID, optional branch)` triple.
///
/// Format: `{channel}:{chatID}` with an optional `#{branch}` suffix —
/// colon-delimited and human-readable so keys read well in logs and SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(channel: &ChannelId, chat_id: &ChatId, branch: Option<&str>) -> Self {
        match branch {
            Some(b) => Self(format!("{}:{}#{}", channel, chat_id, b)),
            None => Self(format!("{}:{}", channel, chat_id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits back into `(channel, chatID, branch)`. Best-effort: returns
    /// `None` if the key was not produced by `new`.
    pub fn parse(&self) -> Option<(ChannelId, ChatId, Option<String>)> {
        let (head, branch) = match self.0.split_once('#') {
            Some((h, b)) => (h, Some(b.to_string())),
            None => (self.0.as_str(), None),
        };
        let (channel, chat) = head.split_once(':')?;
        Some((ChannelId::from(channel), ChatId::from(chat), branch))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
