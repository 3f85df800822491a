use conductor_core::{ChannelId, ChatId};
use serde::{Deserialize, Serialize};

/// Media kind carried by an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Text,
    Image,
    Audio,
    Document,
    Video,
}

/// Inline media payload attached to an incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMedia {
    pub mime: String,
    /// Present when the adapter eagerly downloaded the bytes; otherwise the
    /// orchestrator calls `Channel::download_media` to fetch them lazily.
    pub data: Option<Vec<u8>>,
    pub filename: Option<String>,
}

/// A message produced by a channel adapter (inbound half of the adapter
/// contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub channel: ChannelId,
    pub chat_id: ChatId,
    pub from: String,
    pub from_name: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MediaType,
    pub media: Option<InboundMedia>,
    pub is_group: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A plain-text reply (outbound half of the channel adapter contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: String,
    pub reply_to: Option<String>,
}

/// A media attachment to deliver through `Channel::send_media`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMessage {
    pub kind: MediaType,
    pub data: Vec<u8>,
    pub mime: String,
    pub filename: String,
    pub caption: Option<String>,
    pub reply_to: Option<String>,
}

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}
