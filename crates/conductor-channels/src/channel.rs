use async_trait::async_trait;

use crate::error::ChannelError;
use crate::types::{ChannelStatus, IncomingMessage, MediaMessage, OutgoingMessage};

/// Common interface implemented by every channel transport adapter
/// (WhatsApp, Telegram, Discord, Slack, WebUI, ...). The core depends only
/// on this contract; adapter internals live in their own crates.
///
/// Implementations must be `Send + Sync` so they can be stored in a
/// [`ChannelManager`](crate::manager::ChannelManager) and driven from
/// multiple Tokio tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`),
    /// used as the key inside `ChannelManager`.
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<(), ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Deliver a plain-text reply. `&self` (not `&mut self`) so a connected
    /// adapter can send concurrently.
    async fn send(&self, chat_id: &str, msg: &OutgoingMessage) -> Result<(), ChannelError>;

    async fn send_media(&self, chat_id: &str, msg: &MediaMessage) -> Result<(), ChannelError>;

    async fn send_reaction(&self, chat_id: &str, message_id: &str, emoji: &str)
        -> Result<(), ChannelError>;

    async fn send_typing(&self, chat_id: &str) -> Result<(), ChannelError>;

    async fn mark_read(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError>;

    /// Lazily fetch the bytes for an inbound message whose media was not
    /// eagerly downloaded by the adapter. Returns `(bytes, mime)`.
    async fn download_media(&self, msg: &IncomingMessage) -> Result<(Vec<u8>, String), ChannelError>;

    fn status(&self) -> ChannelStatus;
}
