//! Tool: send_message — deliver a message to another connected channel,
//! out-of-band from the reply the agent is currently composing.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_channels::{ChannelManager, OutgoingMessage};

use super::{Tool, ToolResult};

pub struct SendMessageTool {
    channels: Arc<ChannelManager>,
}

impl SendMessageTool {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to a connected channel (e.g. telegram, discord, whatsapp). \
         Use the connected-channel list from the system prompt to see available targets."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": { "type": "string", "description": "Target channel name, must be one of the connected channels." },
                "chat_id": { "type": "string", "description": "Channel-specific chat/recipient identifier." },
                "message": { "type": "string", "description": "The text message to send." }
            },
            "required": ["channel", "chat_id", "message"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let channel_name = match input.get("channel").and_then(|v| v.as_str()) {
            Some(c) if !c.is_empty() => c,
            _ => return ToolResult::error("missing or empty 'channel' parameter"),
        };
        let chat_id = match input.get("chat_id").and_then(|v| v.as_str()) {
            Some(r) if !r.is_empty() => r,
            _ => return ToolResult::error("missing or empty 'chat_id' parameter"),
        };
        let message = match input.get("message").and_then(|v| v.as_str()) {
            Some(m) if !m.is_empty() => m,
            _ => return ToolResult::error("missing or empty 'message' parameter"),
        };

        let Some(channel) = self.channels.get(channel_name) else {
            return ToolResult::error(format!("channel '{channel_name}' is not connected"));
        };

        let outgoing = OutgoingMessage { content: message.to_string(), reply_to: None };
        match channel.send(chat_id, &outgoing).await {
            Ok(()) => ToolResult::success(format!("Message sent to {channel_name} (chat_id: {chat_id})")),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
