//! Anthropic SSE stream processing, split out of `anthropic.rs` for the same
//! reason the OpenAI adapter keeps its stream parser inline but distinct:
//! Anthropic's event model (`content_block_start`/`delta`/`stop`,
//! `message_delta`) doesn't overlap with OpenAI's single `delta` shape.

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

pub(crate) async fn process_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();
    let mut pending_tool: Option<(String, String, String)> = None; // (id, name, partial_json)

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };

            let Ok(event): Result<AnthropicEvent, _> = serde_json::from_str(&data) else {
                continue;
            };

            match event {
                AnthropicEvent::MessageStart { message } => {
                    tokens_in = message.usage.input_tokens;
                }
                AnthropicEvent::ContentBlockStart { content_block, .. } => {
                    if let ContentBlockStart::ToolUse { id, name } = content_block {
                        pending_tool = Some((id, name, String::new()));
                    }
                }
                AnthropicEvent::ContentBlockDelta { delta, .. } => match delta {
                    Delta::TextDelta { text } => {
                        if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                            return;
                        }
                    }
                    Delta::InputJsonDelta { partial_json } => {
                        if let Some((_, _, buf)) = pending_tool.as_mut() {
                            buf.push_str(&partial_json);
                        }
                    }
                },
                AnthropicEvent::ContentBlockStop { .. } => {
                    if let Some((id, name, buf)) = pending_tool.take() {
                        let input: serde_json::Value =
                            serde_json::from_str(&buf).unwrap_or(serde_json::json!({}));
                        if tx.send(StreamEvent::ToolUse { id, name, input }).await.is_err() {
                            return;
                        }
                    }
                }
                AnthropicEvent::MessageDelta { delta, usage } => {
                    if let Some(reason) = delta.stop_reason {
                        stop_reason = reason;
                    }
                    if let Some(u) = usage {
                        tokens_out = u.output_tokens;
                    }
                }
                AnthropicEvent::MessageStop => break,
                AnthropicEvent::Ping | AnthropicEvent::Unknown => {}
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done { model, tokens_in, tokens_out, stop_reason })
        .await;
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartInner },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: MessageDeltaInner,
        usage: Option<UsageDelta>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: UsageStart,
}

#[derive(Deserialize)]
struct UsageStart {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct UsageDelta {
    output_tokens: u32,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockStart {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}
