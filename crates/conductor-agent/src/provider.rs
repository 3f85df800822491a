use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::prompt::SystemPrompt;
use crate::stream::StreamEvent;

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from the LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Plain text system prompt (used by non-Anthropic providers).
    pub system: String,
    /// Optional 3-tier prompt with cache breakpoints (Anthropic only).
    pub system_prompt: Option<SystemPrompt>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
    /// Tools to expose to the LLM. Empty disables tool use entirely.
    pub tools: Vec<ToolDefinition>,
    /// Raw JSON messages for the agent loop (overrides `messages` when set).
    /// Lets the loop build structured content blocks (tool_use, tool_result,
    /// vision) that can't be represented as plain strings.
    pub raw_messages: Option<Vec<serde_json::Value>>,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the LLM. Empty when no tools are called.
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.tokens_in,
            completion_tokens: self.tokens_out,
            total_tokens: self.tokens_in + self.tokens_out,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionDetail {
    Auto,
    Low,
    High,
}

/// A single-image vision completion request.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub model_override: Option<String>,
    pub prompt: String,
    pub image_base64: String,
    pub mime_type: String,
    pub detail: VisionDetail,
}

/// Audio transcription request.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub model: String,
}

/// Common interface for all LLM providers (Anthropic, OpenAI, ...).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits TextDelta + Done.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        let _ = tx.send(StreamEvent::TextDelta { text: resp.content }).await;
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }

    /// Vision completion. Providers without image support return `Unavailable`.
    async fn complete_with_vision(
        &self,
        _req: &VisionRequest,
    ) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "{} does not support vision requests",
            self.name()
        )))
    }

    /// Audio transcription. Providers without transcription return `Unavailable`.
    async fn transcribe(&self, _req: &TranscriptionRequest) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "{} does not support transcription",
            self.name()
        )))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Retriable: HTTP 429/500/502/503/52x/529, network errors, deadline exceeded.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => {
                *status == 429
                    || *status == 500
                    || *status == 502
                    || *status == 503
                    || *status == 529
                    || (520..=529).contains(status)
            }
            ProviderError::Unavailable(_) => true,
            ProviderError::Parse(_) | ProviderError::Cancelled => false,
        }
    }

    /// Context-overflow detection by error string content; providers report
    /// it inconsistently, so substring matching is the portable check.
    pub fn is_context_overflow(message: &str) -> bool {
        message.contains("context_length_exceeded")
            || message.contains("maximum context length")
            || (message.contains("400") && message.contains("tokens"))
    }
}
