//! The agent-side building blocks: LLM providers with fallback routing,
//! the tool system with guard/approval/loop-detection gating, prompt
//! composition, block streaming, and session compaction. The agent loop
//! itself lives in `conductor-orchestrator`, which drives these pieces.

pub mod anthropic;
pub mod anthropic_stream;
pub mod approval;
pub mod block_streamer;
pub mod compact;
pub mod error;
pub mod executor;
pub mod guard;
pub mod loop_detector;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod router;
pub mod safety;
pub mod slash;
pub mod stream;
pub mod tools;

pub use anthropic::AnthropicProvider;
pub use approval::{ApprovalManager, SendUserMsg, Verdict as ApprovalVerdict};
pub use block_streamer::{BlockStreamer, MarkdownConverter, PassthroughMarkdown, StreamerConfig};
pub use error::{AgentError, Result};
pub use executor::{AutoSendHook, ExecutorConfig, NoopAutoSendHook, ToolExecutor};
pub use guard::{ArgRules, AuditSink, GuardDecision, SqliteAuditSink, ToolGuard, ToolProfile};
pub use loop_detector::{LoopDetector, Verdict as LoopVerdict};
pub use openai::OpenAiProvider;
pub use prompt::{Identity, MemoryRetriever, PromptComposer, SessionInfo, SystemPrompt};
pub use provider::{
    ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, ToolCall,
    ToolDefinition, TranscriptionRequest, Usage, VisionDetail, VisionRequest,
};
pub use router::{ProviderRouter, ProviderSlot};
pub use stream::StreamEvent;
pub use tools::{Tool, ToolResult};
