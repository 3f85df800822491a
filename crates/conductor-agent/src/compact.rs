//! Session compaction: once a session's history grows past a turn
//! threshold, the oldest turns are summarized by a cheap model and
//! collapsed into a single synthetic entry, keeping the most recent turns
//! verbatim.

use conductor_sessions::{HistoryEntry, Session};
use tracing::{info, warn};

use crate::provider::{ChatRequest, LlmProvider, Message, Role};

pub const COMPACT_THRESHOLD: usize = 40;
pub const KEEP_RECENT: usize = 20;

const SUMMARIZER_SYSTEM_PROMPT: &str = concat!(
    "You are a conversation summarizer. Summarize the conversation turns below ",
    "into a short paragraph capturing key facts, decisions, and open threads. ",
    "Ignore tool output noise and AI preamble. Be terse."
);

/// Renders history entries as a plain transcript for the summarizer.
pub fn render_transcript(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("USER: {}\nASSISTANT: {}", e.user, e.assistant))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Asks `summarizer_model` for a compaction summary. Returns `None` when
/// the call fails; the caller skips compaction for this pass.
pub async fn summarize_transcript(
    provider: &dyn LlmProvider,
    summarizer_model: &str,
    transcript: &str,
) -> Option<String> {
    let req = ChatRequest {
        model: summarizer_model.to_string(),
        system: SUMMARIZER_SYSTEM_PROMPT.to_string(),
        system_prompt: None,
        messages: vec![Message {
            role: Role::User,
            content: format!("Summarize this conversation:\n\n{transcript}"),
        }],
        max_tokens: 400,
        stream: false,
        tools: Vec::new(),
        raw_messages: None,
    };

    match provider.send(&req).await {
        Ok(r) => Some(r.content.trim().to_string()),
        Err(e) => {
            warn!(error = %e, "compaction summarizer call failed");
            None
        }
    }
}

/// Compact `session` in place if it has crossed the turn threshold, calling
/// `summarizer_model` on `provider` to produce the replacement summary.
/// Returns the removed entries (for forwarding to long-term memory) or an
/// empty vec if compaction wasn't triggered or the summarizer call failed.
///
/// Holds `&mut session` across the summarizer await; callers sharing the
/// session behind a sync lock should instead snapshot the transcript,
/// await `summarize_transcript`, then re-lock and call `Session::compact`
/// (the orchestrator's compaction task does exactly that).
pub async fn compact_session_if_needed(
    session: &mut Session,
    provider: &dyn LlmProvider,
    summarizer_model: &str,
) -> Vec<HistoryEntry> {
    if session.history.len() < COMPACT_THRESHOLD {
        return Vec::new();
    }

    let transcript = render_transcript(&session.history[..session.history.len() - KEEP_RECENT]);
    let Some(summary) = summarize_transcript(provider, summarizer_model, &transcript).await else {
        return Vec::new();
    };

    let removed = session.compact(summary, KEEP_RECENT);
    info!(
        session = %session.key.as_str(),
        removed = removed.len(),
        "compacted session history"
    );
    removed
}
