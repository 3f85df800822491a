//! Block streamer: buffers LLM token deltas into a small number of
//! coherent chat messages instead of one token-by-token firehose or one
//! giant final message.

use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    pub idle: Duration,
    pub idle_min_chars: usize,
    pub enabled: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            min_chars: 200,
            max_chars: 1_500,
            idle: Duration::from_millis(1_500),
            idle_min_chars: 80,
            enabled: true,
        }
    }
}

/// Buffers streamed text and decides when a chunk is ready to send.
pub struct BlockStreamer {
    config: StreamerConfig,
    buffer: String,
    flushed_once: bool,
    done: bool,
}

impl BlockStreamer {
    pub fn new(config: StreamerConfig) -> Self {
        Self { config, buffer: String::new(), flushed_once: false, done: false }
    }

    pub fn has_flushed_once(&self) -> bool {
        self.flushed_once
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Append a token delta. Returns a flushable chunk if the buffer has
    /// crossed `max_chars`.
    pub fn push_token(&mut self, text: &str) -> Option<String> {
        if !self.config.enabled {
            self.buffer.push_str(text);
            return None;
        }
        self.buffer.push_str(text);
        if self.buffer.len() >= self.config.max_chars {
            self.flush_at_break()
        } else {
            None
        }
    }

    /// Idle timer fired: flush if the buffer has at least `idle_min_chars`,
    /// otherwise the caller should reschedule the timer.
    pub fn on_idle(&mut self) -> Option<String> {
        if self.buffer.len() >= self.config.idle_min_chars {
            self.flush_at_break()
        } else {
            None
        }
    }

    /// Pre-tool barrier: flush unconditionally so the user sees the model's
    /// reasoning before tool calls run.
    pub fn flush_now(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let chunk = postprocess(&self.buffer);
        self.buffer.clear();
        self.flushed_once = true;
        Some(chunk)
    }

    /// Run end: flush whatever remains. Idempotent — calling twice after
    /// the buffer is empty returns `None` both times.
    pub fn finish(&mut self) -> Option<String> {
        self.done = true;
        if self.buffer.is_empty() {
            return None;
        }
        let chunk = postprocess(&self.buffer);
        self.buffer.clear();
        self.flushed_once = true;
        Some(chunk)
    }

    /// Flush up to a natural break point within `[min_chars, max_chars]` of
    /// the buffer, keeping the remainder for the next chunk.
    fn flush_at_break(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        let break_at = find_break(&self.buffer, self.config.min_chars, self.config.max_chars);
        let (head, tail) = self.buffer.split_at(break_at);
        let chunk = postprocess(head);
        let remainder = tail.to_string();

        debug!(sent = head.len(), remaining = remainder.len(), "block streamer flush");

        self.buffer = remainder;
        self.flushed_once = true;
        Some(chunk)
    }
}

/// Find the best break point in `[min_chars, max_chars]`, preferring
/// paragraph > line > sentence > word boundaries. Falls back to
/// `max_chars` (mid-word) when no boundary exists in range.
fn find_break(buffer: &str, min_chars: usize, max_chars: usize) -> usize {
    let window_end = max_chars.min(buffer.len());
    if window_end <= min_chars || buffer.len() <= max_chars {
        return buffer.len().min(max_chars.max(min_chars));
    }

    let window = &buffer[min_chars.min(window_end)..window_end];

    if let Some(pos) = window.rfind("\n\n") {
        return min_chars + pos + 2;
    }
    if let Some(pos) = window.rfind('\n') {
        return min_chars + pos + 1;
    }
    if let Some(pos) = window.rfind(['.', '!', '?']) {
        return min_chars + pos + 1;
    }
    if let Some(pos) = window.rfind(' ') {
        return min_chars + pos + 1;
    }

    window_end
}

/// Replace `<think>` tags with a styled label and strip internal tags that
/// should never reach the end user.
fn postprocess(text: &str) -> String {
    let text = text.replace("<think>", "\n> :brain: thinking...\n").replace("</think>", "");
    strip_internal_tags(&text)
}

const INTERNAL_TAGS: &[&str] = &["<internal>", "</internal>", "<scratchpad>", "</scratchpad>"];

fn strip_internal_tags(text: &str) -> String {
    let mut out = text.to_string();
    for tag in INTERNAL_TAGS {
        out = out.replace(tag, "");
    }
    out
}

/// Channel-specific markdown conversion hook; channel adapters may override
/// this to match their own formatting dialect (e.g. Telegram MarkdownV2
/// escaping). The default is a passthrough.
pub trait MarkdownConverter: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

pub struct PassthroughMarkdown;
impl MarkdownConverter for PassthroughMarkdown {
    fn convert(&self, text: &str) -> String {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_buffered_below_max_chars() {
        let mut s = BlockStreamer::new(StreamerConfig::default());
        let out = s.push_token("short text");
        assert!(out.is_none());
    }

    #[test]
    fn flushes_at_max_chars_on_break() {
        let mut s = BlockStreamer::new(StreamerConfig { max_chars: 50, min_chars: 10, ..StreamerConfig::default() });
        let text = "word ".repeat(20);
        let out = s.push_token(&text);
        assert!(out.is_some());
        assert!(out.unwrap().len() <= 50);
    }

    #[test]
    fn flush_now_is_unconditional() {
        let mut s = BlockStreamer::new(StreamerConfig::default());
        s.push_token("tiny");
        let out = s.flush_now();
        assert_eq!(out, Some("tiny".to_string()));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut s = BlockStreamer::new(StreamerConfig::default());
        s.push_token("last bit");
        let first = s.finish();
        assert_eq!(first, Some("last bit".to_string()));
        let second = s.finish();
        assert_eq!(second, None);
        assert!(s.is_done());
    }

    #[test]
    fn on_idle_reschedules_below_threshold() {
        let mut s = BlockStreamer::new(StreamerConfig::default());
        s.push_token("hi");
        assert!(s.on_idle().is_none());
    }

    #[test]
    fn on_idle_flushes_above_threshold() {
        let mut s = BlockStreamer::new(StreamerConfig { idle_min_chars: 5, ..StreamerConfig::default() });
        s.push_token("hello there");
        assert!(s.on_idle().is_some());
    }

    #[test]
    fn think_tags_are_styled() {
        let out = postprocess("<think>pondering</think>answer");
        assert!(!out.contains("<think>"));
        assert!(!out.contains("</think>"));
        assert!(out.contains("pondering"));
    }

    #[test]
    fn internal_tags_are_stripped() {
        let out = postprocess("<internal>secret</internal>visible");
        assert!(!out.contains("<internal>"));
        assert!(out.contains("visible"));
    }

    #[test]
    fn prefers_paragraph_break_over_word_break() {
        let mut s = BlockStreamer::new(StreamerConfig { min_chars: 5, max_chars: 40, ..StreamerConfig::default() });
        let text = "first paragraph here\n\nsecond paragraph continues on and on";
        let out = s.push_token(text).unwrap();
        assert!(out.ends_with("\n\n") || out.trim_end().ends_with("here"));
    }
}
