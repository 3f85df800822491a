//! Final-output post-processing: internal tag sentinels are stripped before
//! anything reaches a channel, reply-target hints are extracted, and long
//! replies are split into channel-sized chunks on paragraph boundaries.

/// Sentinel meaning "send nothing to the user for this turn".
pub const NO_REPLY: &str = "NO_REPLY";
/// Sentinel emitted by scheduled health-check turns.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// True when the model's final text, once stripped, is a no-send sentinel.
pub fn suppresses_reply(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == NO_REPLY || trimmed == HEARTBEAT_OK
}

/// Pull a `[[reply_to:<id>]]` / `[[reply_to_current]]` hint out of the text.
/// Returns the text with the marker removed and the target message id, if
/// an explicit one was given.
pub fn extract_reply_to(text: &str) -> (String, Option<String>) {
    let mut reply_to = None;
    let mut out = text.replace("[[reply_to_current]]", "");

    while let Some(start) = out.find("[[reply_to:") {
        let Some(rel_end) = out[start..].find("]]") else {
            break;
        };
        let end = start + rel_end;
        let id = out[start + "[[reply_to:".len()..end].trim().to_string();
        if !id.is_empty() {
            reply_to = Some(id);
        }
        out.replace_range(start..end + 2, "");
    }

    (out, reply_to)
}

/// Paired tags whose content is internal and dropped entirely.
const DROP_BLOCKS: &[(&str, &str)] = &[
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
    ("<tool_provenance>", "</tool_provenance>"),
];

/// Strip every internal sentinel from user-visible output. Idempotent:
/// applying it twice equals applying it once.
pub fn strip_sentinels(text: &str) -> String {
    let mut out = text.to_string();

    for (open, close) in DROP_BLOCKS {
        loop {
            let Some(start) = out.find(open) else { break };
            match out[start..].find(close) {
                Some(rel_end) => out.replace_range(start..start + rel_end + close.len(), ""),
                // Unterminated block: drop through end of text.
                None => out.replace_range(start.., ""),
            }
        }
    }

    // `<final>` wraps the answer itself; keep the content, drop the tags.
    out = out.replace("<final>", "").replace("</final>", "");

    let (mut out, _) = extract_reply_to(&out);
    out = out.replace(NO_REPLY, "").replace(HEARTBEAT_OK, "");

    // "[Tools used: ...]" trailer lines.
    out = out
        .lines()
        .filter(|line| !line.trim_start().starts_with("[Tools used:"))
        .collect::<Vec<_>>()
        .join("\n");

    out.trim().to_string()
}

/// Split `text` into chunks of at most `max_len` characters, preferring
/// paragraph > line > sentence > word boundaries, in that order.
pub fn split_for_channel(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        let cut = best_cut(rest, max_len);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.trim_end().to_string());
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn best_cut(text: &str, max_len: usize) -> usize {
    let window = &text[..floor_char_boundary(text, max_len)];
    if let Some(pos) = window.rfind("\n\n") {
        return pos + 2;
    }
    if let Some(pos) = window.rfind('\n') {
        return pos + 1;
    }
    if let Some(pos) = window.rfind(['.', '!', '?']) {
        return pos + 1;
    }
    if let Some(pos) = window.rfind(' ') {
        return pos + 1;
    }
    window.len()
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_sentinels() {
        assert!(suppresses_reply("NO_REPLY"));
        assert!(suppresses_reply("  HEARTBEAT_OK \n"));
        assert!(suppresses_reply(""));
        assert!(!suppresses_reply("hello"));
    }

    #[test]
    fn strips_thinking_blocks_with_content() {
        let out = strip_sentinels("<thinking>let me ponder</thinking>The answer is 4.");
        assert_eq!(out, "The answer is 4.");
    }

    #[test]
    fn keeps_final_block_content() {
        let out = strip_sentinels("<final>The answer is 4.</final>");
        assert_eq!(out, "The answer is 4.");
    }

    #[test]
    fn drops_unterminated_internal_block() {
        let out = strip_sentinels("visible <reasoning>half-open");
        assert_eq!(out, "visible");
    }

    #[test]
    fn strips_tools_used_trailer() {
        let out = strip_sentinels("Done!\n[Tools used: read_file, shell_exec]");
        assert_eq!(out, "Done!");
    }

    #[test]
    fn stripping_is_idempotent() {
        let input = "<thinking>x</thinking>hi [[reply_to:abc]] NO_REPLY\n[Tools used: a]";
        let once = strip_sentinels(input);
        let twice = strip_sentinels(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn extracts_reply_target() {
        let (text, target) = extract_reply_to("sure thing [[reply_to:msg-99]]");
        assert_eq!(target.as_deref(), Some("msg-99"));
        assert!(!text.contains("reply_to"));
    }

    #[test]
    fn reply_to_current_maps_to_none() {
        let (text, target) = extract_reply_to("ok [[reply_to_current]]");
        assert_eq!(target, None);
        assert!(!text.contains("reply_to"));
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_for_channel("hi", 100), vec!["hi".to_string()]);
    }

    #[test]
    fn splits_on_paragraphs_first() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = split_for_channel(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn every_chunk_respects_max_len() {
        let text = "word ".repeat(500);
        for chunk in split_for_channel(&text, 100) {
            assert!(chunk.len() <= 100);
        }
    }
}
