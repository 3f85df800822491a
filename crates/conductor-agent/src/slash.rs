//! Command-prefixed fast path: `/stop`, `/reset`, `/compact`,
//! `/model <name>`, `/verbose on|off`, `/tts on|off|inbound`. The exact
//! command set is policy, not core — this module owns only the parse and
//! the minimal session-level state mutations; channel adapters may layer
//! additional commands on top.

use conductor_sessions::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Stop,
    Reset,
    Compact,
    SetModel(String),
    SetVerbose(bool),
    SetTts(TtsMode),
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsMode {
    On,
    Off,
    Inbound,
}

/// Parse a raw inbound message into a slash command, or `None` if it isn't
/// command-prefixed at all (should be forwarded to the agent pipeline).
pub fn parse(message: &str) -> Option<SlashCommand> {
    let trimmed = message.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next().map(str::trim).unwrap_or("");

    Some(match cmd.as_str() {
        "/stop" => SlashCommand::Stop,
        "/reset" => SlashCommand::Reset,
        "/compact" => SlashCommand::Compact,
        "/model" if !arg.is_empty() => SlashCommand::SetModel(arg.to_string()),
        "/verbose" => match arg.to_lowercase().as_str() {
            "on" => SlashCommand::SetVerbose(true),
            "off" => SlashCommand::SetVerbose(false),
            _ => SlashCommand::Unrecognized(trimmed.to_string()),
        },
        "/tts" => match arg.to_lowercase().as_str() {
            "on" => SlashCommand::SetTts(TtsMode::On),
            "off" => SlashCommand::SetTts(TtsMode::Off),
            "inbound" => SlashCommand::SetTts(TtsMode::Inbound),
            _ => SlashCommand::Unrecognized(trimmed.to_string()),
        },
        _ => SlashCommand::Unrecognized(trimmed.to_string()),
    })
}

/// Apply a parsed command's session-local effects (model/verbose/tts
/// overrides, or clearing history on `/reset`). `/stop` and `/compact`
/// have run-level effects handled by the caller (abort signal, compaction
/// call) and are not mutated here.
pub fn apply_session_override(session: &mut Session, command: &SlashCommand) -> Option<String> {
    match command {
        SlashCommand::SetModel(model) => {
            session.config.model = Some(model.clone());
            Some(format!("Model set to `{model}` for this session."))
        }
        SlashCommand::SetVerbose(v) => {
            session.config.verbose = Some(*v);
            Some(format!("Verbose mode {}.", if *v { "enabled" } else { "disabled" }))
        }
        SlashCommand::SetTts(mode) => {
            let label = match mode {
                TtsMode::On => "on",
                TtsMode::Off => "off",
                TtsMode::Inbound => "inbound",
            };
            session.config.tts_mode = Some(label.to_string());
            Some(format!("TTS mode set to `{label}`."))
        }
        SlashCommand::Reset => {
            session.history.clear();
            session.message_count = 0;
            Some("Session history cleared.".to_string())
        }
        SlashCommand::Stop | SlashCommand::Compact => None,
        SlashCommand::Unrecognized(raw) => Some(format!("Unrecognized command: `{raw}`")),
    }
}
