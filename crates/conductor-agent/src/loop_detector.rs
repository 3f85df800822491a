//! Loop detector: catches an LLM stuck repeating the same tool call.

use std::collections::{BTreeMap, VecDeque};

use sha2::{Digest, Sha256};

const DEFAULT_WINDOW: usize = 10;
const WARN_THRESHOLD: usize = 3;
const CRITICAL_THRESHOLD: usize = 5;
const BREAKER_THRESHOLD: usize = 7;
const MAX_FIELD_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    None,
    Warn,
    Critical,
    Breaker,
}

impl Verdict {
    pub fn message(&self, tool_name: &str) -> Option<String> {
        match self {
            Verdict::None => None,
            Verdict::Warn => Some(format!("[System] You repeated {tool_name}; try a different approach")),
            Verdict::Critical => Some(format!(
                "[System] You have repeated {tool_name} many times with no progress. Stop and try something fundamentally different."
            )),
            Verdict::Breaker => Some(
                "I'm stuck repeating the same action without making progress, so I'm stopping here.".to_string(),
            ),
        }
    }
}

/// Canonicalize a tool call into a stable fingerprint: sorted keys,
/// trimmed/normalized string values, large fields truncated before hashing
/// so near-identical huge payloads still collapse to the same fingerprint.
pub fn fingerprint(tool_name: &str, args: &serde_json::Value) -> String {
    let canonical = canonicalize(args);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let parts: Vec<String> = sorted.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() > MAX_FIELD_LEN {
                trimmed[..MAX_FIELD_LEN].to_string()
            } else {
                trimmed.to_string()
            }
        }
        other => other.to_string(),
    }
}

pub fn hash_output(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    hex::encode(hasher.finalize())
}

struct CallRecord {
    fingerprint: String,
    output_hash: Option<String>,
}

pub struct LoopDetector {
    window: usize,
    warn_streak: usize,
    critical_streak: usize,
    breaker_streak: usize,
    history: VecDeque<CallRecord>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            warn_streak: WARN_THRESHOLD,
            critical_streak: CRITICAL_THRESHOLD,
            breaker_streak: BREAKER_THRESHOLD,
            history: VecDeque::with_capacity(DEFAULT_WINDOW),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self { window, history: VecDeque::with_capacity(window), ..Self::new() }
    }

    pub fn with_thresholds(warn: usize, critical: usize, breaker: usize) -> Self {
        let window = breaker.max(DEFAULT_WINDOW);
        Self {
            window,
            warn_streak: warn,
            critical_streak: critical,
            breaker_streak: breaker,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Record a completed tool call and return the verdict for this point
    /// in the run. Deny always dominates lower verdicts: breaker dominates
    /// critical dominates warn.
    pub fn record(&mut self, tool_name: &str, args: &serde_json::Value, output: &str) -> Verdict {
        let fp = fingerprint(tool_name, args);
        let output_hash = hash_output(output);

        self.history.push_back(CallRecord { fingerprint: fp.clone(), output_hash: Some(output_hash.clone()) });
        if self.history.len() > self.window {
            self.history.pop_front();
        }

        let streak = self.trailing_streak(&fp);
        let progressless = self.trailing_progressless_streak(&fp, &output_hash);

        if progressless >= self.breaker_streak {
            Verdict::Breaker
        } else if streak >= self.critical_streak {
            Verdict::Critical
        } else if streak >= self.warn_streak {
            Verdict::Warn
        } else {
            Verdict::None
        }
    }

    fn trailing_streak(&self, fp: &str) -> usize {
        self.history.iter().rev().take_while(|r| r.fingerprint == fp).count()
    }

    fn trailing_progressless_streak(&self, fp: &str, output_hash: &str) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|r| r.fingerprint == fp && r.output_hash.as_deref() == Some(output_hash))
            .count()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}
