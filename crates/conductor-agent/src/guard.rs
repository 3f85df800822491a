//! Tool Guard: the five-layer policy check every tool call passes through
//! before dispatch (profile filter, minimum access level, path/host/command
//! rules, confirmation policy, audit). Deny always dominates; the first
//! layer to reach a decision otherwise wins.

use std::collections::HashMap;
use std::sync::Mutex;

use conductor_core::AccessLevel;
use rusqlite::{params, Connection};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Deny(String),
    RequireConfirmation(String),
}

/// Allow/deny glob rule set over tool names. Unknown tools default allowed.
#[derive(Debug, Clone, Default)]
pub struct ToolProfile {
    pub name: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolProfile {
    pub fn permissive(name: impl Into<String>) -> Self {
        Self { name: name.into(), allow: Vec::new(), deny: Vec::new() }
    }

    fn decide(&self, tool_name: &str) -> Option<GuardDecision> {
        if self.deny.iter().any(|p| glob_match(p, tool_name)) {
            return Some(GuardDecision::Deny(format!("tool `{tool_name}` is denied by profile `{}`", self.name)));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| glob_match(p, tool_name)) {
            return Some(GuardDecision::Deny(format!(
                "tool `{tool_name}` is not on the allow list for profile `{}`",
                self.name
            )));
        }
        None
    }
}

/// Minimal `*`-wildcard glob matcher (prefix/suffix/contains semantics,
/// matching the same "no real parser needed" spirit as a shell-command
/// denylist substring scan).
fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) if pattern.ends_with('*') => {
            let inner = &suffix[..suffix.len() - 1];
            value.contains(inner)
        }
        (Some(suffix), _) => value.ends_with(suffix),
        (_, Some(prefix)) => value.starts_with(prefix),
        _ => value == pattern,
    }
}

/// Built-in mapping from sensitive tool families to a minimum access level.
/// Matched by substring against the tool name, mirroring how the family
/// names double as naming conventions (`shell_exec`, `fs_write`, ...).
fn minimum_level_for(tool_name: &str) -> Option<AccessLevel> {
    const TABLE: &[(&str, AccessLevel)] = &[
        ("shell", AccessLevel::Trusted),
        ("execute_command", AccessLevel::Trusted),
        ("ssh", AccessLevel::Owner),
        ("vault", AccessLevel::Owner),
        ("scheduler", AccessLevel::Trusted),
        ("skill_install", AccessLevel::Owner),
        ("write_file", AccessLevel::Trusted),
        ("patch_file", AccessLevel::Trusted),
    ];
    TABLE.iter().find(|(needle, _)| tool_name.contains(needle)).map(|(_, lvl)| *lvl)
}

/// Path / host / command argument rules (layer 3).
#[derive(Debug, Clone, Default)]
pub struct ArgRules {
    pub safe_path_prefixes: Vec<String>,
    pub forbidden_path_prefixes: Vec<String>,
    pub allowed_ssh_hosts: Vec<String>,
}

impl ArgRules {
    fn check_path(&self, path: &str) -> Option<String> {
        if self.forbidden_path_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Some(format!("path `{path}` matches a forbidden prefix"));
        }
        if !self.safe_path_prefixes.is_empty()
            && !self.safe_path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
        {
            return Some(format!("path `{path}` is outside the configured safe prefixes"));
        }
        None
    }

    fn check_host(&self, host: &str) -> Option<String> {
        if !self.allowed_ssh_hosts.is_empty() && !self.allowed_ssh_hosts.iter().any(|h| h == host) {
            return Some(format!("host `{host}` is not on the ssh allowlist"));
        }
        None
    }
}

/// SSRF guard: blocks private IPv4/IPv6 ranges and cloud metadata endpoints.
pub fn ssrf_blocked(url: &str) -> Option<String> {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");

    if host == "169.254.169.254" || host.eq_ignore_ascii_case("metadata.google.internal") {
        return Some(format!("url targets a cloud metadata endpoint: {host}"));
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let blocked = match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.octets() == [169, 254, 169, 254]
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        };
        if blocked {
            return Some(format!("url targets a private/loopback address: {host}"));
        }
    }

    None
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub caller_id: String,
    pub tool_name: String,
    pub redacted_args: String,
    pub decision: String,
    pub reason: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

pub struct NullAuditSink;
impl AuditSink for NullAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}

/// SQLite-backed durable audit log (layer 5).
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS guard_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                caller_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                redacted_args TEXT NOT NULL,
                decision TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, entry: AuditEntry) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO guard_audit (caller_id, tool_name, redacted_args, decision, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entry.caller_id, entry.tool_name, entry.redacted_args, entry.decision, entry.reason],
        ) {
            warn!(error = %e, "failed to write guard audit entry");
        }
    }
}

/// Tool-call arguments redacted/summarized for the audit log: known
/// sensitive keys (`password`, `token`, `secret`, `key`) are masked, all
/// other scalar values pass through.
pub fn redact_args(args: &serde_json::Value) -> String {
    const SENSITIVE: &[&str] = &["password", "token", "secret", "api_key", "apikey"];
    fn walk(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    if SENSITIVE.iter().any(|s| k.to_lowercase().contains(s)) {
                        out.insert(k.clone(), serde_json::Value::String("***".to_string()));
                    } else {
                        out.insert(k.clone(), walk(v));
                    }
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(walk).collect()),
            other => other.clone(),
        }
    }
    walk(args).to_string()
}

pub struct ToolGuard {
    profile: ToolProfile,
    arg_rules: ArgRules,
    confirmation_required: Vec<String>,
    audit: std::sync::Arc<dyn AuditSink>,
    /// Set when running without any guard configuration: owner callers get
    /// the permissive profile, everyone else is denied outright.
    owner_only_fallback: bool,
}

impl ToolGuard {
    pub fn new(profile: ToolProfile, arg_rules: ArgRules, confirmation_required: Vec<String>, audit: std::sync::Arc<dyn AuditSink>) -> Self {
        Self { profile, arg_rules, confirmation_required, audit, owner_only_fallback: false }
    }

    /// Fallback for a deployment with no guard configuration at all:
    /// permissive for `owner` callers, deny for every other access level.
    pub fn permissive_for_owner(audit: std::sync::Arc<dyn AuditSink>) -> Self {
        Self {
            profile: ToolProfile::permissive("owner-fallback"),
            arg_rules: ArgRules::default(),
            confirmation_required: Vec::new(),
            audit,
            owner_only_fallback: true,
        }
    }

    pub fn check(
        &self,
        caller_id: &str,
        caller_level: AccessLevel,
        tool_name: &str,
        args: &serde_json::Value,
        session_trust: &HashMap<String, bool>,
    ) -> GuardDecision {
        let decision = self.check_layers(caller_level, tool_name, args, session_trust);

        self.audit.record(AuditEntry {
            caller_id: caller_id.to_string(),
            tool_name: tool_name.to_string(),
            redacted_args: redact_args(args),
            decision: match &decision {
                GuardDecision::Allow => "allow".to_string(),
                GuardDecision::Deny(_) => "deny".to_string(),
                GuardDecision::RequireConfirmation(_) => "require_confirmation".to_string(),
            },
            reason: match &decision {
                GuardDecision::Allow => String::new(),
                GuardDecision::Deny(r) | GuardDecision::RequireConfirmation(r) => r.clone(),
            },
        });

        decision
    }

    fn check_layers(
        &self,
        caller_level: AccessLevel,
        tool_name: &str,
        args: &serde_json::Value,
        session_trust: &HashMap<String, bool>,
    ) -> GuardDecision {
        if self.owner_only_fallback && caller_level != AccessLevel::Owner {
            return GuardDecision::Deny(format!(
                "no guard profile configured; tool access is limited to owner callers (caller is `{caller_level}`)"
            ));
        }

        // Layer 1: profile filter.
        if let Some(decision) = self.profile.decide(tool_name) {
            return decision;
        }

        // Layer 2: per-tool minimum access level.
        if let Some(min_level) = minimum_level_for(tool_name) {
            if !caller_level.is_at_least(min_level) {
                return GuardDecision::Deny(format!(
                    "tool `{tool_name}` requires at least `{min_level}` access, caller has `{caller_level}`"
                ));
            }
        }

        // Layer 3: path / host / command rules.
        if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
            if let Some(reason) = self.arg_rules.check_path(path) {
                return GuardDecision::Deny(reason);
            }
        }
        if let Some(host) = args.get("host").and_then(|v| v.as_str()) {
            if let Some(reason) = self.arg_rules.check_host(host) {
                return GuardDecision::Deny(reason);
            }
        }
        if let Some(url) = args.get("url").and_then(|v| v.as_str()) {
            if let Some(reason) = ssrf_blocked(url) {
                return GuardDecision::Deny(reason);
            }
        }

        // Layer 4: confirmation policy.
        if self.confirmation_required.iter().any(|t| t == tool_name) && !session_trust.get(tool_name).copied().unwrap_or(false) {
            return GuardDecision::RequireConfirmation(format!("tool `{tool_name}` requires confirmation"));
        }

        GuardDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(profile: ToolProfile) -> ToolGuard {
        ToolGuard::new(profile, ArgRules::default(), Vec::new(), std::sync::Arc::new(NullAuditSink))
    }

    #[test]
    fn deny_glob_dominates_allow() {
        let profile = ToolProfile {
            name: "default".to_string(),
            allow: vec!["*".to_string()],
            deny: vec!["shell_*".to_string()],
        };
        let g = guard(profile);
        let d = g.check("u1", AccessLevel::Owner, "shell_exec", &serde_json::json!({}), &HashMap::new());
        assert!(matches!(d, GuardDecision::Deny(_)));
    }

    #[test]
    fn unknown_tool_defaults_allowed() {
        let g = guard(ToolProfile::permissive("default"));
        let d = g.check("u1", AccessLevel::Guest, "get_time", &serde_json::json!({}), &HashMap::new());
        assert_eq!(d, GuardDecision::Allow);
    }

    #[test]
    fn sensitive_tool_denied_below_minimum_level() {
        let g = guard(ToolProfile::permissive("default"));
        let d = g.check("u1", AccessLevel::Guest, "ssh_connect", &serde_json::json!({}), &HashMap::new());
        assert!(matches!(d, GuardDecision::Deny(_)));
    }

    #[test]
    fn sensitive_tool_allowed_at_minimum_level() {
        let g = guard(ToolProfile::permissive("default"));
        let d = g.check("u1", AccessLevel::Owner, "ssh_connect", &serde_json::json!({}), &HashMap::new());
        assert_eq!(d, GuardDecision::Allow);
    }

    #[test]
    fn owner_fallback_denies_everyone_below_owner() {
        let g = ToolGuard::permissive_for_owner(std::sync::Arc::new(NullAuditSink));
        for level in [AccessLevel::Trusted, AccessLevel::Guest, AccessLevel::Anonymous] {
            let d = g.check("u1", level, "get_time", &serde_json::json!({}), &HashMap::new());
            assert!(matches!(d, GuardDecision::Deny(_)), "{level} should be denied");
        }
    }

    #[test]
    fn owner_fallback_is_permissive_for_owner() {
        let g = ToolGuard::permissive_for_owner(std::sync::Arc::new(NullAuditSink));
        let d = g.check("u1", AccessLevel::Owner, "get_time", &serde_json::json!({}), &HashMap::new());
        assert_eq!(d, GuardDecision::Allow);
    }

    #[test]
    fn confirmation_required_unless_session_trusted() {
        let g = ToolGuard::new(
            ToolProfile::permissive("default"),
            ArgRules::default(),
            vec!["write_file".to_string()],
            std::sync::Arc::new(NullAuditSink),
        );
        let d = g.check("u1", AccessLevel::Trusted, "write_file", &serde_json::json!({}), &HashMap::new());
        assert!(matches!(d, GuardDecision::RequireConfirmation(_)));

        let mut trust = HashMap::new();
        trust.insert("write_file".to_string(), true);
        let d2 = g.check("u1", AccessLevel::Trusted, "write_file", &serde_json::json!({}), &trust);
        assert_eq!(d2, GuardDecision::Allow);
    }

    #[test]
    fn ssrf_guard_blocks_metadata_endpoint() {
        assert!(ssrf_blocked("http://169.254.169.254/latest/meta-data").is_some());
    }

    #[test]
    fn ssrf_guard_blocks_private_ip() {
        assert!(ssrf_blocked("http://10.0.0.5/secrets").is_some());
    }

    #[test]
    fn ssrf_guard_allows_public_host() {
        assert!(ssrf_blocked("https://example.com/api").is_none());
    }

    #[test]
    fn redact_args_masks_sensitive_keys() {
        let redacted = redact_args(&serde_json::json!({"password": "hunter2", "path": "/tmp/x"}));
        assert!(redacted.contains("***"));
        assert!(!redacted.contains("hunter2"));
    }

    #[test]
    fn audit_sink_persists_entries() {
        let sink = SqliteAuditSink::open_in_memory().unwrap();
        sink.record(AuditEntry {
            caller_id: "u1".to_string(),
            tool_name: "shell_exec".to_string(),
            redacted_args: "{}".to_string(),
            decision: "deny".to_string(),
            reason: "blocked".to_string(),
        });
        let conn = sink.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM guard_audit", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
