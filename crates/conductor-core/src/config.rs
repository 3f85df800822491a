use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level config (`conductor.toml` + `CONDUCTOR_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub guard: GuardConfig,
}

impl CoreConfig {
    /// Load config from a TOML file with `CONDUCTOR_*` env var overrides.
    ///
    /// A missing file is not an error; defaults fill the gap so a bare
    /// install still runs.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CoreConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONDUCTOR_").split("_"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conductor/conductor.toml", home)
}

/// Agent loop timeouts, turn limits, compaction, and loop-detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wall-clock deadline for one full run (an inbound message through its reply).
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Deadline for a single LLM completion call.
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
    /// Hard ceiling on agent-loop iterations before aborting as non-converging.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// History length (messages) that triggers proactive compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,
    /// Number of oldest messages folded into a compaction summary per pass.
    #[serde(default = "default_compact_batch")]
    pub compact_batch: usize,
    /// Repeated identical tool-call fingerprints before the loop detector warns.
    #[serde(default = "default_loop_warn_streak")]
    pub loop_warn_streak: u32,
    /// Repeated identical tool-call fingerprints before the loop detector trips.
    #[serde(default = "default_loop_critical_streak")]
    pub loop_critical_streak: u32,
    /// Progressless repetitions before the loop detector terminates the run.
    #[serde(default = "default_loop_breaker_streak")]
    pub loop_breaker_streak: u32,
    /// Whether the agent loop injects periodic reflection nudges.
    #[serde(default = "default_reflection_enabled")]
    pub reflection_enabled: bool,
    /// Turns between reflection nudges.
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval: u32,
    /// Compaction passes attempted on context overflow before giving up.
    #[serde(default = "default_max_compaction_attempts")]
    pub max_compaction_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_timeout_ms: default_run_timeout_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            max_iterations: default_max_iterations(),
            compact_threshold: default_compact_threshold(),
            compact_batch: default_compact_batch(),
            loop_warn_streak: default_loop_warn_streak(),
            loop_critical_streak: default_loop_critical_streak(),
            loop_breaker_streak: default_loop_breaker_streak(),
            reflection_enabled: default_reflection_enabled(),
            reflection_interval: default_reflection_interval(),
            max_compaction_attempts: default_max_compaction_attempts(),
        }
    }
}

fn default_run_timeout_ms() -> u64 {
    1_200_000
}
fn default_llm_timeout_ms() -> u64 {
    300_000
}
fn default_max_iterations() -> u32 {
    25
}
fn default_compact_threshold() -> usize {
    40
}
fn default_compact_batch() -> usize {
    20
}
fn default_loop_warn_streak() -> u32 {
    3
}
fn default_loop_critical_streak() -> u32 {
    5
}
fn default_loop_breaker_streak() -> u32 {
    7
}
fn default_reflection_enabled() -> bool {
    true
}
fn default_reflection_interval() -> u32 {
    5
}
fn default_max_compaction_attempts() -> u32 {
    3
}

/// Per-session history bounds and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_max_history() -> usize {
    200
}
fn default_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

/// Provider slot configuration. API keys are always pulled from the
/// environment at resolution time and are never embedded in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicProviderConfig>,
    pub openai: Option<OpenAiProviderConfig>,
    /// Fallback order by provider id, tried left to right.
    #[serde(default)]
    pub fallback_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_anthropic_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

/// Per-channel defaults for the busy-queueing policy (see conductor-channels).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default = "default_busy_policy")]
    pub default_busy_policy: String,
}

fn default_busy_policy() -> String {
    "steer".to_string()
}

/// Tool Guard profile selection and the confirmation-required tool list.
///
/// `profile: None` means no guard configuration was provided at all; the
/// binary then falls back to an owner-only permissive guard instead of
/// treating every caller permissively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub confirm_tools: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            profile: None,
            confirm_tools: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_still_loads_defaults() {
        let cfg = CoreConfig::load(Some("/nonexistent/path/conductor.toml")).unwrap();
        assert_eq!(cfg.agent.max_iterations, 25);
        assert_eq!(cfg.session.max_history, 200);
        // No guard config at all: the binary must fall back to the
        // owner-only guard, so the profile stays unset.
        assert_eq!(cfg.guard.profile, None);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(
            &path,
            r#"
            [agent]
            max_iterations = 10

            [guard]
            profile = "locked-down"
            "#,
        )
        .unwrap();

        let cfg = CoreConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.agent.max_iterations, 10);
        assert_eq!(cfg.guard.profile.as_deref(), Some("locked-down"));
        // untouched sections still default
        assert_eq!(cfg.session.max_history, 200);
    }
}
