//! Prompt Composer: assembles the seven fixed prompt layers (identity,
//! base instructions, skills, memory, tool catalog, conversation, business
//! context) into a cacheable 3-tier system prompt.

use std::collections::BTreeMap;

/// Per-layer character caps. Overflow in an earlier layer eats into the
/// room left for later layers rather than into the user input.
#[derive(Debug, Clone)]
pub struct LayerBudgets {
    pub identity: usize,
    pub base_instructions: usize,
    pub skills: usize,
    pub memory: usize,
    pub tool_catalog: usize,
    pub conversation: usize,
    pub business_context: usize,
}

impl Default for LayerBudgets {
    fn default() -> Self {
        Self {
            identity: 2_000,
            base_instructions: 8_000,
            skills: 6_000,
            memory: 3_000,
            tool_catalog: 4_000,
            conversation: 6_000,
            business_context: 1_000,
        }
    }
}

/// Resolved identity (layer 1): agent profile ∪ IDENTITY file ∪ global
/// config, merged field-by-field with the most specific source winning.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub fields: BTreeMap<String, String>,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Overlay merge: `agent_profile` wins over `identity_file`, which wins
    /// over `global`. A missing `name` field falls back to "Assistant".
    pub fn merge(agent_profile: Option<&Identity>, identity_file: Option<&Identity>, global: Option<&Identity>) -> Identity {
        let mut merged = BTreeMap::new();
        if let Some(g) = global {
            merged.extend(g.fields.clone());
        }
        if let Some(f) = identity_file {
            merged.extend(f.fields.clone());
        }
        if let Some(p) = agent_profile {
            merged.extend(p.fields.clone());
        }
        merged.entry("name".to_string()).or_insert_with(|| "Assistant".to_string());
        Identity { fields: merged }
    }

    fn render(&self) -> String {
        let mut out = format!("You are {}.", self.fields.get("name").map(String::as_str).unwrap_or("Assistant"));
        for (key, value) in &self.fields {
            if key == "name" {
                continue;
            }
            out.push_str(&format!("\n{key}: {value}"));
        }
        out
    }
}

/// A small top-k memory excerpt retriever (layer 4). The hybrid
/// vector+keyword implementation lives in a memory collaborator; this
/// crate only depends on the trait.
pub trait MemoryRetriever: Send + Sync {
    fn top_k(&self, query: &str, k: usize) -> Vec<String>;
}

/// Snapshot of session/turn metadata injected into the volatile tier.
pub struct SessionInfo {
    pub session_key: String,
    pub turn_count: u32,
    pub timestamp: String,
}

/// 3-tier system prompt for providers that support prompt caching.
///
/// TIER 1 (static): identity + base instructions + skills + tool catalog —
///   identical across turns for the same agent profile.
/// TIER 2 (per-user): memory excerpts — changes per caller, stable within a
///   session.
/// TIER 3 (volatile): conversation context + business context + session
///   info — always changes, placed last so it never breaks the cache prefix.
#[derive(Debug, Clone, Default)]
pub struct SystemPrompt {
    pub static_tier: String,
    pub user_tier: String,
    pub volatile_tier: String,
}

impl SystemPrompt {
    pub fn to_plain_text(&self) -> String {
        let mut out = self.static_tier.clone();
        if !self.user_tier.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.user_tier);
        }
        if !self.volatile_tier.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.volatile_tier);
        }
        out
    }

    pub fn to_anthropic_blocks(&self) -> Vec<serde_json::Value> {
        let mut blocks = Vec::with_capacity(3);
        blocks.push(serde_json::json!({
            "type": "text",
            "text": self.static_tier,
            "cache_control": { "type": "ephemeral" }
        }));
        if !self.user_tier.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.user_tier,
                "cache_control": { "type": "ephemeral" }
            }));
        }
        if !self.volatile_tier.is_empty() {
            blocks.push(serde_json::json!({ "type": "text", "text": self.volatile_tier }));
        }
        blocks
    }
}

pub struct PromptComposer {
    pub budgets: LayerBudgets,
    pub memory: Option<std::sync::Arc<dyn MemoryRetriever>>,
}

impl PromptComposer {
    pub fn new() -> Self {
        Self { budgets: LayerBudgets::default(), memory: None }
    }

    pub fn with_memory(mut self, memory: std::sync::Arc<dyn MemoryRetriever>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Full 7-layer composition.
    #[allow(clippy::too_many_arguments)]
    pub fn compose(
        &self,
        identity: &Identity,
        base_instructions: &str,
        active_skill_prompts: &[String],
        tool_catalog: &[crate::provider::ToolDefinition],
        conversation: &[(String, String)],
        latest_user_input: &str,
        business_context: Option<&str>,
        session_info: Option<&SessionInfo>,
    ) -> SystemPrompt {
        let identity_text = truncate(&identity.render(), self.budgets.identity);

        let base_text = truncate(base_instructions, self.budgets.base_instructions);

        let skills_text = truncate(&active_skill_prompts.join("\n\n"), self.budgets.skills);

        let memory_text = self
            .memory
            .as_ref()
            .map(|m| truncate(&m.top_k(latest_user_input, 5).join("\n"), self.budgets.memory))
            .unwrap_or_default();

        let catalog_text = truncate(&render_tool_catalog(tool_catalog), self.budgets.tool_catalog);

        let conversation_text = truncate(&render_conversation(conversation), self.budgets.conversation);

        let business_text = business_context
            .map(|s| truncate(s, self.budgets.business_context))
            .unwrap_or_default();

        let mut static_tier = identity_text;
        if !base_text.is_empty() {
            static_tier.push_str("\n\n");
            static_tier.push_str(&base_text);
        }
        if !skills_text.is_empty() {
            static_tier.push_str("\n\n## Active skills\n");
            static_tier.push_str(&skills_text);
        }
        if !catalog_text.is_empty() {
            static_tier.push_str("\n\n## Available tools\n");
            static_tier.push_str(&catalog_text);
        }

        let user_tier = if memory_text.is_empty() {
            String::new()
        } else {
            format!("## Relevant memory\n{memory_text}")
        };

        let mut volatile_tier = String::new();
        if let Some(info) = session_info {
            volatile_tier.push_str(&format!(
                "## Session\nkey: {}\nturn: {}\ntime: {}",
                info.session_key, info.turn_count, info.timestamp
            ));
        }
        if !conversation_text.is_empty() {
            if !volatile_tier.is_empty() {
                volatile_tier.push_str("\n\n");
            }
            volatile_tier.push_str("## Recent conversation\n");
            volatile_tier.push_str(&conversation_text);
        }
        if !business_text.is_empty() {
            if !volatile_tier.is_empty() {
                volatile_tier.push_str("\n\n");
            }
            volatile_tier.push_str(&business_text);
        }

        SystemPrompt { static_tier, user_tier, volatile_tier }
    }

    /// `composeMinimal()`: ≤ ~500 tokens (~2000 chars), identity + base
    /// instructions + business context only, for scheduler-triggered
    /// deliveries where the agent must not branch into tool use.
    pub fn compose_minimal(&self, identity: &Identity, base_instructions: &str, business_context: Option<&str>) -> SystemPrompt {
        const MINIMAL_BUDGET: usize = 2_000;
        let mut static_tier = truncate(&identity.render(), 500);
        let base = truncate(base_instructions, MINIMAL_BUDGET - static_tier.len().min(MINIMAL_BUDGET));
        if !base.is_empty() {
            static_tier.push_str("\n\n");
            static_tier.push_str(&base);
        }
        let volatile_tier = business_context.map(|s| truncate(s, 300)).unwrap_or_default();
        SystemPrompt { static_tier, user_tier: String::new(), volatile_tier }
    }
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new()
    }
}

fn render_tool_catalog(tools: &[crate::provider::ToolDefinition]) -> String {
    tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_conversation(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(|(user, assistant)| format!("User: {user}\nAssistant: {assistant}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Truncate to `max_chars` using a 70/20/10 head-tail split with a marker,
/// breaking on line boundaries where possible.
fn truncate(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars || max_chars == 0 {
        return if max_chars == 0 { String::new() } else { content.to_string() };
    }

    let head_chars = max_chars * 70 / 100;
    let tail_chars = max_chars * 20 / 100;
    let marker = "\n\n[... content truncated ...]\n\n";

    let head_end = content[..head_chars.min(content.len())]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(head_chars.min(content.len()));
    let tail_start = content.len().saturating_sub(tail_chars);
    let tail_start = content[tail_start..]
        .find('\n')
        .map(|i| tail_start + i + 1)
        .unwrap_or(tail_start);

    format!("{}{}{}", &content[..head_end], marker, &content[tail_start.max(head_end)..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_merge_overlay_precedence() {
        let global = Identity::new().with_field("name", "Core").with_field("tone", "formal");
        let file = Identity::new().with_field("tone", "warm");
        let profile = Identity::new().with_field("name", "Nova");

        let merged = Identity::merge(Some(&profile), Some(&file), Some(&global));
        assert_eq!(merged.fields.get("name").unwrap(), "Nova");
        assert_eq!(merged.fields.get("tone").unwrap(), "warm");
    }

    #[test]
    fn identity_merge_falls_back_to_assistant_name() {
        let merged = Identity::merge(None, None, None);
        assert_eq!(merged.fields.get("name").unwrap(), "Assistant");
    }

    #[test]
    fn compose_minimal_stays_under_budget() {
        let composer = PromptComposer::new();
        let identity = Identity::new().with_field("name", "Nova");
        let long_instructions = "x".repeat(10_000);
        let prompt = composer.compose_minimal(&identity, &long_instructions, Some("group chat"));
        assert!(prompt.to_plain_text().len() <= 2_400);
    }

    #[test]
    fn compose_places_memory_in_user_tier_and_conversation_in_volatile() {
        struct FakeMemory;
        impl MemoryRetriever for FakeMemory {
            fn top_k(&self, _query: &str, _k: usize) -> Vec<String> {
                vec!["user likes rust".to_string()]
            }
        }
        let composer = PromptComposer::new().with_memory(std::sync::Arc::new(FakeMemory));
        let identity = Identity::new().with_field("name", "Nova");
        let prompt = composer.compose(
            &identity,
            "be helpful",
            &[],
            &[],
            &[("hi".to_string(), "hello".to_string())],
            "what's up",
            None,
            None,
        );
        assert!(prompt.user_tier.contains("user likes rust"));
        assert!(prompt.volatile_tier.contains("hello"));
    }

    #[test]
    fn truncate_is_noop_under_budget() {
        assert_eq!(truncate("short", 100), "short");
    }
}
