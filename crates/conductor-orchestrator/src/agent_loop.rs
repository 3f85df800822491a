//! Agent loop: the iterate-until-done driver. Alternates LLM calls
//! with tool dispatch until the model stops asking for tools, recovering
//! from context overflow by compaction, draining mid-run interrupts at turn
//! boundaries, and terminating early on cancellation, deadline, or an
//! unproductive tool loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_agent::approval::SendUserMsg;
use conductor_agent::executor::ToolExecutor;
use conductor_agent::loop_detector::{LoopDetector, Verdict};
use conductor_agent::prompt::SystemPrompt;
use conductor_agent::provider::{
    ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolDefinition, Usage,
};
use conductor_agent::AgentError;
use conductor_core::config::AgentConfig;
use conductor_core::AccessLevel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire API ceiling on the number of tools per request.
const MAX_TOOLS: usize = 128;

/// Tool results older than this many turns are truncated to a prefix.
const PRUNE_AFTER_TURNS: u32 = 5;
/// Tool results older than this many turns are dropped entirely.
const REMOVE_AFTER_TURNS: u32 = 10;
const PRUNE_PREFIX_LEN: usize = 500;
const PRUNED_MARKER: &str = "\n[... truncated — result is from an earlier turn]";
const REMOVED_MARKER: &str = "[tool result removed — too old]";

/// First overflow pass: oversized tool results are clipped to this.
const OVERFLOW_CLIP: usize = 4096;
/// Subsequent overflow passes clip harder and drop old messages.
const OVERFLOW_CLIP_HARD: usize = 2048;
const OVERFLOW_KEEP_START: usize = 20;
const OVERFLOW_KEEP_STEP: usize = 5;
const OVERFLOW_KEEP_FLOOR: usize = 6;

/// Transient-error recovery (non-overflow): one retry on a slimmed context.
const TRANSIENT_KEEP: usize = 12;
const TRANSIENT_CLIP: usize = 1536;

const CANCELLED_MESSAGE: &str = "Agent stopped.";

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub run_timeout: Duration,
    pub llm_call_timeout: Duration,
    /// Soft turn cap; 0 = unlimited. On exceed the model is asked to
    /// summarize what it has and the run ends.
    pub max_turns: u32,
    pub reflection_enabled: bool,
    pub reflection_interval: u32,
    pub max_compaction_attempts: u32,
    pub progress_cooldown: Duration,
    pub max_tokens: u32,
    pub loop_warn_streak: usize,
    pub loop_critical_streak: usize,
    pub loop_breaker_streak: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_agent_config(&AgentConfig::default())
    }
}

impl LoopConfig {
    pub fn from_agent_config(cfg: &AgentConfig) -> Self {
        Self {
            run_timeout: Duration::from_millis(cfg.run_timeout_ms),
            llm_call_timeout: Duration::from_millis(cfg.llm_timeout_ms),
            max_turns: cfg.max_iterations,
            reflection_enabled: cfg.reflection_enabled,
            reflection_interval: cfg.reflection_interval,
            max_compaction_attempts: cfg.max_compaction_attempts,
            progress_cooldown: Duration::from_secs(3),
            max_tokens: 4096,
            loop_warn_streak: cfg.loop_warn_streak as usize,
            loop_critical_streak: cfg.loop_critical_streak as usize,
            loop_breaker_streak: cfg.loop_breaker_streak as usize,
        }
    }
}

/// Per-request state threaded through the run instead of process globals:
/// who is asking, which session owns the run, and how to reach the user for
/// approval prompts.
pub struct RunContext {
    pub session_id: String,
    pub caller_id: String,
    pub caller_level: AccessLevel,
    pub confirmation_required: Vec<String>,
    pub session_trust: HashMap<String, bool>,
    pub send_user_msg: SendUserMsg,
}

/// Callbacks the orchestrator wires into a run: streaming model text out,
/// flushing before tools execute, and short progress notes.
pub trait RunHooks: Send + Sync {
    /// A completed turn's model text, in order.
    fn on_text(&self, _text: &str) {}
    /// Pre-tool barrier: deliver any buffered text before tools run.
    fn before_tools(&self) {}
    /// A short "doing X" note. Calls are already cooldown-gated.
    fn on_progress(&self, _note: &str) {}
    /// When true, model text reaches the user through a block streamer and
    /// progress notes must carry tool descriptions only.
    fn streamer_active(&self) -> bool {
        false
    }
}

pub struct NoopHooks;
impl RunHooks for NoopHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced a final answer.
    Complete,
    /// Soft turn cap reached; the answer is a forced summary.
    MaxTurns,
    /// The loop detector's breaker fired.
    LoopBreaker,
    /// User cancellation.
    Cancelled,
    /// Run deadline elapsed.
    DeadlineExceeded,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub content: String,
    pub usage: Usage,
    pub turns: u32,
    pub finish: FinishReason,
    /// Model that produced the last completed call, for usage accounting.
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    User,
    Assistant,
    ToolResults,
    Meta,
}

/// One wire message plus the bookkeeping pruning and compaction need.
struct LoopMessage {
    raw: serde_json::Value,
    kind: Kind,
    turn: u32,
}

impl LoopMessage {
    fn user(text: impl Into<String>, turn: u32) -> Self {
        Self {
            raw: serde_json::json!({ "role": "user", "content": text.into() }),
            kind: Kind::User,
            turn,
        }
    }

    fn meta(text: impl Into<String>, turn: u32) -> Self {
        Self {
            raw: serde_json::json!({ "role": "user", "content": text.into() }),
            kind: Kind::Meta,
            turn,
        }
    }

    fn assistant_text(text: impl Into<String>, turn: u32) -> Self {
        Self {
            raw: serde_json::json!({ "role": "assistant", "content": text.into() }),
            kind: Kind::Assistant,
            turn,
        }
    }
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
    hooks: Arc<dyn RunHooks>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn LlmProvider>, executor: Arc<ToolExecutor>, config: LoopConfig) -> Self {
        Self { provider, executor, config, hooks: Arc::new(NoopHooks) }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Drive one agent run to completion.
    ///
    /// `model` may be empty, in which case each provider slot's default
    /// model is used. `history` is the session's `(user, assistant)` pairs.
    /// `interrupts` is the bounded inbox the router steers follow-ups into;
    /// it is drained non-blockingly at turn boundaries.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        ctx: &RunContext,
        system: &SystemPrompt,
        model: &str,
        history: &[(String, String)],
        user_message: &str,
        tools: Vec<ToolDefinition>,
        mut interrupts: Option<mpsc::Receiver<String>>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        let started = Instant::now();
        let mut usage = Usage::default();

        let mut messages: Vec<LoopMessage> = Vec::with_capacity(history.len() * 2 + 1);
        for (user, assistant) in history {
            messages.push(LoopMessage::user(user.clone(), 0));
            messages.push(LoopMessage::assistant_text(assistant.clone(), 0));
        }
        messages.push(LoopMessage::user(user_message, 0));

        let tools = cap_tools(tools);

        // No tools registered: a single completion, no loop.
        if tools.is_empty() {
            let resp = self
                .call_llm(&messages, system, model, &tools, self.call_deadline(started), &cancel)
                .await?;
            usage += resp.usage();
            if !resp.content.is_empty() {
                self.hooks.on_text(&resp.content);
            }
            let model = resp.model.clone();
            return Ok(RunOutcome { content: resp.content, usage, turns: 1, finish: FinishReason::Complete, model });
        }

        // Per-run detector: created here, discarded with the run.
        let mut detector = LoopDetector::with_thresholds(
            self.config.loop_warn_streak,
            self.config.loop_critical_streak,
            self.config.loop_breaker_streak,
        );
        let mut last_progress: Option<Instant> = None;
        let mut last_model = String::new();
        let mut turn: u32 = 0;

        loop {
            turn += 1;

            if self.config.max_turns > 0 && turn > self.config.max_turns {
                warn!(turns = turn - 1, "soft turn cap reached, forcing summary");
                messages.push(LoopMessage::meta(
                    "Please summarize what you have so far and give your best answer.",
                    turn,
                ));
                let resp = self
                    .call_llm(&messages, system, model, &[], self.call_deadline(started), &cancel)
                    .await?;
                usage += resp.usage();
                if !resp.content.is_empty() {
                    self.hooks.on_text(&resp.content);
                }
                let model = resp.model.clone();
                return Ok(RunOutcome { content: resp.content, usage, turns: turn, finish: FinishReason::MaxTurns, model });
            }

            if cancel.is_cancelled() {
                return Ok(RunOutcome {
                    content: CANCELLED_MESSAGE.to_string(),
                    usage,
                    turns: turn,
                    finish: FinishReason::Cancelled,
                    model: last_model.clone(),
                });
            }
            if started.elapsed() >= self.config.run_timeout {
                return Ok(RunOutcome {
                    content: format!(
                        "I hit the {}s time limit for this request after {} turns, so I'm stopping here.",
                        self.config.run_timeout.as_secs(),
                        turn - 1
                    ),
                    usage,
                    turns: turn,
                    finish: FinishReason::DeadlineExceeded,
                    model: last_model.clone(),
                });
            }

            if turn > 1 {
                if let Some(rx) = interrupts.as_mut() {
                    while let Ok(text) = rx.try_recv() {
                        info!(session = %ctx.session_id, "injecting mid-run follow-up");
                        messages.push(LoopMessage::user(
                            format!("[Follow-up from user while processing] {text}"),
                            turn,
                        ));
                    }
                }
            }

            if turn > PRUNE_AFTER_TURNS {
                prune_old_tool_results(&mut messages, turn);
            }

            if self.config.reflection_enabled
                && self.config.reflection_interval > 0
                && turn > 1
                && (turn - 1) % self.config.reflection_interval == 0
            {
                let elapsed = started.elapsed().as_secs();
                let remaining = self.config.run_timeout.as_secs().saturating_sub(elapsed);
                messages.push(LoopMessage::meta(
                    format!(
                        "[System] {elapsed}s elapsed, about {remaining}s remain for this request. \
                         Review your progress and do not repeat approaches that already failed."
                    ),
                    turn,
                ));
            }

            let resp = self
                .call_with_recovery(&mut messages, system, model, &tools, turn, started, &cancel)
                .await?;
            usage += resp.usage();
            last_model = resp.model.clone();

            if !resp.content.is_empty() {
                self.hooks.on_text(&resp.content);
            }

            if resp.tool_calls.is_empty() || resp.stop_reason != "tool_use" {
                debug!(turn, "model produced final answer");
                let model = resp.model.clone();
                return Ok(RunOutcome { content: resp.content, usage, turns: turn, finish: FinishReason::Complete, model });
            }

            messages.push(assistant_with_tool_calls(&resp, turn));

            self.hooks.before_tools();
            self.maybe_progress(&mut last_progress, &resp);

            let results = self
                .executor
                .execute_batch(
                    &ctx.session_id,
                    &ctx.caller_id,
                    ctx.caller_level,
                    &resp.tool_calls,
                    &ctx.session_trust,
                    &ctx.confirmation_required,
                    ctx.send_user_msg.clone(),
                )
                .await;

            let mut strongest = Verdict::None;
            let mut strongest_tool = String::new();
            let mut result_blocks = Vec::with_capacity(results.len());
            for (call, result) in resp.tool_calls.iter().zip(results.iter()) {
                result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": result.content,
                    "is_error": result.is_error,
                }));
                let verdict = detector.record(&call.name, &call.input, &result.content);
                if verdict > strongest {
                    strongest = verdict;
                    strongest_tool = call.name.clone();
                }
            }

            messages.push(LoopMessage {
                raw: serde_json::json!({ "role": "user", "content": result_blocks }),
                kind: Kind::ToolResults,
                turn,
            });

            match strongest {
                Verdict::Breaker => {
                    warn!(tool = %strongest_tool, turn, "loop breaker tripped, ending run");
                    let content = Verdict::Breaker
                        .message(&strongest_tool)
                        .unwrap_or_else(|| CANCELLED_MESSAGE.to_string());
                    return Ok(RunOutcome {
                        content,
                        usage,
                        turns: turn,
                        finish: FinishReason::LoopBreaker,
                        model: last_model.clone(),
                    });
                }
                Verdict::Warn | Verdict::Critical => {
                    // Injected after the tool results so the wire-level
                    // assistant → tool ordering stays valid.
                    if let Some(note) = strongest.message(&strongest_tool) {
                        messages.push(LoopMessage::meta(note, turn));
                    }
                }
                Verdict::None => {}
            }
        }
    }

    /// Per-call deadline: the smaller of the remaining run budget and the
    /// per-call cap.
    fn call_deadline(&self, started: Instant) -> Duration {
        let remaining = self.config.run_timeout.saturating_sub(started.elapsed());
        remaining.min(self.config.llm_call_timeout)
    }

    async fn call_llm(
        &self,
        messages: &[LoopMessage],
        system: &SystemPrompt,
        model: &str,
        tools: &[ToolDefinition],
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        let req = ChatRequest {
            model: model.to_string(),
            system: system.to_plain_text(),
            system_prompt: Some(system.clone()),
            messages: Vec::new(),
            max_tokens: self.config.max_tokens,
            stream: false,
            tools: tools.to_vec(),
            raw_messages: Some(messages.iter().map(|m| m.raw.clone()).collect()),
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(deadline, self.provider.send(&req)) => match result {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(AgentError::Provider(e)),
                Err(_) => Err(AgentError::Provider(ProviderError::Unavailable(
                    "llm call deadline exceeded".to_string(),
                ))),
            },
        }
    }

    /// Overflow errors get compaction passes; other transient errors after
    /// turn 2 on a fat context get one retry on a slimmed copy.
    #[allow(clippy::too_many_arguments)]
    async fn call_with_recovery(
        &self,
        messages: &mut Vec<LoopMessage>,
        system: &SystemPrompt,
        model: &str,
        tools: &[ToolDefinition],
        turn: u32,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        let first = self
            .call_llm(messages, system, model, tools, self.call_deadline(started), cancel)
            .await;
        let err = match first {
            Ok(resp) => return Ok(resp),
            Err(e) => e,
        };

        let AgentError::Provider(provider_err) = &err else {
            return Err(err);
        };

        if ProviderError::is_context_overflow(&provider_err.to_string()) {
            let attempts = self.config.max_compaction_attempts;
            for attempt in 1..=attempts {
                if attempt == 1 {
                    truncate_tool_results(messages, OVERFLOW_CLIP);
                } else {
                    let keep = OVERFLOW_KEEP_START
                        .saturating_sub(OVERFLOW_KEEP_STEP * (attempt as usize - 2))
                        .max(OVERFLOW_KEEP_FLOOR);
                    keep_recent(messages, keep);
                    truncate_tool_results(messages, OVERFLOW_CLIP_HARD);
                }
                info!(attempt, messages = messages.len(), "retrying after context compaction");

                match self
                    .call_llm(messages, system, model, tools, self.call_deadline(started), cancel)
                    .await
                {
                    Ok(resp) => return Ok(resp),
                    Err(AgentError::Provider(p))
                        if ProviderError::is_context_overflow(&p.to_string()) =>
                    {
                        continue;
                    }
                    Err(other) => return Err(other),
                }
            }
            return Err(AgentError::ContextOverflow { attempts });
        }

        if provider_err.is_retriable() && turn > 2 && messages.len() > 10 {
            warn!(turn, err = %provider_err, "transient provider error, retrying on slimmed context");
            keep_recent(messages, TRANSIENT_KEEP);
            truncate_tool_results(messages, TRANSIENT_CLIP);
            return self
                .call_llm(messages, system, model, tools, self.call_deadline(started), cancel)
                .await;
        }

        Err(err)
    }

    fn maybe_progress(&self, last: &mut Option<Instant>, resp: &ChatResponse) {
        if matches!(last, Some(at) if at.elapsed() < self.config.progress_cooldown) {
            return;
        }
        *last = Some(Instant::now());

        let names: Vec<&str> = resp.tool_calls.iter().map(|c| c.name.as_str()).collect();
        let mut note = format!("Using {}", names.join(", "));
        // When a block streamer carries the model's text, the note stays a
        // bare tool description to avoid delivering the same text twice.
        if !self.hooks.streamer_active() && !resp.content.is_empty() {
            let snippet: String = resp.content.chars().take(80).collect();
            note = format!("{snippet}… ({note})");
        }
        self.hooks.on_progress(&note);
    }
}

fn cap_tools(tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    if tools.len() > MAX_TOOLS {
        warn!(total = tools.len(), kept = MAX_TOOLS, "too many tools registered, truncating");
        tools.into_iter().take(MAX_TOOLS).collect()
    } else {
        tools
    }
}

fn assistant_with_tool_calls(resp: &ChatResponse, turn: u32) -> LoopMessage {
    let mut blocks: Vec<serde_json::Value> = Vec::with_capacity(resp.tool_calls.len() + 1);
    if !resp.content.is_empty() {
        blocks.push(serde_json::json!({ "type": "text", "text": resp.content }));
    }
    for call in &resp.tool_calls {
        blocks.push(serde_json::json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }));
    }
    LoopMessage {
        raw: serde_json::json!({ "role": "assistant", "content": blocks }),
        kind: Kind::Assistant,
        turn,
    }
}

/// Tool results from turns long past shrink first, then disappear.
fn prune_old_tool_results(messages: &mut [LoopMessage], current_turn: u32) {
    for msg in messages.iter_mut().filter(|m| m.kind == Kind::ToolResults) {
        let age = current_turn.saturating_sub(msg.turn);
        if age > REMOVE_AFTER_TURNS {
            rewrite_tool_result_contents(&mut msg.raw, &mut |_| REMOVED_MARKER.to_string());
        } else if age > PRUNE_AFTER_TURNS {
            rewrite_tool_result_contents(&mut msg.raw, &mut |content| {
                if content.len() > PRUNE_PREFIX_LEN {
                    format!("{}{}", truncate_str(content, PRUNE_PREFIX_LEN), PRUNED_MARKER)
                } else {
                    content.to_string()
                }
            });
        }
    }
}

fn truncate_tool_results(messages: &mut [LoopMessage], max_len: usize) {
    for msg in messages.iter_mut().filter(|m| m.kind == Kind::ToolResults) {
        rewrite_tool_result_contents(&mut msg.raw, &mut |content| {
            if content.len() > max_len {
                format!("{}\n[... truncated]", truncate_str(content, max_len))
            } else {
                content.to_string()
            }
        });
    }
}

fn rewrite_tool_result_contents(raw: &mut serde_json::Value, rewrite: &mut dyn FnMut(&str) -> String) {
    let Some(blocks) = raw.get_mut("content").and_then(|c| c.as_array_mut()) else {
        return;
    };
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
            continue;
        }
        if let Some(content) = block.get("content").and_then(|c| c.as_str()) {
            let rewritten = rewrite(content);
            block["content"] = serde_json::Value::String(rewritten);
        }
    }
}

/// Keep the most recent `n` messages, then advance past any leading tool
/// results whose matching assistant `tool_use` turn was dropped — the wire
/// APIs reject orphaned results.
fn keep_recent(messages: &mut Vec<LoopMessage>, n: usize) {
    if messages.len() <= n {
        return;
    }
    let mut start = messages.len() - n;
    while start < messages.len() && messages[start].kind == Kind::ToolResults {
        start += 1;
    }
    messages.drain(..start);
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_agent::approval::ApprovalManager;
    use conductor_agent::guard::{ArgRules, NullAuditSink, ToolGuard, ToolProfile};
    use conductor_agent::provider::ToolCall;
    use conductor_agent::tools::{Tool, ToolResult};
    use std::sync::Mutex;

    /// Provider that pops scripted responses and logs every request it saw.
    /// Errors are stored as `(status, message)` templates so the script can
    /// replay them (`ProviderError` is not `Clone`). The last script entry
    /// repeats forever.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<ChatResponse, (u16, String)>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Result<ChatResponse, (u16, String)>>) -> Self {
            responses.reverse();
            Self { responses: Mutex::new(responses), requests: Mutex::new(Vec::new()) }
        }

        fn repeating(resp: ChatResponse) -> Self {
            Self::new(vec![Ok(resp)])
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let mut responses = self.responses.lock().unwrap();
            let entry = if responses.len() == 1 {
                responses[0].clone()
            } else {
                responses.pop().expect("script exhausted")
            };
            entry.map_err(|(status, message)| ProviderError::Api { status, message })
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.to_string(),
            model: "test".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            stop_reason: "end_turn".to_string(),
            tool_calls: Vec::new(),
        }
    }

    fn tool_response(name: &str, input: serde_json::Value, id: &str) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            model: "test".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            stop_reason: "tool_use".to_string(),
            tool_calls: vec![ToolCall { id: id.to_string(), name: name.to_string(), input }],
        }
    }

    struct ClockTool;
    #[async_trait]
    impl Tool for ClockTool {
        fn name(&self) -> &str {
            "get_time"
        }
        fn description(&self) -> &str {
            "current time"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::success("2024-06-01T12:00:00Z")
        }
    }

    fn executor(tools: Vec<Box<dyn Tool>>) -> Arc<ToolExecutor> {
        let guard = Arc::new(ToolGuard::new(
            ToolProfile::permissive("default"),
            ArgRules::default(),
            Vec::new(),
            Arc::new(NullAuditSink),
        ));
        Arc::new(ToolExecutor::new(tools, guard, Arc::new(ApprovalManager::new())))
    }

    fn ctx() -> RunContext {
        RunContext {
            session_id: "telegram:1".to_string(),
            caller_id: "alice".to_string(),
            caller_level: AccessLevel::Owner,
            confirmation_required: Vec::new(),
            session_trust: HashMap::new(),
            send_user_msg: Arc::new(|_, _| {}),
        }
    }

    fn clock_tool_defs() -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "get_time".to_string(),
            description: "current time".to_string(),
            input_schema: serde_json::json!({}),
        }]
    }

    #[tokio::test]
    async fn no_tools_single_completion() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("Hi!"))]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![]), LoopConfig::default());
        let outcome = agent
            .run(&ctx(), &SystemPrompt::default(), "", &[], "hello", vec![], None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.content, "Hi!");
        assert_eq!(outcome.finish, FinishReason::Complete);
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_tool_turn_then_final() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_response("get_time", serde_json::json!({}), "t1")),
            Ok(text_response("It is noon UTC.")),
        ]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let outcome = agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "what time is it",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.content, "It is noon UTC.");
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.usage.total_tokens, 30);

        // Second request must carry assistant tool_use then user tool_result.
        let requests = provider.requests.lock().unwrap();
        let raw = requests[1].raw_messages.as_ref().unwrap();
        let roles: Vec<&str> = raw.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, ["user", "assistant", "user"]);
        let result_block = &raw[2]["content"][0];
        assert_eq!(result_block["type"], "tool_result");
        assert_eq!(result_block["tool_use_id"], "t1");
        assert_eq!(result_block["content"], "2024-06-01T12:00:00Z");
    }

    #[tokio::test]
    async fn identical_progressless_calls_trip_breaker() {
        let provider = Arc::new(ScriptedProvider::repeating(tool_response(
            "get_time",
            serde_json::json!({}),
            "t1",
        )));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let outcome = agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "loop please",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::LoopBreaker);
        assert!(outcome.content.contains("stopping"));
        // Breaker trips on the 7th identical progressless call; no requests
        // (and so no dispatches) happen afterwards.
        assert_eq!(provider.requests.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn warn_message_injected_after_tool_results() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_response("get_time", serde_json::json!({}), "t1")),
            Ok(tool_response("get_time", serde_json::json!({}), "t2")),
            Ok(tool_response("get_time", serde_json::json!({}), "t3")),
            Ok(text_response("fine, noon")),
        ]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "time?",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // The 4th request's history: after the 3rd identical call the warn
        // meta message must appear, positioned after that turn's results.
        let requests = provider.requests.lock().unwrap();
        let raw = requests[3].raw_messages.as_ref().unwrap();
        let last = raw.last().unwrap();
        assert_eq!(last["role"], "user");
        assert!(last["content"].as_str().unwrap().contains("repeated get_time"));
        let before = &raw[raw.len() - 2];
        assert_eq!(before["content"][0]["type"], "tool_result");
    }

    #[tokio::test]
    async fn pre_cancelled_run_stops_immediately() {
        let provider = Arc::new(ScriptedProvider::repeating(text_response("never")));
        let agent = AgentLoop::new(provider, executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = agent
            .run(&ctx(), &SystemPrompt::default(), "", &[], "hi", clock_tool_defs(), None, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.finish, FinishReason::Cancelled);
        assert_eq!(outcome.content, "Agent stopped.");
    }

    #[tokio::test]
    async fn soft_turn_cap_forces_summary() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_response("get_time", serde_json::json!({"n": 1}), "t1")),
            Ok(tool_response("get_time", serde_json::json!({"n": 2}), "t2")),
            Ok(text_response("summary of partial work")),
        ]));
        let config = LoopConfig { max_turns: 2, ..LoopConfig::default() };
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), config);
        let outcome = agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "dig forever",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::MaxTurns);
        assert_eq!(outcome.content, "summary of partial work");
        // The forced-summary call must not offer tools.
        let requests = provider.requests.lock().unwrap();
        assert!(requests.last().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn overflow_recovers_via_compaction() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err((400, "context_length_exceeded".to_string())),
            Ok(text_response("recovered")),
        ]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let outcome = agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "hello",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.content, "recovered");
    }

    #[tokio::test]
    async fn persistent_overflow_surfaces_after_max_attempts() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err((
            400,
            "maximum context length exceeded, reduce tokens".to_string(),
        ))]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let err = agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "hello",
                clock_tool_defs(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ContextOverflow { attempts: 3 }));
    }

    #[tokio::test]
    async fn interrupt_drained_at_turn_boundary() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_response("get_time", serde_json::json!({}), "t1")),
            Ok(text_response("changed course")),
        ]));
        let agent = AgentLoop::new(provider.clone(), executor(vec![Box::new(ClockTool)]), LoopConfig::default());
        let (tx, rx) = mpsc::channel(10);
        tx.try_send("actually, in Lisbon time".to_string()).unwrap();

        agent
            .run(
                &ctx(),
                &SystemPrompt::default(),
                "",
                &[],
                "what time is it",
                clock_tool_defs(),
                Some(rx),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        let raw = requests[1].raw_messages.as_ref().unwrap();
        let followup = raw
            .iter()
            .filter_map(|m| m["content"].as_str())
            .find(|c| c.contains("Follow-up from user while processing"));
        assert!(followup.unwrap().contains("Lisbon"));
    }

    #[test]
    fn keep_recent_skips_orphaned_tool_results() {
        let mut messages = vec![
            LoopMessage::user("a", 1),
            LoopMessage {
                raw: serde_json::json!({ "role": "assistant", "content": [] }),
                kind: Kind::Assistant,
                turn: 1,
            },
            LoopMessage {
                raw: serde_json::json!({ "role": "user", "content": [] }),
                kind: Kind::ToolResults,
                turn: 1,
            },
            LoopMessage::user("b", 2),
            LoopMessage::user("c", 2),
        ];
        // Slicing to the last 3 would start at the ToolResults message,
        // orphaning it; keep_recent must advance past it.
        keep_recent(&mut messages, 3);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].raw["content"], "b");
    }

    #[test]
    fn pruning_truncates_then_removes() {
        let long = "x".repeat(2_000);
        let mut messages = vec![LoopMessage {
            raw: serde_json::json!({
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "t", "content": long, "is_error": false }]
            }),
            kind: Kind::ToolResults,
            turn: 1,
        }];

        prune_old_tool_results(&mut messages, 8);
        let content = messages[0].raw["content"][0]["content"].as_str().unwrap();
        assert!(content.len() < 600);
        assert!(content.contains("truncated"));

        prune_old_tool_results(&mut messages, 13);
        let content = messages[0].raw["content"][0]["content"].as_str().unwrap();
        assert_eq!(content, REMOVED_MARKER);
    }
}
