//! Message router / orchestrator: binds channel adapters to sessions
//! and drives agent runs. The inbound path is: access check → pairing →
//! maintenance gate → command fast path → approval match → busy check →
//! trigger match → input guards → media enrichment → prompt → agent loop →
//! progressive delivery → history append → async fact capture/compaction.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use conductor_agent::approval::{ApprovalManager, Verdict as ApprovalVerdict};
use conductor_agent::block_streamer::{BlockStreamer, StreamerConfig};
use conductor_agent::compact;
use conductor_agent::executor::ToolExecutor;
use conductor_agent::prompt::{Identity, PromptComposer, SessionInfo};
use conductor_agent::provider::{
    ChatRequest, LlmProvider, Message, Role, ToolDefinition, TranscriptionRequest, VisionDetail,
    VisionRequest,
};
use conductor_agent::slash::{self, SlashCommand};
use conductor_channels::{
    BusyOutcome, BusyPolicy, ChannelManager, InboundMedia, IncomingMessage, MediaType,
    MessageQueue, OutgoingMessage,
};
use conductor_core::{ChannelId, ChatId, CoreConfig, SessionKey};
use conductor_sessions::{HistoryEntry, SessionStore};
use conductor_users::{Caller, CallerResolver};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::active_run::{ActiveRun, ActiveRunTable};
use crate::agent_loop::{AgentLoop, FinishReason, LoopConfig, RunContext, RunHooks};
use crate::output;

const INTERRUPT_GRACE: Duration = Duration::from_millis(200);
const TYPING_HEARTBEAT: Duration = Duration::from_secs(8);
const TRANSCRIBE_MODEL: &str = "whisper-1";
const MAX_INLINE_IMAGE_BYTES: usize = 4 * 1024 * 1024;
const APOLOGY: &str = "Sorry — something went wrong while processing that. Please try again.";

/// Recognized natural-language abort phrases (checked verbatim, lowercased).
const STOP_PHRASES: &[&str] = &["stop", "cancel", "abort", "para", "parar", "cancela", "cancelar"];

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub loop_config: LoopConfig,
    pub busy_policy: BusyPolicy,
    pub max_history: usize,
    pub max_input_chars: usize,
    pub rate_limit_per_minute: usize,
    pub channel_max_chars: usize,
    pub streamer: StreamerConfig,
    pub summarizer_model: String,
    pub confirm_tools: Vec<String>,
    /// Exact-match token a DM can send to get promoted to `trusted`.
    pub pairing_token: Option<String>,
    /// Keyword that wakes the assistant in group chats when the session has
    /// no per-session trigger configured.
    pub default_trigger: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            loop_config: LoopConfig::default(),
            busy_policy: BusyPolicy::default(),
            max_history: 200,
            max_input_chars: 8_000,
            rate_limit_per_minute: 20,
            channel_max_chars: 4_000,
            streamer: StreamerConfig::default(),
            summarizer_model: String::new(),
            confirm_tools: Vec::new(),
            pairing_token: None,
            default_trigger: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_core(cfg: &CoreConfig) -> Self {
        let busy_policy = BusyPolicy::from_str(&cfg.channels.default_busy_policy)
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default busy policy");
                BusyPolicy::default()
            });
        Self {
            loop_config: LoopConfig::from_agent_config(&cfg.agent),
            busy_policy,
            max_history: cfg.session.max_history,
            confirm_tools: cfg.guard.confirm_tools.clone(),
            ..Self::default()
        }
    }
}

/// Everything the orchestrator composes but does not own the construction
/// of; the binary (or a test) wires these up.
pub struct OrchestratorDeps {
    pub store: Arc<SessionStore>,
    pub channels: Arc<ChannelManager>,
    pub resolver: Arc<CallerResolver>,
    pub approvals: Arc<ApprovalManager>,
    pub executor: Arc<ToolExecutor>,
    pub provider: Arc<dyn LlmProvider>,
    pub active_runs: Arc<ActiveRunTable>,
    pub tool_defs: Vec<ToolDefinition>,
    pub identity: Identity,
    pub base_instructions: String,
}

/// One unit of work for the agent: either a fresh inbound message or a
/// replay (followup drain, restart recovery).
#[derive(Clone)]
struct RunRequest {
    key: SessionKey,
    channel: ChannelId,
    chat_id: ChatId,
    caller: Caller,
    content: String,
    message_id: Option<String>,
    is_group: bool,
    kind: MediaType,
    media: Option<InboundMedia>,
}

impl RunRequest {
    fn from_incoming(msg: &IncomingMessage, caller: Caller) -> Self {
        Self {
            key: SessionKey::new(&msg.channel, &msg.chat_id, None),
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            caller,
            content: msg.content.clone(),
            message_id: Some(msg.id.clone()),
            is_group: msg.is_group,
            kind: msg.kind,
            media: msg.media.clone(),
        }
    }
}

enum Outbound {
    /// Model text (streamed block or final chunk); sentinel-stripped before
    /// delivery.
    Chunk(String),
    /// Short progress / approval-prompt note, delivered as-is.
    Note(String),
    Close,
}

/// Bridges the agent loop's hooks onto the per-run block streamer and the
/// outbound delivery task.
struct ChannelHooks {
    streamer: Arc<StdMutex<BlockStreamer>>,
    out: mpsc::UnboundedSender<Outbound>,
    streaming: bool,
}

impl RunHooks for ChannelHooks {
    fn on_text(&self, text: &str) {
        if !self.streaming {
            return;
        }
        if let Some(chunk) = self.streamer.lock().unwrap().push_token(text) {
            let _ = self.out.send(Outbound::Chunk(chunk));
        }
    }

    fn before_tools(&self) {
        if !self.streaming {
            return;
        }
        if let Some(chunk) = self.streamer.lock().unwrap().flush_now() {
            let _ = self.out.send(Outbound::Chunk(chunk));
        }
    }

    fn on_progress(&self, note: &str) {
        let _ = self.out.send(Outbound::Note(note.to_string()));
    }

    fn streamer_active(&self) -> bool {
        self.streaming
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<SessionStore>,
    queue: Arc<MessageQueue>,
    channels: Arc<ChannelManager>,
    resolver: Arc<CallerResolver>,
    approvals: Arc<ApprovalManager>,
    executor: Arc<ToolExecutor>,
    provider: Arc<dyn LlmProvider>,
    active_runs: Arc<ActiveRunTable>,
    composer: PromptComposer,
    identity: Identity,
    base_instructions: String,
    tool_defs: Vec<ToolDefinition>,
    run_cancels: DashMap<SessionKey, CancellationToken>,
    rate: DashMap<SessionKey, VecDeque<Instant>>,
    maintenance: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, deps: OrchestratorDeps) -> Arc<Self> {
        let queue = Arc::new(MessageQueue::new(config.loop_config.run_timeout));
        Arc::new(Self {
            config,
            store: deps.store,
            queue,
            channels: deps.channels,
            resolver: deps.resolver,
            approvals: deps.approvals,
            executor: deps.executor,
            provider: deps.provider,
            active_runs: deps.active_runs,
            composer: PromptComposer::new(),
            identity: deps.identity,
            base_instructions: deps.base_instructions,
            tool_defs: deps.tool_defs,
            run_cancels: DashMap::new(),
            rate: DashMap::new(),
            maintenance: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    /// Periodic stuck-session sweep. Beyond clearing the queue's processing
    /// flags, cancels the tracked run token and raises the tool abort flag
    /// for every recovered session.
    pub fn spawn_watchdog(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let recovered = this.queue.watchdog_sweep();
                for key in recovered {
                    warn!(key = %key, "watchdog cancelling stuck run");
                    this.stop_run(&key);
                    if let Err(e) = this.active_runs.clear(key.as_str()) {
                        warn!(error = %e, "failed to clear stuck active-run row");
                    }
                }
            }
        })
    }

    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Relaxed);
        info!(maintenance = on, "maintenance mode changed");
    }

    /// Inbound entry point for every channel adapter.
    #[instrument(skip(self, msg), fields(channel = %msg.channel, chat = %msg.chat_id))]
    pub async fn handle_incoming(self: &Arc<Self>, msg: IncomingMessage) {
        let caller = match self.resolver.resolve(msg.channel.as_str(), &msg.from) {
            Ok(resolved) => resolved.caller().clone(),
            Err(e) => {
                warn!(error = %e, "caller resolution failed, dropping message");
                return;
            }
        };
        if caller.access_level == conductor_core::AccessLevel::Anonymous {
            debug!(caller = %caller.id, "anonymous caller, ignoring");
            return;
        }

        let req = RunRequest::from_incoming(&msg, caller);

        // Pairing fast path (DMs only): the exact token promotes the caller.
        if !req.is_group {
            if let Some(token) = &self.config.pairing_token {
                if req.content.trim() == token {
                    self.pair_caller(&req).await;
                    return;
                }
            }
        }

        let is_command = req.content.trim_start().starts_with('/');
        if self.maintenance.load(Ordering::Relaxed) && !is_command {
            self.send_text(&req.channel, &req.chat_id, "Down for maintenance — back soon.", None)
                .await;
            return;
        }

        // Commands run even while a run is active and regardless of trigger.
        if let Some(cmd) = slash::parse(&req.content) {
            self.handle_command(&req, cmd).await;
            return;
        }

        // A pending approval claims plain yes/no style replies.
        if let Some(verdict) = self
            .approvals
            .resolve_by_natural_language(req.key.as_str(), &req.content)
            .await
        {
            let ack = match verdict {
                ApprovalVerdict::Approved => "Approved — continuing.",
                ApprovalVerdict::Denied(_) => "Okay, I won't run that.",
            };
            self.send_text(&req.channel, &req.chat_id, ack, None).await;
            return;
        }

        // Natural-language abort for an in-flight run.
        if self.run_cancels.contains_key(&req.key) && is_stop_phrase(&req.content) {
            self.stop_run(&req.key);
            return;
        }

        // Debounce: a burst of messages inside the window collapses into one
        // run. Every arrival buffers and waits; whichever task drains first
        // carries the combined text, the rest see an empty buffer and stop.
        self.queue.debounce_push(&req.key, req.content.clone());
        tokio::time::sleep(MessageQueue::debounce_window()).await;
        let Some(combined) = self.queue.debounce_drain(&req.key) else {
            return;
        };
        let mut req = req;
        req.content = combined;

        if !self.queue.try_set_processing(&req.key) {
            self.handle_busy(req).await;
            return;
        }

        self.process_owned(req).await;
    }

    /// Busy-policy routing for a message that lost the processing race.
    async fn handle_busy(self: &Arc<Self>, req: RunRequest) {
        match self
            .queue
            .apply_busy_policy(&req.key, self.config.busy_policy, req.content.clone())
        {
            BusyOutcome::Interrupted => {
                info!(key = %req.key, "interrupt policy: cancelling active run");
                self.stop_run(&req.key);
                self.queue.discard_followups(&req.key);
                for _ in 0..10 {
                    tokio::time::sleep(INTERRUPT_GRACE).await;
                    if self.queue.try_set_processing(&req.key) {
                        self.process_owned(req).await;
                        return;
                    }
                }
                warn!(key = %req.key, "could not reclaim session after interrupt, queueing");
                self.queue
                    .apply_busy_policy(&req.key, BusyPolicy::Followup, req.content);
            }
            BusyOutcome::Steered => debug!(key = %req.key, "steered into active run"),
            BusyOutcome::SteerFallback | BusyOutcome::Queued => {
                debug!(key = %req.key, "queued behind active run")
            }
        }
    }

    /// Runs the request, then drains any followups that queued up behind it.
    /// The caller must have won `try_set_processing`; the flag is released
    /// between (and after) runs by `finish_run`.
    async fn process_owned(self: &Arc<Self>, mut req: RunRequest) {
        loop {
            self.run_once(&req).await;

            let followups = self.queue.finish_run(&req.key);
            if followups.is_empty() {
                return;
            }

            let mut pending: VecDeque<String> = match self.config.busy_policy {
                BusyPolicy::Collect => {
                    let mut combined = VecDeque::new();
                    combined.push_back(followups.join("\n"));
                    combined
                }
                _ => followups.into(),
            };

            let Some(next) = pending.pop_front() else { return };
            // Later followups go back on the queue; the next finish_run
            // picks them up.
            for text in pending {
                self.queue.apply_busy_policy(&req.key, BusyPolicy::Followup, text);
            }

            if !self.queue.try_set_processing(&req.key) {
                // A fresh inbound message won the flag; it will drain.
                return;
            }
            req.content = next;
            req.message_id = None;
            req.kind = MediaType::Text;
            req.media = None;
        }
    }

    /// One agent run, from trigger gate to delivery. Does not touch the
    /// processing flag — `process_owned` owns that lifecycle.
    async fn run_once(self: &Arc<Self>, req: &RunRequest) {
        if req.is_group && !self.trigger_matches(req) {
            debug!(key = %req.key, "group message without trigger, ignoring");
            return;
        }

        let trimmed = req.content.trim();
        if trimmed.is_empty() && req.media.is_none() {
            debug!(key = %req.key, "empty message rejected");
            return;
        }
        if req.content.len() > self.config.max_input_chars {
            self.send_text(&req.channel, &req.chat_id, "That message is too long for me to process.", None)
                .await;
            return;
        }
        if !self.check_rate(&req.key) {
            self.send_text(
                &req.channel,
                &req.chat_id,
                "You're sending messages too quickly — give me a moment to catch up.",
                None,
            )
            .await;
            return;
        }

        self.react(req, "⏳").await;
        if let Some(ch) = self.channels.get(req.channel.as_str()) {
            let _ = ch.send_typing(req.chat_id.as_str()).await;
            if let Some(id) = &req.message_id {
                let _ = ch.mark_read(req.chat_id.as_str(), id).await;
            }
        }

        let content = self.enrich_media(req).await;

        let session = match self.store.get_or_create(&req.channel, &req.chat_id, None) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, key = %req.key, "session load failed");
                self.send_text(&req.channel, &req.chat_id, APOLOGY, None).await;
                return;
            }
        };

        // Register the interrupt inbox and the persisted active-run row
        // before the first await of the run proper.
        let interrupts = self.queue.register_run(&req.key);
        if let Err(e) = self.active_runs.record(&ActiveRun {
            session_key: req.key.as_str().to_string(),
            channel: req.channel.as_str().to_string(),
            chat_id: req.chat_id.as_str().to_string(),
            user_message: content.clone(),
            started_at: chrono::Utc::now(),
        }) {
            warn!(error = %e, "failed to record active run");
        }

        let cancel = CancellationToken::new();
        self.run_cancels.insert(req.key.clone(), cancel.clone());
        self.executor.reset_abort();

        // Outbound pipe: one task owns delivery ordering for this run.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let drain = tokio::spawn({
            let this = self.clone();
            let channel = req.channel.clone();
            let chat = req.chat_id.clone();
            async move {
                while let Some(item) = out_rx.recv().await {
                    match item {
                        Outbound::Chunk(text) => {
                            let clean = output::strip_sentinels(&text);
                            if output::suppresses_reply(&clean) {
                                continue;
                            }
                            this.send_text(&channel, &chat, &clean, None).await;
                        }
                        Outbound::Note(note) => this.send_text(&channel, &chat, &note, None).await,
                        Outbound::Close => break,
                    }
                }
            }
        });

        let aux_cancel = CancellationToken::new();
        self.spawn_typing_heartbeat(req, aux_cancel.clone());

        let streamer = Arc::new(StdMutex::new(BlockStreamer::new(self.config.streamer.clone())));
        let streaming = self.config.streamer.enabled;
        if streaming {
            self.spawn_idle_flush(streamer.clone(), out_tx.clone(), aux_cancel.clone());
        }
        let hooks = Arc::new(ChannelHooks { streamer: streamer.clone(), out: out_tx.clone(), streaming });

        // Prompt snapshot under the session lock, then run without it.
        let (system, history_pairs, model) = {
            let s = session.lock().unwrap();
            let pairs: Vec<(String, String)> = s
                .history
                .iter()
                .map(|e| (e.user.clone(), e.assistant.clone()))
                .collect();
            let info = SessionInfo {
                session_key: req.key.as_str().to_string(),
                turn_count: s.message_count as u32,
                timestamp: chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
            };
            let system = self.composer.compose(
                &self.identity,
                &self.base_instructions,
                &[],
                &self.tool_defs,
                &pairs,
                &content,
                s.config.business_context.as_deref(),
                Some(&info),
            );
            let model = s.config.model.clone().unwrap_or_default();
            (system, pairs, model)
        };

        let ctx = RunContext {
            session_id: req.key.as_str().to_string(),
            caller_id: req.caller.id.as_str().to_string(),
            caller_level: req.caller.access_level,
            confirmation_required: self.config.confirm_tools.clone(),
            session_trust: HashMap::new(),
            send_user_msg: {
                let out = out_tx.clone();
                Arc::new(move |_session: &str, prompt: &str| {
                    let _ = out.send(Outbound::Note(prompt.to_string()));
                })
            },
        };

        let agent = AgentLoop::new(self.provider.clone(), self.executor.clone(), self.config.loop_config.clone())
            .with_hooks(hooks);
        let result = agent
            .run(
                &ctx,
                &system,
                &model,
                &history_pairs,
                &content,
                self.tool_defs.clone(),
                Some(interrupts),
                cancel.clone(),
            )
            .await;

        aux_cancel.cancel();
        if streaming {
            let remainder = streamer.lock().unwrap().finish();
            if let Some(chunk) = remainder {
                let _ = out_tx.send(Outbound::Chunk(chunk));
            }
        }

        match result {
            Ok(outcome) => {
                let (text, reply_to) = output::extract_reply_to(&outcome.content);
                let clean = output::strip_sentinels(&text);

                // Complete/MaxTurns text already went out through the
                // streamer; the other finishes synthesized their text after
                // the last on_text and still need direct delivery.
                let delivered = streaming
                    && matches!(outcome.finish, FinishReason::Complete | FinishReason::MaxTurns);
                if !delivered && !output::suppresses_reply(&clean) {
                    self.send_text(&req.channel, &req.chat_id, &clean, reply_to).await;
                }

                let entry = HistoryEntry::new(req.content.clone(), clean.clone());
                {
                    let mut s = session.lock().unwrap();
                    s.append(entry.clone());
                    s.enforce_max_history(self.config.max_history);
                    if outcome.usage.total_tokens > 0 {
                        let model_name =
                            if outcome.model.is_empty() { "unknown" } else { outcome.model.as_str() };
                        s.record_usage(outcome.usage.total_tokens as u64, model_name);
                    }
                }
                {
                    let store = self.store.clone();
                    let key = req.key.clone();
                    tokio::task::spawn_blocking(move || store.persist_entry(&key, &entry));
                }

                if outcome.finish == FinishReason::Complete {
                    tokio::spawn(self.clone().fact_capture(req.key.clone(), req.content.clone(), clean));
                }
                tokio::spawn(self.clone().compaction_pass(req.key.clone(), false));

                self.react(req, "✅").await;
                info!(
                    key = %req.key,
                    turns = outcome.turns,
                    tokens = outcome.usage.total_tokens,
                    finish = ?outcome.finish,
                    "run complete"
                );
            }
            Err(e) => {
                error!(key = %req.key, error = %e, "agent run failed");
                self.send_text(&req.channel, &req.chat_id, APOLOGY, None).await;
                self.react(req, "⚠️").await;
            }
        }

        let _ = out_tx.send(Outbound::Close);
        let _ = drain.await;

        if let Err(e) = self.active_runs.clear(req.key.as_str()) {
            warn!(error = %e, "failed to clear active run row");
        }
        self.run_cancels.remove(&req.key);
    }

    /// On startup: any surviving active-run row is a run the previous
    /// process died inside. Tell the user and re-run the original message.
    pub async fn recover_active_runs(self: &Arc<Self>) {
        let rows = match self.active_runs.load_all() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "could not load active-run table");
                return;
            }
        };
        for row in rows {
            info!(key = %row.session_key, "resuming interrupted run");
            let channel = ChannelId::from(row.channel.clone());
            let chat_id = ChatId::from(row.chat_id.clone());
            let caller = match self.resolver.resolve(&row.channel, &row.chat_id) {
                Ok(resolved) => resolved.caller().clone(),
                Err(e) => {
                    warn!(error = %e, "caller resolution failed during recovery");
                    continue;
                }
            };
            self.send_text(&channel, &chat_id, "Resuming your earlier request after a restart…", None)
                .await;

            let key = SessionKey(row.session_key.clone());
            if !self.queue.try_set_processing(&key) {
                continue;
            }
            let req = RunRequest {
                key,
                channel,
                chat_id,
                caller,
                content: row.user_message,
                message_id: None,
                is_group: false,
                kind: MediaType::Text,
                media: None,
            };
            self.process_owned(req).await;
        }
    }

    async fn handle_command(self: &Arc<Self>, req: &RunRequest, cmd: SlashCommand) {
        debug!(key = %req.key, ?cmd, "command fast path");
        match cmd {
            SlashCommand::Stop => {
                self.stop_run(&req.key);
            }
            SlashCommand::Compact => {
                self.send_text(&req.channel, &req.chat_id, "Compacting session history…", None)
                    .await;
                tokio::spawn(self.clone().compaction_pass(req.key.clone(), true));
            }
            other => {
                let session = match self.store.get_or_create(&req.channel, &req.chat_id, None) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "session load failed for command");
                        return;
                    }
                };
                let reply = {
                    let mut s = session.lock().unwrap();
                    slash::apply_session_override(&mut s, &other)
                };
                if let Some(text) = reply {
                    self.send_text(&req.channel, &req.chat_id, &text, None).await;
                }
            }
        }
    }

    /// `/stop` and the natural-language abort phrases: raise the tool abort
    /// flag and cancel the run context. The processing flag clears in the
    /// run's teardown; the abort flag resets when the next run starts.
    fn stop_run(&self, key: &SessionKey) {
        info!(key = %key, "stopping active run");
        self.executor.abort();
        if let Some((_, token)) = self.run_cancels.remove(key) {
            token.cancel();
        }
    }

    async fn pair_caller(&self, req: &RunRequest) {
        let system_owner = Caller {
            id: conductor_core::CallerId::from("system"),
            display_name: "system".to_string(),
            access_level: conductor_core::AccessLevel::Owner,
        };
        match self.resolver.set_access_level(
            &system_owner,
            req.caller.id.as_str(),
            conductor_core::AccessLevel::Trusted,
        ) {
            Ok(()) => {
                info!(caller = %req.caller.id, "pairing token accepted");
                self.send_text(&req.channel, &req.chat_id, "Paired — you now have trusted access.", None)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "pairing promotion failed");
                self.send_text(&req.channel, &req.chat_id, APOLOGY, None).await;
            }
        }
    }

    fn trigger_matches(&self, req: &RunRequest) -> bool {
        let session_trigger = self
            .store
            .get(&req.key)
            .and_then(|s| s.lock().unwrap().config.trigger.clone());
        let trigger = session_trigger
            .or_else(|| self.config.default_trigger.clone())
            .unwrap_or_else(|| {
                self.identity
                    .fields
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| "assistant".to_string())
            });
        req.content.to_lowercase().contains(&trigger.to_lowercase())
    }

    /// Sliding one-minute window per session.
    fn check_rate(&self, key: &SessionKey) -> bool {
        let mut window = self.rate.entry(key.clone()).or_default();
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.config.rate_limit_per_minute {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Inline enrichment for fast media kinds: voice notes are transcribed
    /// and small images described, both synchronously before the run.
    async fn enrich_media(&self, req: &RunRequest) -> String {
        let Some(media) = &req.media else {
            return req.content.clone();
        };
        let Some(data) = &media.data else {
            return req.content.clone();
        };

        match req.kind {
            MediaType::Audio => {
                let transcription = TranscriptionRequest {
                    bytes: data.clone(),
                    filename: media.filename.clone().unwrap_or_else(|| "voice.ogg".to_string()),
                    model: TRANSCRIBE_MODEL.to_string(),
                };
                match self.provider.transcribe(&transcription).await {
                    Ok(text) if req.content.trim().is_empty() => format!("[voice message] {text}"),
                    Ok(text) => format!("[voice message] {text}\n{}", req.content),
                    Err(e) => {
                        warn!(error = %e, "audio transcription failed");
                        req.content.clone()
                    }
                }
            }
            MediaType::Image if data.len() <= MAX_INLINE_IMAGE_BYTES => {
                let vision = VisionRequest {
                    model_override: None,
                    prompt: "Describe this image in one or two sentences.".to_string(),
                    image_base64: base64::engine::general_purpose::STANDARD.encode(data),
                    mime_type: media.mime.clone(),
                    detail: VisionDetail::Auto,
                };
                match self.provider.complete_with_vision(&vision).await {
                    Ok(resp) => format!("[image: {}]\n{}", resp.content.trim(), req.content),
                    Err(e) => {
                        debug!(error = %e, "vision enrichment unavailable");
                        req.content.clone()
                    }
                }
            }
            _ => req.content.clone(),
        }
    }

    fn spawn_typing_heartbeat(self: &Arc<Self>, req: &RunRequest, cancel: CancellationToken) {
        let this = self.clone();
        let channel = req.channel.clone();
        let chat = req.chat_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(TYPING_HEARTBEAT) => {
                        if let Some(ch) = this.channels.get(channel.as_str()) {
                            let _ = ch.send_typing(chat.as_str()).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_idle_flush(
        &self,
        streamer: Arc<StdMutex<BlockStreamer>>,
        out: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) {
        let period = self.config.streamer.idle;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        let chunk = streamer.lock().unwrap().on_idle();
                        if let Some(chunk) = chunk {
                            let _ = out.send(Outbound::Chunk(chunk));
                        }
                    }
                }
            }
        });
    }

    /// Extracts up to three durable facts from the finished turn; failures
    /// are silent — fact capture never blocks or breaks a user turn.
    async fn fact_capture(self: Arc<Self>, key: SessionKey, user: String, assistant: String) {
        let prompt = format!(
            "From this exchange, extract up to 3 short facts about the user worth \
             remembering long-term. Reply with one fact per line, or NONE.\n\n\
             User: {user}\nAssistant: {assistant}"
        );
        let req = ChatRequest {
            model: self.config.summarizer_model.clone(),
            system: "You extract durable user facts from conversations.".to_string(),
            system_prompt: None,
            messages: vec![Message { role: Role::User, content: prompt }],
            max_tokens: 200,
            stream: false,
            tools: Vec::new(),
            raw_messages: None,
        };
        let Ok(resp) = self.provider.send(&req).await else {
            return;
        };
        let facts: Vec<String> = resp
            .content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("none"))
            .map(|line| line.trim_start_matches(['-', '*', ' ']).to_string())
            .take(3)
            .collect();
        if facts.is_empty() {
            return;
        }

        let snapshot = {
            let Some(session) = self.store.get(&key) else { return };
            let mut s = session.lock().unwrap();
            s.facts.extend(facts);
            s.facts.clone()
        };
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist_facts(&key, &snapshot));
    }

    /// Summarize-and-collapse pass. The transcript snapshot is taken under
    /// the session lock, the summarizer call happens without it, and the
    /// collapse re-checks under the lock.
    async fn compaction_pass(self: Arc<Self>, key: SessionKey, force: bool) {
        let threshold = if force { compact::KEEP_RECENT + 1 } else { compact::COMPACT_THRESHOLD };
        let transcript = {
            let Some(session) = self.store.get(&key) else { return };
            let s = session.lock().unwrap();
            if s.history.len() < threshold {
                return;
            }
            compact::render_transcript(&s.history[..s.history.len() - compact::KEEP_RECENT])
        };

        let Some(summary) = compact::summarize_transcript(
            self.provider.as_ref(),
            &self.config.summarizer_model,
            &transcript,
        )
        .await
        else {
            return;
        };

        let kept = {
            let Some(session) = self.store.get(&key) else { return };
            let mut s = session.lock().unwrap();
            s.compact(summary, compact::KEEP_RECENT);
            s.history.clone()
        };
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist_compaction(&key, &kept));
    }

    async fn send_text(&self, channel: &ChannelId, chat: &ChatId, text: &str, reply_to: Option<String>) {
        let Some(ch) = self.channels.get(channel.as_str()) else {
            warn!(channel = %channel, "no adapter registered, dropping outbound message");
            return;
        };
        let mut first = true;
        for chunk in output::split_for_channel(text, self.config.channel_max_chars) {
            let msg = OutgoingMessage {
                content: chunk,
                reply_to: if first { reply_to.clone() } else { None },
            };
            first = false;
            if let Err(e) = ch.send(chat.as_str(), &msg).await {
                warn!(channel = %channel, error = %e, "send failed");
            }
        }
    }

    async fn react(&self, req: &RunRequest, emoji: &str) {
        let Some(id) = &req.message_id else { return };
        if let Some(ch) = self.channels.get(req.channel.as_str()) {
            let _ = ch.send_reaction(req.chat_id.as_str(), id, emoji).await;
        }
    }
}

fn is_stop_phrase(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    STOP_PHRASES.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conductor_agent::guard::{ArgRules, NullAuditSink, ToolGuard, ToolProfile};
    use conductor_agent::provider::{ChatResponse, ProviderError};
    use conductor_channels::{Channel, ChannelError, ChannelStatus, MediaMessage};
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct MockChannel {
        sent: Arc<Mutex<Vec<String>>>,
        reactions: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }
        async fn connect(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send(&self, _chat_id: &str, msg: &OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(msg.content.clone());
            Ok(())
        }
        async fn send_media(&self, _chat_id: &str, _msg: &MediaMessage) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_reaction(
            &self,
            _chat_id: &str,
            _message_id: &str,
            emoji: &str,
        ) -> Result<(), ChannelError> {
            self.reactions.lock().unwrap().push(emoji.to_string());
            Ok(())
        }
        async fn send_typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn mark_read(&self, _chat_id: &str, _message_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn download_media(
            &self,
            _msg: &IncomingMessage,
        ) -> Result<(Vec<u8>, String), ChannelError> {
            Err(ChannelError::MediaDownloadFailed("mock".to_string()))
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
    }

    struct FixedProvider {
        reply: String,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            Ok(ChatResponse {
                content: self.reply.clone(),
                model: "fixed-model".to_string(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "end_turn".to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        sent: Arc<Mutex<Vec<String>>>,
        llm_calls: Arc<Mutex<usize>>,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let reactions = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ChannelManager::new();
        manager.register(Box::new(MockChannel { sent: sent.clone(), reactions }));

        let conn = Connection::open_in_memory().unwrap();
        conductor_users::db::init_db(&conn).unwrap();
        let resolver = Arc::new(CallerResolver::new(Arc::new(Mutex::new(conn))));

        let guard = Arc::new(ToolGuard::new(
            ToolProfile::permissive("default"),
            ArgRules::default(),
            Vec::new(),
            Arc::new(NullAuditSink),
        ));
        let approvals = Arc::new(ApprovalManager::new());
        let executor = Arc::new(ToolExecutor::new(Vec::new(), guard, approvals.clone()));

        let llm_calls = Arc::new(Mutex::new(0));
        let provider = Arc::new(FixedProvider { reply: "Hi!".to_string(), calls: llm_calls.clone() });

        let orchestrator = Orchestrator::new(
            config,
            OrchestratorDeps {
                store: Arc::new(SessionStore::new(3600, None)),
                channels: Arc::new(manager),
                resolver,
                approvals,
                executor,
                provider,
                active_runs: Arc::new(ActiveRunTable::open_in_memory().unwrap()),
                tool_defs: Vec::new(),
                identity: Identity::new().with_field("name", "Nova"),
                base_instructions: "be helpful".to_string(),
            },
        );
        Fixture { orchestrator, sent, llm_calls }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            streamer: StreamerConfig { enabled: false, ..StreamerConfig::default() },
            ..OrchestratorConfig::default()
        }
    }

    fn incoming(content: &str) -> IncomingMessage {
        IncomingMessage {
            id: "m1".to_string(),
            channel: ChannelId::from("mock"),
            chat_id: ChatId::from("42"),
            from: "user-7".to_string(),
            from_name: Some("Alice".to_string()),
            content: content.to_string(),
            kind: MediaType::Text,
            media: None,
            is_group: false,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn simple_reply_end_to_end() {
        let f = fixture(test_config());
        f.orchestrator.handle_incoming(incoming("hello")).await;

        assert_eq!(f.sent.lock().unwrap().as_slice(), ["Hi!"]);
        let key = SessionKey::new(&ChannelId::from("mock"), &ChatId::from("42"), None);
        let session = f.orchestrator.store.get(&key).unwrap();
        let s = session.lock().unwrap();
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].user, "hello");
        assert_eq!(s.history[0].assistant, "Hi!");
    }

    #[tokio::test]
    async fn command_fast_path_skips_llm() {
        let f = fixture(test_config());
        f.orchestrator.handle_incoming(incoming("/model opus")).await;

        let sent = f.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Model set to `opus`"));
        assert_eq!(*f.llm_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn group_message_without_trigger_is_ignored() {
        let config = OrchestratorConfig {
            default_trigger: Some("nova".to_string()),
            ..test_config()
        };
        let f = fixture(config);
        let mut msg = incoming("what's the weather");
        msg.is_group = true;
        f.orchestrator.handle_incoming(msg).await;

        assert!(f.sent.lock().unwrap().is_empty());
        // The processing flag must be released for the next message.
        let key = SessionKey::new(&ChannelId::from("mock"), &ChatId::from("42"), None);
        assert!(f.orchestrator.queue.try_set_processing(&key));
    }

    #[tokio::test]
    async fn group_message_with_trigger_runs() {
        let config = OrchestratorConfig {
            default_trigger: Some("nova".to_string()),
            ..test_config()
        };
        let f = fixture(config);
        let mut msg = incoming("nova, what's the weather");
        msg.is_group = true;
        f.orchestrator.handle_incoming(msg).await;
        assert_eq!(f.sent.lock().unwrap().as_slice(), ["Hi!"]);
    }

    #[tokio::test]
    async fn busy_session_queues_followup() {
        let f = fixture(test_config());
        let key = SessionKey::new(&ChannelId::from("mock"), &ChatId::from("42"), None);
        assert!(f.orchestrator.queue.try_set_processing(&key));

        f.orchestrator.handle_incoming(incoming("second message")).await;
        assert!(f.sent.lock().unwrap().is_empty());

        let followups = f.orchestrator.queue.finish_run(&key);
        assert_eq!(followups, vec!["second message".to_string()]);
    }

    #[tokio::test]
    async fn burst_within_debounce_window_runs_once_combined() {
        let f = fixture(test_config());
        let a = f.orchestrator.handle_incoming(incoming("part one"));
        let b = f.orchestrator.handle_incoming(incoming("part two"));
        tokio::join!(a, b);

        assert_eq!(f.sent.lock().unwrap().as_slice(), ["Hi!"]);
        let key = SessionKey::new(&ChannelId::from("mock"), &ChatId::from("42"), None);
        let session = f.orchestrator.store.get(&key).unwrap();
        let s = session.lock().unwrap();
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].user, "part one\npart two");
    }

    #[tokio::test]
    async fn empty_message_is_rejected_silently() {
        let f = fixture(test_config());
        f.orchestrator.handle_incoming(incoming("   ")).await;
        assert!(f.sent.lock().unwrap().is_empty());
        let key = SessionKey::new(&ChannelId::from("mock"), &ChatId::from("42"), None);
        assert!(f.orchestrator.store.get(&key).is_none());
    }

    #[tokio::test]
    async fn oversized_message_gets_fixed_reply() {
        let config = OrchestratorConfig { max_input_chars: 10, ..test_config() };
        let f = fixture(config);
        f.orchestrator.handle_incoming(incoming(&"x".repeat(50))).await;
        let sent = f.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("too long"));
        assert_eq!(*f.llm_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn restart_recovery_replays_and_clears_row() {
        let f = fixture(test_config());
        f.orchestrator
            .active_runs
            .record(&ActiveRun {
                session_key: "mock:42".to_string(),
                channel: "mock".to_string(),
                chat_id: "42".to_string(),
                user_message: "unfinished question".to_string(),
                started_at: chrono::Utc::now(),
            })
            .unwrap();

        f.orchestrator.recover_active_runs().await;

        let sent = f.sent.lock().unwrap();
        assert!(sent[0].contains("Resuming"));
        assert!(sent.contains(&"Hi!".to_string()));
        assert!(f.orchestrator.active_runs.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pairing_token_promotes_dm_caller() {
        let config = OrchestratorConfig {
            pairing_token: Some("secret-pair-token".to_string()),
            ..test_config()
        };
        let f = fixture(config);
        // First contact auto-creates the caller at guest level.
        f.orchestrator.handle_incoming(incoming("hello")).await;
        f.orchestrator.handle_incoming(incoming("secret-pair-token")).await;

        let sent = f.sent.lock().unwrap();
        assert!(sent.iter().any(|m| m.contains("Paired")));
        let caller = f.orchestrator.resolver.resolve("mock", "user-7").unwrap();
        assert_eq!(caller.caller().access_level, conductor_core::AccessLevel::Trusted);
    }

    #[test]
    fn stop_phrases_match_multilingual_set() {
        assert!(is_stop_phrase("stop"));
        assert!(is_stop_phrase("  PARA  "));
        assert!(is_stop_phrase("cancela"));
        assert!(!is_stop_phrase("please stop doing that"));
    }
}
