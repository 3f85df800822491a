use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use conductor_agent::approval::ApprovalManager;
use conductor_agent::executor::ToolExecutor;
use conductor_agent::guard::{ArgRules, AuditSink, SqliteAuditSink, ToolGuard, ToolProfile};
use conductor_agent::prompt::Identity;
use conductor_agent::provider::LlmProvider;
use conductor_agent::router::{ProviderRouter, ProviderSlot};
use conductor_agent::tools::{self, Tool};
use conductor_agent::{AnthropicProvider, OpenAiProvider};
use conductor_channels::ChannelManager;
use conductor_core::CoreConfig;
use conductor_orchestrator::{ActiveRunTable, Orchestrator, OrchestratorConfig, OrchestratorDeps};
use conductor_sessions::{SessionStore, SqlitePersister};
use conductor_users::CallerResolver;
use tracing::{info, warn};

const PROVIDER_RETRIES: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor_core::logging::init();

    // config: CONDUCTOR_CONFIG env > ~/.conductor/conductor.toml > defaults
    let config_path = std::env::var("CONDUCTOR_CONFIG").ok();
    let config = CoreConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        CoreConfig::default()
    });

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir).context("creating data directory")?;

    let persister = SqlitePersister::open(&format!("{data_dir}/sessions.db"))?;
    let store = Arc::new(SessionStore::new(config.session.ttl_secs, Some(Arc::new(persister))));
    let restored = store.load_all()?;
    info!(sessions = restored, "session store loaded");

    let users_db = rusqlite::Connection::open(format!("{data_dir}/users.db"))?;
    conductor_users::db::init_db(&users_db)?;
    let resolver = Arc::new(CallerResolver::new(Arc::new(Mutex::new(users_db))));

    let audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditSink::open(&format!("{data_dir}/audit.db"))?);
    let guard = Arc::new(match &config.guard.profile {
        Some(profile) => ToolGuard::new(
            ToolProfile::permissive(profile.as_str()),
            ArgRules::default(),
            config.guard.confirm_tools.clone(),
            audit,
        ),
        None => {
            warn!("no guard profile configured; tools are restricted to owner callers");
            ToolGuard::permissive_for_owner(audit)
        }
    });
    let approvals = Arc::new(ApprovalManager::new());

    // Channel adapters register here; deployments plug in their transports
    // before connect_all. The core runs headless without any.
    let mut channel_manager = ChannelManager::new();
    channel_manager.connect_all().await;
    let channels = Arc::new(channel_manager);

    let tools: Vec<Box<dyn Tool>> = vec![
        Box::new(tools::read_file::ReadFileTool),
        Box::new(tools::write_file::WriteFileTool),
        Box::new(tools::list_files::ListFilesTool),
        Box::new(tools::search_files::SearchFilesTool),
        Box::new(tools::shell_exec::ShellExecTool::new()),
        Box::new(tools::send_message::SendMessageTool::new(channels.clone())),
    ];
    let tool_defs = tools::to_definitions(&tools);
    let executor = Arc::new(ToolExecutor::new(tools, guard, approvals.clone()));

    let provider = build_provider(&config)?;
    let summarizer_model = summarizer_model(&config);

    let orchestrator_config = OrchestratorConfig {
        summarizer_model,
        ..OrchestratorConfig::from_core(&config)
    };
    let orchestrator = Orchestrator::new(
        orchestrator_config,
        OrchestratorDeps {
            store: store.clone(),
            channels,
            resolver,
            approvals,
            executor,
            provider,
            active_runs: Arc::new(ActiveRunTable::open(&format!("{data_dir}/active_runs.db"))?),
            tool_defs,
            identity: Identity::new().with_field("name", "Conductor"),
            base_instructions: String::new(),
        },
    );

    // Background maintenance: stuck-session watchdog + session TTL pruning.
    orchestrator.spawn_watchdog(Duration::from_secs(60));
    {
        let store = store.clone();
        let ttl_secs = config.session.ttl_secs;
        let period = Duration::from_secs((ttl_secs / 2).max(60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let pruned = store.prune();
                let rotated = store.rotate(ttl_secs as i64);
                if pruned > 0 || rotated > 0 {
                    info!(pruned, rotated, "session maintenance tick");
                }
            }
        });
    }

    orchestrator.recover_active_runs().await;
    info!("conductor core ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.conductor")
}

/// Build the provider fallback chain from config. Slots are ordered by
/// `fallback_order` when given, otherwise anthropic-then-openai.
fn build_provider(config: &CoreConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let mut slots: Vec<(String, ProviderSlot)> = Vec::new();

    if let Some(cfg) = &config.providers.anthropic {
        if let Ok(key) = std::env::var(&cfg.api_key_env) {
            slots.push((
                "anthropic".to_string(),
                ProviderSlot::new(
                    Box::new(AnthropicProvider::new(key, Some(cfg.base_url.clone()))),
                    cfg.model.clone(),
                    PROVIDER_RETRIES,
                ),
            ));
        } else {
            warn!(env = %cfg.api_key_env, "anthropic configured but key env is unset");
        }
    }
    if let Some(cfg) = &config.providers.openai {
        if let Ok(key) = std::env::var(&cfg.api_key_env) {
            slots.push((
                "openai".to_string(),
                ProviderSlot::new(
                    Box::new(OpenAiProvider::new(key, Some(cfg.base_url.clone()))),
                    cfg.model.clone(),
                    PROVIDER_RETRIES,
                ),
            ));
        } else {
            warn!(env = %cfg.api_key_env, "openai configured but key env is unset");
        }
    }

    if !config.providers.fallback_order.is_empty() {
        let order = &config.providers.fallback_order;
        slots.sort_by_key(|(id, _)| order.iter().position(|o| o == id).unwrap_or(usize::MAX));
    }

    let slots: Vec<ProviderSlot> = slots.into_iter().map(|(_, slot)| slot).collect();
    anyhow::ensure!(
        !slots.is_empty(),
        "no LLM provider available: configure [providers.anthropic] or [providers.openai] and set the API key env var"
    );
    Ok(Arc::new(ProviderRouter::new(slots)))
}

/// Cheap model for compaction summaries and fact capture: the last slot in
/// the fallback order's configured model, or empty (= provider default).
fn summarizer_model(config: &CoreConfig) -> String {
    config
        .providers
        .openai
        .as_ref()
        .map(|c| c.model.clone())
        .or_else(|| config.providers.anthropic.as_ref().map(|c| c.model.clone()))
        .unwrap_or_default()
}
