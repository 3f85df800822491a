use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Call once from the
/// orchestrator binary's `main`; a second call is a no-op error that we
/// deliberately ignore (tests may call this more than once across threads).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
