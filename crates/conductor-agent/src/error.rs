use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("run deadline exceeded after {turns} turns")]
    DeadlineExceeded { turns: u32 },

    #[error("run cancelled by user")]
    Cancelled,

    #[error("context overflow after {attempts} compactions")]
    ContextOverflow { attempts: u32 },

    #[error("core error: {0}")]
    Core(#[from] conductor_core::CoreError),

    #[error("session error: {0}")]
    Session(#[from] conductor_sessions::SessionError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
