use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("agent error: {0}")]
    Agent(#[from] conductor_agent::AgentError),

    #[error("session error: {0}")]
    Session(#[from] conductor_sessions::SessionError),

    #[error("channel error: {0}")]
    Channel(#[from] conductor_channels::ChannelError),

    #[error("user error: {0}")]
    User(#[from] conductor_users::UserError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("no channel adapter registered for `{0}`")]
    UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
