use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("caller not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("core error: {0}")]
    Core(#[from] conductor_core::CoreError),
}

pub type Result<T> = std::result::Result<T, UserError>;
