pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use types::{AccessLevel, CallerId, ChannelId, ChatId, SessionKey};
