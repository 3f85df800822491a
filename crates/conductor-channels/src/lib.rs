pub mod channel;
pub mod error;
pub mod manager;
pub mod queue;
pub mod types;

pub use channel::Channel;
pub use error::ChannelError;
pub use manager::ChannelManager;
pub use queue::{BusyOutcome, BusyPolicy, MessageQueue};
pub use types::{
    ChannelStatus, IncomingMessage, InboundMedia, MediaMessage, MediaType, OutgoingMessage,
};
