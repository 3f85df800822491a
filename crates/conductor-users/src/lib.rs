pub mod db;
pub mod error;
pub mod identity;
pub mod resolver;
pub mod types;

pub use error::UserError;
pub use resolver::CallerResolver;
pub use types::{Caller, ResolvedCaller};
