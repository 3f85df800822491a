use conductor_core::{AccessLevel, CallerId};
use serde::{Deserialize, Serialize};

/// A resolved caller: their stable internal id, their access level, and a
/// display name suitable for prompt injection and audit logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caller {
    pub id: CallerId,
    pub display_name: String,
    pub access_level: AccessLevel,
}

/// Outcome of resolving a `(channel, external_id)` pair.
#[derive(Debug)]
pub enum ResolvedCaller {
    Known(Caller),
    /// Auto-created on first contact at the lowest non-anonymous level.
    NewlyCreated(Caller),
}

impl ResolvedCaller {
    pub fn caller(&self) -> &Caller {
        match self {
            ResolvedCaller::Known(c) => c,
            ResolvedCaller::NewlyCreated(c) => c,
        }
    }
}
