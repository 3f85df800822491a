use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conductor_core::AccessLevel;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, UserError};
use crate::identity::{add_identity, create_caller, find_caller_by_identity, get_caller};
use crate::types::{Caller, ResolvedCaller};

/// Maximum number of `(channel, external_id)` → caller_id pairs kept in the
/// in-process cache. Eviction: when full, drop the oldest half.
const CACHE_MAX: usize = 256;

/// Resolves external channel identities into first-class callers with an
/// access level, caching the hot path so repeat messages from a known
/// caller skip the database.
pub struct CallerResolver {
    db: Arc<Mutex<Connection>>,
    cache: Mutex<HashMap<(String, String), String>>,
    cache_order: Mutex<Vec<(String, String)>>,
}

impl CallerResolver {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a `(channel, external_id)` pair to a caller.
    ///
    /// Unknown identities are auto-created at `Guest` level — promotion to
    /// `trusted`/`owner` is an explicit admin action via `set_access_level`.
    pub fn resolve(&self, channel: &str, external_id: &str) -> Result<ResolvedCaller> {
        let key = (channel.to_string(), external_id.to_string());

        if let Some(caller_id) = self.cache_lookup(&key) {
            debug!(channel, external_id, caller_id, "cache hit");
            let conn = self.db.lock().unwrap();
            if let Some(caller) = get_caller(&conn, &caller_id)? {
                return Ok(ResolvedCaller::Known(caller));
            }
            drop(conn);
            self.cache_remove(&key);
        }

        let conn = self.db.lock().unwrap();
        if let Some(caller) = find_caller_by_identity(&conn, channel, external_id)? {
            self.cache_insert(key, caller.id.as_str().to_string());
            return Ok(ResolvedCaller::Known(caller));
        }

        info!(channel, external_id, "new identity; creating caller");
        let display_name = format!("{}:{}", channel, external_id);
        let caller = create_caller(&conn, &display_name, AccessLevel::Guest)?;
        add_identity(&conn, caller.id.as_str(), channel, external_id)?;
        self.cache_insert(key, caller.id.as_str().to_string());

        Ok(ResolvedCaller::NewlyCreated(caller))
    }

    pub fn get_caller(&self, caller_id: &str) -> Result<Option<Caller>> {
        let conn = self.db.lock().unwrap();
        get_caller(&conn, caller_id)
    }

    /// Administrative promotion/demotion. `actor` must already be `Owner`.
    pub fn set_access_level(
        &self,
        actor: &Caller,
        caller_id: &str,
        level: AccessLevel,
    ) -> Result<()> {
        if actor.access_level != AccessLevel::Owner {
            return Err(UserError::PermissionDenied(
                "only an owner can change access levels".to_string(),
            ));
        }
        let conn = self.db.lock().unwrap();
        let rows = crate::identity::set_access_level(&conn, caller_id, level)?;
        if rows == 0 {
            return Err(UserError::NotFound(caller_id.to_string()));
        }
        drop(conn);
        self.invalidate_caller(caller_id);
        Ok(())
    }

    /// Link an additional `(channel, external_id)` identity to an existing
    /// caller (e.g. the same human messaging from two channels).
    pub fn link_identity(&self, caller_id: &str, channel: &str, external_id: &str) -> Result<()> {
        let conn = self.db.lock().unwrap();
        get_caller(&conn, caller_id)?.ok_or_else(|| UserError::NotFound(caller_id.to_string()))?;
        add_identity(&conn, caller_id, channel, external_id)?;
        drop(conn);
        self.cache_remove(&(channel.to_string(), external_id.to_string()));
        Ok(())
    }

    pub fn invalidate_caller(&self, caller_id: &str) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();
        order.retain(|k| {
            if cache.get(k).map(|v| v.as_str()) == Some(caller_id) {
                cache.remove(k);
                false
            } else {
                true
            }
        });
    }

    fn cache_lookup(&self, key: &(String, String)) -> Option<String> {
        self.cache.lock().unwrap().get(key).cloned()
    }

    fn cache_remove(&self, key: &(String, String)) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();
        cache.remove(key);
        order.retain(|k| k != key);
    }

    fn cache_insert(&self, key: (String, String), caller_id: String) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();

        if let std::collections::hash_map::Entry::Occupied(mut e) = cache.entry(key.clone()) {
            e.insert(caller_id);
            return;
        }

        if cache.len() >= CACHE_MAX {
            let evict_count = CACHE_MAX / 2;
            let to_remove: Vec<_> = order.drain(..evict_count).collect();
            for k in to_remove {
                cache.remove(&k);
            }
        }

        order.push(key.clone());
        cache.insert(key, caller_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn resolver() -> CallerResolver {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        CallerResolver::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn unknown_identity_is_auto_created_as_guest() {
        let r = resolver();
        let resolved = r.resolve("telegram", "u1").unwrap();
        assert!(matches!(resolved, ResolvedCaller::NewlyCreated(_)));
        assert_eq!(resolved.caller().access_level, AccessLevel::Guest);
    }

    #[test]
    fn known_identity_resolves_to_same_caller() {
        let r = resolver();
        let first = r.resolve("telegram", "u1").unwrap();
        let id1 = first.caller().id.as_str().to_string();
        let second = r.resolve("telegram", "u1").unwrap();
        assert!(matches!(second, ResolvedCaller::Known(_)));
        assert_eq!(second.caller().id.as_str(), id1);
    }

    #[test]
    fn owner_can_promote_caller() {
        let r = resolver();
        let guest = r.resolve("telegram", "u1").unwrap().caller().clone();
        let owner = Caller {
            id: guest.id.clone(),
            display_name: "owner".to_string(),
            access_level: AccessLevel::Owner,
        };
        r.set_access_level(&owner, guest.id.as_str(), AccessLevel::Trusted)
            .unwrap();
        let reloaded = r.get_caller(guest.id.as_str()).unwrap().unwrap();
        assert_eq!(reloaded.access_level, AccessLevel::Trusted);
    }

    #[test]
    fn non_owner_cannot_promote() {
        let r = resolver();
        let guest = r.resolve("telegram", "u1").unwrap().caller().clone();
        let result = r.set_access_level(&guest, guest.id.as_str(), AccessLevel::Owner);
        assert!(result.is_err());
    }
}
