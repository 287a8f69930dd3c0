//! The in-memory registry of running servers: an explicit, constructor-
//! injected map from directory id to its running instance. Membership here
//! is the sole truth for "is this id running" — it is never persisted and
//! is rebuilt empty on process restart, which is exactly why the port
//! prober exists as an independent truth source.

use dashmap::DashMap;
use uuid::Uuid;

use crate::instance::InstanceHandle;

/// A running server tracked by the registry. Created only by a successful
/// start; destroyed only by stop or shutdown-all; never mutated in place.
#[derive(Clone)]
pub struct ServerInstance {
    pub id: String,
    pub port: u16,
    pub handle: InstanceHandle,
}

/// Registry of currently-managed running servers, keyed by directory id
#[derive(Default)]
pub struct ServerRegistry {
    servers: DashMap<String, ServerInstance>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
        }
    }

    /// Whether a server is registered for `id`
    pub fn has(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    /// Port claimed by `id`, if registered
    pub fn port_of(&self, id: &str) -> Option<u16> {
        self.servers.get(id).map(|entry| entry.port)
    }

    /// Handle for `id`, if registered. Clones out of the map so callers
    /// never hold a map guard across an await point.
    pub fn get_handle(&self, id: &str) -> Option<InstanceHandle> {
        self.servers.get(id).map(|entry| entry.handle.clone())
    }

    /// Register a new instance. Returns false (and drops nothing) if an
    /// instance is already registered under the same id.
    pub fn put(&self, instance: ServerInstance) -> bool {
        match self.servers.entry(instance.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(instance);
                true
            }
        }
    }

    /// Remove the instance for `id`, returning it if present
    pub fn remove(&self, id: &str) -> Option<ServerInstance> {
        self.servers.remove(id).map(|(_, instance)| instance)
    }

    /// Remove the instance for `id` only if it is still the given
    /// generation. Used by the unexpected-close watchdog so a stale
    /// notification cannot evict a restarted successor.
    pub fn remove_generation(&self, id: &str, token: Uuid) -> bool {
        self.servers
            .remove_if(id, |_, instance| instance.handle.token() == token)
            .is_some()
    }

    /// Ids of all registered servers
    pub fn all_ids(&self) -> Vec<String> {
        self.servers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    fn test_instance(id: &str, port: u16) -> ServerInstance {
        let (shutdown_tx, _) = watch::channel(false);
        let (_closed_tx, closed_rx) = watch::channel(false);
        ServerInstance {
            id: id.to_string(),
            port,
            handle: InstanceHandle::from_parts(port, shutdown_tx, closed_rx),
        }
    }

    #[test]
    fn test_put_and_lookup() {
        let registry = ServerRegistry::new();
        assert!(!registry.has("a"));
        assert_eq!(registry.port_of("a"), None);

        assert!(registry.put(test_instance("a", 5001)));
        assert!(registry.has("a"));
        assert_eq!(registry.port_of("a"), Some(5001));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_put_rejects_duplicate_id() {
        let registry = ServerRegistry::new();
        assert!(registry.put(test_instance("a", 5001)));
        assert!(!registry.put(test_instance("a", 5002)));

        // Original entry untouched
        assert_eq!(registry.port_of("a"), Some(5001));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = ServerRegistry::new();
        registry.put(test_instance("a", 5001));

        let removed = registry.remove("a").unwrap();
        assert_eq!(removed.port, 5001);
        assert!(!registry.has("a"));
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_remove_generation_matches_token() {
        let registry = ServerRegistry::new();
        let first = test_instance("a", 5001);
        let stale_token = first.handle.token();
        registry.put(first);

        // Same id, new generation
        registry.remove("a");
        let second = test_instance("a", 5001);
        let live_token = second.handle.token();
        registry.put(second);

        // A stale watchdog notification must not evict the successor
        assert!(!registry.remove_generation("a", stale_token));
        assert!(registry.has("a"));

        assert!(registry.remove_generation("a", live_token));
        assert!(!registry.has("a"));
    }

    #[test]
    fn test_all_ids() {
        let registry = ServerRegistry::new();
        registry.put(test_instance("a", 5001));
        registry.put(test_instance("b", 5002));

        let mut ids = registry.all_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
