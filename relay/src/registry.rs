//! Client registry (spec §4.2, component C2).
//!
//! The name → connection map is the only process-wide mutable state
//! (spec §9); `DashMap`'s per-shard locking gives us "concurrent claims on
//! the same name resolve as if serialized" for free via its `entry` API,
//! and keeps `lookup` — on the hot path, once per public request — lock-free
//! for the common case of distinct names.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::tunnel::ClientHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    BadName,
    Taken,
}

#[derive(Default)]
pub struct Registry {
    clients: DashMap<String, Arc<ClientHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical form: ASCII lowercase letters+digits only, 1..=63 bytes.
    pub fn normalize(name: &str) -> Option<String> {
        if name.is_empty() || name.len() > 63 {
            return None;
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(name.to_ascii_lowercase())
    }

    /// A connection that already holds a claim silently keeps it (spec
    /// §4.2): this returns `Ok` with the *existing* name without touching
    /// the map, rather than letting the connection pick up a second name.
    pub fn claim(
        &self,
        client: &Arc<ClientHandle>,
        requested: &str,
    ) -> Result<String, ClaimError> {
        if let Some(existing) = client.claimed_name() {
            return Ok(existing);
        }

        let normalized = Self::normalize(requested).ok_or(ClaimError::BadName)?;

        match self.clients.entry(normalized.clone()) {
            Entry::Occupied(_) => Err(ClaimError::Taken),
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
                client.set_claimed(normalized.clone());
                Ok(normalized)
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(name).map(|entry| entry.value().clone())
    }

    /// Idempotent: does nothing if `client` never claimed a name, or if
    /// its claimed name was already removed.
    pub fn release(&self, client: &ClientHandle) {
        if let Some(name) = client.claimed_name() {
            self.clients.remove(&name);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> Arc<ClientHandle> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(ClientHandle::new(tx))
    }

    #[test]
    fn normalize_rejects_boundaries() {
        assert_eq!(Registry::normalize(""), None);
        assert_eq!(Registry::normalize(&"a".repeat(64)), None);
        assert!(Registry::normalize(&"a".repeat(63)).is_some());
        assert!(Registry::normalize("a").is_some());
        assert_eq!(Registry::normalize("a.b"), None);
        assert_eq!(Registry::normalize("a_b"), None);
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(Registry::normalize("BOB").unwrap(), "bob");
    }

    #[test]
    fn claim_then_lookup() {
        let registry = Registry::new();
        let a = handle();
        assert_eq!(registry.claim(&a, "alice").unwrap(), "alice");
        assert!(registry.lookup("alice").is_some());
        assert!(registry.lookup("ghost").is_none());
    }

    #[test]
    fn second_claim_on_same_name_is_taken() {
        let registry = Registry::new();
        let a = handle();
        let b = handle();
        registry.claim(&a, "bob").unwrap();
        assert_eq!(registry.claim(&b, "BOB"), Err(ClaimError::Taken));
        assert_eq!(registry.lookup("bob").unwrap().id(), a.id());
    }

    #[test]
    fn repeat_claim_on_same_connection_keeps_first_name() {
        let registry = Registry::new();
        let a = handle();
        assert_eq!(registry.claim(&a, "alice").unwrap(), "alice");
        assert_eq!(registry.claim(&a, "mallory").unwrap(), "alice");
        assert!(registry.lookup("alice").is_some());
        assert!(registry.lookup("mallory").is_none());
    }

    #[test]
    fn bad_name_is_rejected_without_side_effects() {
        let registry = Registry::new();
        let a = handle();
        assert_eq!(registry.claim(&a, "a.b"), Err(ClaimError::BadName));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let registry = Registry::new();
        let a = handle();
        registry.claim(&a, "dave").unwrap();
        registry.release(&a);
        registry.release(&a);
        assert!(registry.lookup("dave").is_none());
    }

    #[test]
    fn release_without_claim_does_nothing() {
        let registry = Registry::new();
        let a = handle();
        registry.release(&a);
        assert_eq!(registry.len(), 0);
    }
}
