//! Correlation index from session key to live bridge.

use crate::bridge::Bridge;
use crate::workspace::SessionKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared, cloneable session map. Owns no lifecycle decisions.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionKey, Arc<Bridge>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: SessionKey, bridge: Arc<Bridge>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, bridge);
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<Bridge>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Removing an absent key is a no-op.
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Bridge>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeLimits;
    use std::time::Duration;

    fn limits() -> BridgeLimits {
        BridgeLimits {
            input_cap: 16,
            output_cap: 16,
            grace_window: Duration::from_secs(1),
        }
    }

    #[test]
    fn register_lookup_and_idempotent_remove() {
        let registry = SessionRegistry::new();
        let key = SessionKey::generate();
        let bridge = Bridge::new(key.clone(), limits(), Box::new(|_| {}));

        registry.register(key.clone(), bridge.clone());
        assert!(Arc::ptr_eq(&registry.lookup(&key).unwrap(), &bridge));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert!(registry.lookup(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn isolated_registries_do_not_share_entries() {
        let a = SessionRegistry::new();
        let b = SessionRegistry::new();
        let key = SessionKey::generate();
        a.register(key.clone(), Bridge::new(key.clone(), limits(), Box::new(|_| {})));
        assert!(b.lookup(&key).is_none());
        // Clones share the same map.
        assert!(a.clone().lookup(&key).is_some());
    }
}
