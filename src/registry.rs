//! Bookkeeping of live subscriptions keyed by (pubsub name, topic).
//!
//! The registry enforces that at most one subscription, pull or push, holds
//! a key at any time. A handle stays registered from `Opening` until it
//! reaches `Closed`, so a key whose close failed (`Closing`) cannot be taken
//! over until the close is retried successfully or forced.

use crate::types::{SubscriptionId, SubscriptionMode, SubscriptionState, TopicKey};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared record of one subscription's identity and lifecycle state.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    key: TopicKey,
    mode: SubscriptionMode,
    state: RwLock<SubscriptionState>,
}

impl SubscriptionHandle {
    fn new(id: SubscriptionId, key: TopicKey, mode: SubscriptionMode) -> Self {
        Self {
            id,
            key,
            mode,
            state: RwLock::new(SubscriptionState::Opening),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.read()
    }

    /// Move to `next` if that is a legal step from the current state.
    ///
    /// Returns the state before the call on success, or the current state
    /// when the step was refused.
    pub(crate) fn transition(
        &self,
        next: SubscriptionState,
    ) -> Result<SubscriptionState, SubscriptionState> {
        let mut state = self.state.write();
        let current = *state;
        if current.can_transition_to(next) {
            *state = next;
            Ok(current)
        } else {
            Err(current)
        }
    }

    /// Unconditionally mark the handle closed.
    pub(crate) fn mark_closed(&self) -> SubscriptionState {
        std::mem::replace(&mut *self.state.write(), SubscriptionState::Closed)
    }
}

/// Attempted to register a key that is already held.
#[derive(Debug)]
pub struct DuplicateSubscription {
    pub key: TopicKey,
    pub existing: Arc<SubscriptionHandle>,
}

/// Registry of live subscriptions.
pub struct Registry {
    /// Live handles by key.
    handles: Mutex<HashMap<TopicKey, Arc<SubscriptionHandle>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Claim `key` for a new subscription in `Opening` state.
    pub fn register(
        &self,
        key: TopicKey,
        mode: SubscriptionMode,
    ) -> Result<Arc<SubscriptionHandle>, DuplicateSubscription> {
        let mut handles = self.handles.lock();

        if let Some(existing) = handles.get(&key) {
            return Err(DuplicateSubscription {
                key,
                existing: Arc::clone(existing),
            });
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(SubscriptionHandle::new(id, key.clone(), mode));
        handles.insert(key, Arc::clone(&handle));

        Ok(handle)
    }

    /// Release the key held by `handle`.
    ///
    /// A no-op if the key is now held by a different handle, so a late
    /// deregistration never evicts a newer subscription.
    pub fn deregister(&self, handle: &SubscriptionHandle) -> bool {
        let mut handles = self.handles.lock();
        match handles.get(&handle.key) {
            Some(current) if current.id == handle.id => {
                handles.remove(&handle.key);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, key: &TopicKey) -> Option<Arc<SubscriptionHandle>> {
        self.handles.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Keys currently held, sorted.
    pub fn keys(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self.handles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn key(topic: &str) -> TopicKey {
        TopicKey::new("messages", topic)
    }

    #[test]
    fn test_register_deregister() {
        let registry = Registry::new();

        let handle = registry.register(key("neworder"), SubscriptionMode::Pull).unwrap();
        assert_eq!(handle.state(), SubscriptionState::Opening);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&key("neworder")).is_some());

        assert!(registry.deregister(&handle));
        assert!(registry.is_empty());
        assert!(registry.lookup(&key("neworder")).is_none());

        // Second deregister is a no-op
        assert!(!registry.deregister(&handle));
    }

    #[test]
    fn test_duplicate_across_modes() {
        let registry = Registry::new();

        let first = registry.register(key("neworder"), SubscriptionMode::Pull).unwrap();
        let dup = registry
            .register(key("neworder"), SubscriptionMode::Push)
            .unwrap_err();

        assert_eq!(dup.key, key("neworder"));
        assert_eq!(dup.existing.id(), first.id());
        assert_eq!(dup.existing.mode(), SubscriptionMode::Pull);
    }

    #[test]
    fn test_stale_deregister_keeps_newer_handle() {
        let registry = Registry::new();

        let old = registry.register(key("neworder"), SubscriptionMode::Pull).unwrap();
        registry.deregister(&old);
        let new = registry.register(key("neworder"), SubscriptionMode::Pull).unwrap();

        assert!(!registry.deregister(&old));
        assert_eq!(registry.lookup(&key("neworder")).unwrap().id(), new.id());
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let registry = Arc::new(Registry::new());

        let winners: usize = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    registry
                        .register(key("contended"), SubscriptionMode::Push)
                        .is_ok() as usize
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handle_transitions() {
        let registry = Registry::new();
        let handle = registry.register(key("neworder"), SubscriptionMode::Pull).unwrap();

        assert_eq!(handle.transition(SubscriptionState::Active), Ok(SubscriptionState::Opening));
        assert_eq!(
            handle.transition(SubscriptionState::Closed),
            Err(SubscriptionState::Active)
        );
        assert_eq!(handle.transition(SubscriptionState::Closing), Ok(SubscriptionState::Active));
        assert_eq!(handle.transition(SubscriptionState::Closed), Ok(SubscriptionState::Closing));
    }

    #[test]
    fn test_closed_handle_cannot_become_active() {
        let registry = Registry::new();
        let handle = registry.register(key("neworder"), SubscriptionMode::Push).unwrap();

        assert_eq!(handle.mark_closed(), SubscriptionState::Opening);
        assert_eq!(
            handle.transition(SubscriptionState::Active),
            Err(SubscriptionState::Closed)
        );
        assert_eq!(handle.state(), SubscriptionState::Closed);
    }

    proptest! {
        /// Whatever the interleaving of registers and deregisters, each key
        /// is held by at most one handle and `len` matches the live set.
        #[test]
        fn prop_at_most_one_handle_per_key(ops in proptest::collection::vec((0u8..4, any::<bool>()), 1..64)) {
            let registry = Registry::new();
            let mut live: HashMap<TopicKey, Arc<SubscriptionHandle>> = HashMap::new();

            for (topic, register) in ops {
                let k = key(&format!("t{}", topic));
                if register {
                    let result = registry.register(k.clone(), SubscriptionMode::Pull);
                    prop_assert_eq!(result.is_ok(), !live.contains_key(&k));
                    if let Ok(handle) = result {
                        live.insert(k, handle);
                    }
                } else if let Some(handle) = live.remove(&k) {
                    prop_assert!(registry.deregister(&handle));
                }
                prop_assert_eq!(registry.len(), live.len());
            }
        }
    }
}
