//! Tracked wallet registry.
//!
//! Holds the set of addresses the live connection should be subscribed to.
//! The connection manager reads a full snapshot on every (re)connect; callers
//! translate individual mutations into subscribe/unsubscribe deltas.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// A change to the tracked set that must be mirrored on the live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryDelta {
    Added(Vec<String>),
    Removed(Vec<String>),
}

impl RegistryDelta {
    pub fn addresses(&self) -> &[String] {
        match self {
            Self::Added(a) | Self::Removed(a) => a,
        }
    }
}

/// Shared set of tracked addresses.
///
/// Cloning yields another handle onto the same set. Capacity limits are the
/// caller's business; the registry only answers membership.
#[derive(Clone, Default)]
pub struct AddressRegistry {
    addresses: Arc<Mutex<BTreeSet<String>>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // A poisoned set is still a valid set.
        self.addresses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `address`. Returns `false` if it was already tracked.
    pub fn add(&self, address: &str) -> bool {
        self.lock().insert(address.to_string())
    }

    /// Stop tracking `address`. Returns `false` if it was not tracked.
    pub fn remove(&self, address: &str) -> bool {
        self.lock().remove(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains(address)
    }

    /// Sorted copy of every tracked address.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Drop every address, returning what was tracked.
    pub fn clear(&self) -> Vec<String> {
        let mut set = self.lock();
        std::mem::take(&mut *set).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filter `candidates` down to the tracked ones, keeping first-seen order
    /// and dropping duplicates.
    pub fn intersect<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let set = self.lock();
        let mut seen = BTreeSet::new();
        candidates
            .into_iter()
            .filter(|c| set.contains(*c) && seen.insert(*c))
            .map(str::to_string)
            .collect()
    }
}

impl std::fmt::Debug for AddressRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressRegistry")
            .field("tracked", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let reg = AddressRegistry::new();
        assert!(reg.add("w1"));
        assert!(!reg.add("w1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn add_then_remove() {
        let reg = AddressRegistry::new();
        reg.add("w1");
        assert!(reg.remove("w1"));
        assert!(!reg.contains("w1"));
        assert!(!reg.remove("w1"));
        assert!(reg.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let reg = AddressRegistry::new();
        let other = reg.clone();
        reg.add("w1");
        assert!(other.contains("w1"));
    }

    #[test]
    fn clear_returns_previous_members() {
        let reg = AddressRegistry::new();
        reg.add("b");
        reg.add("a");
        assert_eq!(reg.clear(), vec!["a".to_string(), "b".to_string()]);
        assert!(reg.is_empty());
    }

    #[test]
    fn intersect_keeps_order_and_dedups() {
        let reg = AddressRegistry::new();
        reg.add("w1");
        reg.add("w2");
        let hits = reg.intersect(["x", "w2", "w1", "w2"]);
        assert_eq!(hits, vec!["w2".to_string(), "w1".to_string()]);
    }
}
