//! Per-wallet signature deduplication over a sliding window.

use std::collections::{HashSet, VecDeque};

/// Remembers the last `capacity` (wallet, signature) pairs.
///
/// The provider may push the same transaction more than once (retries,
/// overlapping subscriptions after a reconnect). A pair already in the window
/// is reported as a duplicate.
pub struct SignatureWindow {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl SignatureWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record the pair. Returns `false` if it was already in the window.
    pub fn insert(&mut self, wallet: &str, signature: &str) -> bool {
        let key = (wallet.to_string(), signature.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_pair_rejected() {
        let mut w = SignatureWindow::new(10);
        assert!(w.insert("W1", "S1"));
        assert!(!w.insert("W1", "S1"));
    }

    #[test]
    fn same_signature_other_wallet_allowed() {
        let mut w = SignatureWindow::new(10);
        assert!(w.insert("W1", "S1"));
        assert!(w.insert("W2", "S1"));
    }

    #[test]
    fn window_is_bounded() {
        let mut w = SignatureWindow::new(2);
        w.insert("W1", "S1");
        w.insert("W1", "S2");
        w.insert("W1", "S3");
        assert_eq!(w.len(), 2);
        // S1 fell out of the window
        assert!(w.insert("W1", "S1"));
        assert!(!w.insert("W1", "S3"));
    }
}
