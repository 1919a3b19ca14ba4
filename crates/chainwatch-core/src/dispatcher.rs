//! Single-slot delivery of records to the external callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::types::TransactionRecord;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// External consumer of normalized records.
pub type TransactionCallback =
    Arc<dyn Fn(TransactionRecord) -> Result<(), BoxError> + Send + Sync>;

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The callback returned an error or panicked.
    Failed,
    /// No callback registered; the record was dropped.
    NoListener,
}

/// Delivers records to at most one registered callback.
///
/// Registering a callback replaces the previous one. Callback errors and
/// panics are caught and logged, so one bad record never stalls the records
/// behind it.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    slot: Arc<RwLock<Option<TransactionCallback>>>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`, replacing any previous one.
    /// Returns `true` if a previous callback was replaced.
    pub fn set_callback<F>(&self, callback: F) -> bool
    where
        F: Fn(TransactionRecord) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(Arc::new(callback)).is_some()
    }

    /// Remove the registered callback.
    pub fn clear(&self) {
        self.slot.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn has_listener(&self) -> bool {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn dispatch(&self, record: TransactionRecord) -> DispatchOutcome {
        // Clone the handle out so the callback runs without holding the lock.
        let callback = self.slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(callback) = callback else {
            tracing::debug!(wallet = %record.wallet, signature = %record.signature, "no listener, record dropped");
            return DispatchOutcome::NoListener;
        };

        let wallet = record.wallet.clone();
        let signature = record.signature.clone();
        match catch_unwind(AssertUnwindSafe(|| callback(record))) {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Delivered
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%wallet, %signature, error = %e, "transaction callback failed");
                DispatchOutcome::Failed
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%wallet, %signature, "transaction callback panicked");
                DispatchOutcome::Failed
            }
        }
    }

    /// Records successfully handed to the callback.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Records whose callback failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("has_listener", &self.has_listener())
            .field("delivered", &self.delivered())
            .field("failed", &self.failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use serde_json::Value;
    use std::sync::Mutex;

    fn record(sig: &str) -> TransactionRecord {
        TransactionRecord {
            wallet: "W1".into(),
            token: "X".into(),
            mint: None,
            buy_sell: Direction::Buy,
            amount: "+1 X".into(),
            signature: sig.into(),
            timestamp: chrono::Utc::now(),
            raw: Arc::new(Value::Null),
        }
    }

    #[test]
    fn no_listener() {
        let d = EventDispatcher::new();
        assert_eq!(d.dispatch(record("S1")), DispatchOutcome::NoListener);
    }

    #[test]
    fn new_callback_replaces_old() {
        let d = EventDispatcher::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&first);
        assert!(!d.set_callback(move |r| {
            sink.lock().unwrap().push(r.signature);
            Ok(())
        }));
        d.dispatch(record("S1"));

        let sink = Arc::clone(&second);
        assert!(d.set_callback(move |r| {
            sink.lock().unwrap().push(r.signature);
            Ok(())
        }));
        d.dispatch(record("S2"));

        assert_eq!(*first.lock().unwrap(), vec!["S1".to_string()]);
        assert_eq!(*second.lock().unwrap(), vec!["S2".to_string()]);
    }

    #[test]
    fn failure_does_not_block_next_record() {
        let d = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        d.set_callback(move |r| {
            if r.signature == "bad" {
                return Err("downstream rejected".into());
            }
            if r.signature == "boom" {
                panic!("callback bug");
            }
            sink.lock().unwrap().push(r.signature);
            Ok(())
        });

        assert_eq!(d.dispatch(record("bad")), DispatchOutcome::Failed);
        assert_eq!(d.dispatch(record("boom")), DispatchOutcome::Failed);
        assert_eq!(d.dispatch(record("good")), DispatchOutcome::Delivered);
        assert_eq!(*seen.lock().unwrap(), vec!["good".to_string()]);
        assert_eq!(d.failed(), 2);
        assert_eq!(d.delivered(), 1);
    }
}
