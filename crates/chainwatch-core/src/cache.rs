//! Bounded token metadata cache.
//!
//! Entries expire `ttl` after insertion. When the cache is full, the least
//! recently used live entry is evicted. Expired entries are dropped when they
//! are touched and by [`MetadataCache::purge_expired`], which the engine calls
//! from a background sweep.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::TokenMetadata;

/// Cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval of the background expiry sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_entries() -> usize { 1_000 }
fn default_ttl_secs() -> u64 { 3_600 }
fn default_sweep_interval_secs() -> u64 { 300 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

struct CacheEntry {
    metadata: TokenMetadata,
    inserted_at: Instant,
}

/// Thread-safe TTL + LRU cache keyed by mint.
///
/// Map order is recency order: index 0 is the least recently used entry.
pub struct MetadataCache {
    max_entries: usize,
    ttl: Duration,
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl MetadataCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            ttl: config.ttl(),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, mint: &str) -> Option<TokenMetadata> {
        self.get_at(mint, Instant::now())
    }

    /// Insert or refresh an entry.
    pub fn put(&self, mint: impl Into<String>, metadata: TokenMetadata) {
        self.put_at(mint.into(), metadata, Instant::now());
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) >= self.ttl
    }

    fn get_at(&self, mint: &str, now: Instant) -> Option<TokenMetadata> {
        let mut entries = self.lock();
        let idx = entries.get_index_of(mint)?;
        if self.is_expired(&entries[idx], now) {
            entries.shift_remove_index(idx);
            return None;
        }
        let last = entries.len() - 1;
        entries.move_index(idx, last);
        Some(entries[last].metadata.clone())
    }

    fn put_at(&self, mint: String, metadata: TokenMetadata, now: Instant) {
        let mut entries = self.lock();
        entries.shift_remove(&mint);
        if entries.len() >= self.max_entries {
            // Prefer dropping dead entries over evicting a live one.
            entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        }
        while entries.len() >= self.max_entries {
            entries.shift_remove_index(0);
        }
        entries.insert(
            mint,
            CacheEntry {
                metadata,
                inserted_at: now,
            },
        );
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
        before - entries.len()
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish()
    }
}
