//! Token metadata lookup with single-flight coalescing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::cache::MetadataCache;
use crate::error::MetadataError;
use crate::types::TokenMetadata;

/// Source of token metadata, usually the provider's REST API.
#[async_trait]
pub trait MetadataSource: Send + Sync + 'static {
    /// Fetch metadata for a single mint.
    async fn fetch(&self, mint: &str) -> Result<TokenMetadata, MetadataError>;

    /// Identifier used in logs.
    fn name(&self) -> &str {
        "metadata"
    }
}

type InflightFetch = Shared<BoxFuture<'static, Result<TokenMetadata, MetadataError>>>;

/// Cache-first resolver.
///
/// A miss starts exactly one fetch per mint; concurrent lookups for the same
/// mint wait on that fetch instead of issuing their own.
pub struct MetadataResolver {
    cache: Arc<MetadataCache>,
    source: Arc<dyn MetadataSource>,
    inflight: Mutex<HashMap<String, InflightFetch>>,
    fetches: Arc<AtomicU64>,
}

impl MetadataResolver {
    pub fn new(cache: Arc<MetadataCache>, source: Arc<dyn MetadataSource>) -> Self {
        Self {
            cache,
            source,
            inflight: Mutex::new(HashMap::new()),
            fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Number of fetches actually sent to the source.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InflightFetch>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve metadata for `mint`, from cache if possible.
    pub async fn resolve(&self, mint: &str) -> Result<TokenMetadata, MetadataError> {
        if let Some(hit) = self.cache.get(mint) {
            return Ok(hit);
        }

        let fetch = {
            let mut inflight = self.inflight();
            match inflight.get(mint) {
                Some(existing) => existing.clone(),
                None => {
                    let source = Arc::clone(&self.source);
                    let fetches = Arc::clone(&self.fetches);
                    let owned = mint.to_string();
                    let fut = async move {
                        fetches.fetch_add(1, Ordering::Relaxed);
                        source.fetch(&owned).await
                    }
                    .boxed()
                    .shared();
                    inflight.insert(mint.to_string(), fut.clone());
                    fut
                }
            }
        };

        let result = fetch.clone().await;

        if let Ok(meta) = &result {
            self.cache.put(mint, meta.clone());
        }
        {
            let mut inflight = self.inflight();
            if inflight.get(mint).is_some_and(|f| f.ptr_eq(&fetch)) {
                inflight.remove(mint);
            }
        }
        if let Err(e) = &result {
            tracing::debug!(mint, source = self.source.name(), error = %e, "metadata lookup failed");
        }
        result
    }
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("source", &self.source.name())
            .field("cache", &self.cache)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::time::Duration;

    struct SlowSource {
        fail: bool,
    }

    #[async_trait]
    impl MetadataSource for SlowSource {
        async fn fetch(&self, mint: &str) -> Result<TokenMetadata, MetadataError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(MetadataError::Unavailable {
                    mint: mint.to_string(),
                    reason: "mock".into(),
                });
            }
            Ok(TokenMetadata {
                symbol: format!("SYM-{mint}"),
                decimals: 9,
            })
        }
    }

    fn resolver(fail: bool) -> MetadataResolver {
        MetadataResolver::new(
            Arc::new(MetadataCache::new(&CacheConfig::default())),
            Arc::new(SlowSource { fail }),
        )
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce() {
        let r = resolver(false);
        let results = futures::future::join_all((0..8).map(|_| r.resolve("mintA"))).await;
        assert!(results.iter().all(|res| res.as_ref().unwrap().symbol == "SYM-mintA"));
        assert_eq!(r.fetch_count(), 1);
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let r = resolver(false);
        r.resolve("mintA").await.unwrap();
        r.resolve("mintA").await.unwrap();
        assert_eq!(r.fetch_count(), 1);
        assert_eq!(r.cache().len(), 1);
    }

    #[tokio::test]
    async fn distinct_mints_fetch_separately() {
        let r = resolver(false);
        let (a, b) = tokio::join!(r.resolve("mintA"), r.resolve("mintB"));
        assert_eq!(a.unwrap().symbol, "SYM-mintA");
        assert_eq!(b.unwrap().symbol, "SYM-mintB");
        assert_eq!(r.fetch_count(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let r = resolver(true);
        assert!(r.resolve("mintA").await.is_err());
        assert!(r.resolve("mintA").await.is_err());
        assert_eq!(r.fetch_count(), 2);
        assert!(r.cache().is_empty());
    }
}
