//! The monitoring engine control surface.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chainwatch_core::address::{is_valid_address, short};
use chainwatch_core::cache::MetadataCache;
use chainwatch_core::config::EngineConfig;
use chainwatch_core::credentials::{CredentialHealth, CredentialPool};
use chainwatch_core::dispatcher::{BoxError, EventDispatcher};
use chainwatch_core::error::EngineError;
use chainwatch_core::metadata::{MetadataResolver, MetadataSource};
use chainwatch_core::normalizer::MessageNormalizer;
use chainwatch_core::registry::{AddressRegistry, RegistryDelta};
use chainwatch_core::types::{ConnectionState, TransactionRecord};
use chainwatch_http::{HttpMetadataClient, MetadataClientConfig};
use chainwatch_ws::{ConnectionConfig, ConnectionHandle, ConnectionManager};

use crate::processor::FrameProcessor;

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub connected: bool,
    pub tracked_wallets: usize,
    pub state: ConnectionState,
    pub credentials: CredentialHealth,
    pub records_dispatched: u64,
    pub dispatch_failures: u64,
    pub cached_tokens: usize,
}

/// Background tasks of one `connect()` generation.
struct Running {
    connection: ConnectionHandle,
    processor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Real-time wallet transaction monitor.
///
/// Owns the tracked wallet set, the credential pool, the metadata cache and
/// the streaming connection. Every method is callable from any task; none
/// of them blocks on network I/O.
pub struct MonitorEngine {
    config: EngineConfig,
    registry: AddressRegistry,
    credentials: Arc<CredentialPool>,
    resolver: Arc<MetadataResolver>,
    dispatcher: EventDispatcher,
    processor: Arc<FrameProcessor>,
    running: Mutex<Option<Running>>,
}

impl MonitorEngine {
    /// Build an engine that resolves token metadata over the provider's REST API.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let credentials = Arc::new(CredentialPool::new(
            config.api_keys.clone(),
            config.rotation.clone(),
        )?);
        let source = HttpMetadataClient::new(
            MetadataClientConfig {
                url: config.metadata_url.clone(),
                request_timeout: config.metadata_timeout(),
            },
            Arc::clone(&credentials),
        );
        Ok(Self::assemble(config, credentials, Arc::new(source)))
    }

    /// Build an engine with a custom metadata source.
    pub fn with_metadata_source(
        config: EngineConfig,
        source: Arc<dyn MetadataSource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let credentials = Arc::new(CredentialPool::new(
            config.api_keys.clone(),
            config.rotation.clone(),
        )?);
        Ok(Self::assemble(config, credentials, source))
    }

    fn assemble(
        config: EngineConfig,
        credentials: Arc<CredentialPool>,
        source: Arc<dyn MetadataSource>,
    ) -> Self {
        let registry = AddressRegistry::new();
        let cache = Arc::new(MetadataCache::new(&config.cache));
        let resolver = Arc::new(MetadataResolver::new(cache, source));
        let dispatcher = EventDispatcher::new();
        let normalizer = MessageNormalizer::new(registry.clone(), Some(Arc::clone(&resolver)));
        let processor = Arc::new(FrameProcessor::new(
            normalizer,
            dispatcher.clone(),
            config.dedup_window,
        ));
        Self {
            config,
            registry,
            credentials,
            resolver,
            dispatcher,
            processor,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Start the streaming connection and background tasks.
    ///
    /// No-op while connecting or connected. After `Terminated` (or a
    /// previous `shutdown`) a fresh connection is started. Must be called
    /// from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), EngineError> {
        tokio::runtime::Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?;

        let mut running = self.running();
        if let Some(current) = running.as_ref() {
            let state = current.connection.state();
            if state.is_active() && !current.connection.is_finished() {
                tracing::debug!(%state, "connect ignored, already running");
                return Ok(());
            }
        }
        if let Some(stale) = running.take() {
            tracing::info!(state = %stale.connection.state(), "restarting connection");
            stale.sweeper.abort();
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            ConnectionConfig::from_engine(&self.config),
            Arc::clone(&self.credentials),
            self.registry.clone(),
            frames_tx,
        );
        let connection = connection.spawn();

        let processor = Arc::clone(&self.processor);
        let processor = tokio::spawn(async move { processor.run(frames_rx).await });
        let sweeper = tokio::spawn(sweep_cache(
            Arc::clone(self.resolver.cache()),
            self.config.cache.sweep_interval(),
        ));

        *running = Some(Running {
            connection,
            processor,
            sweeper,
        });
        tracing::info!(wallets = self.registry.len(), "engine connecting");
        Ok(())
    }

    /// Close the connection and stop background tasks.
    ///
    /// Frames already received are still processed before this returns.
    pub async fn shutdown(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        running.sweeper.abort();
        running.connection.shutdown().await;
        if let Err(e) = running.processor.await {
            tracing::warn!(error = %e, "frame processor ended abnormally");
        }
        tracing::info!("engine stopped");
    }

    // ─── Wallets ──────────────────────────────────────────────────────────────

    /// Pure format check; no network access.
    pub fn validate_wallet_address(&self, address: &str) -> bool {
        is_valid_address(address.trim())
    }

    /// Start tracking `address`. Returns `Ok(false)` if it was already tracked.
    pub fn add_wallet(&self, address: &str) -> Result<bool, EngineError> {
        let address = address.trim();
        if !is_valid_address(address) {
            return Err(EngineError::InvalidAddress(address.to_string()));
        }
        // Held across mutation and send so deltas reach the socket in call order.
        let running = self.running();
        if !self.registry.add(address) {
            return Ok(false);
        }
        tracing::info!(wallet = %short(address), tracked = self.registry.len(), "wallet added");
        send_delta(running.as_ref(), RegistryDelta::Added(vec![address.to_string()]));
        Ok(true)
    }

    /// Stop tracking `address`. Returns `false` if it was not tracked.
    ///
    /// Records already in flight for the address may still be dispatched.
    pub fn remove_wallet(&self, address: &str) -> bool {
        let address = address.trim();
        let running = self.running();
        if !self.registry.remove(address) {
            return false;
        }
        tracing::info!(wallet = %short(address), tracked = self.registry.len(), "wallet removed");
        send_delta(running.as_ref(), RegistryDelta::Removed(vec![address.to_string()]));
        true
    }

    /// Drop every tracked wallet. Returns the addresses that were removed.
    pub fn reset_wallets(&self) -> Vec<String> {
        let running = self.running();
        let removed = self.registry.clear();
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "tracked wallets reset");
            send_delta(running.as_ref(), RegistryDelta::Removed(removed.clone()));
        }
        removed
    }

    pub fn tracked_wallets(&self) -> Vec<String> {
        self.registry.snapshot()
    }

    // ─── Delivery ─────────────────────────────────────────────────────────────

    /// Register the record callback, replacing any previous one.
    /// Returns `true` if a previous callback was replaced.
    pub fn on_transaction<F>(&self, callback: F) -> bool
    where
        F: Fn(TransactionRecord) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.dispatcher.set_callback(callback)
    }

    /// Feed one raw frame through the pipeline as if it arrived on the
    /// stream. Returns how many records were dispatched.
    pub async fn ingest(&self, frame: &str) -> usize {
        self.processor.process_frame(frame).await
    }

    // ─── Introspection ────────────────────────────────────────────────────────

    pub fn status(&self) -> EngineStatus {
        let state = self
            .running()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |r| r.connection.state());
        EngineStatus {
            connected: state == ConnectionState::Connected,
            tracked_wallets: self.registry.len(),
            state,
            credentials: self.credentials.health(),
            records_dispatched: self.dispatcher.delivered(),
            dispatch_failures: self.dispatcher.failed(),
            cached_tokens: self.resolver.cache().len(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.sweeper.abort();
        }
    }
}

fn send_delta(running: Option<&Running>, delta: RegistryDelta) {
    let Some(running) = running else {
        tracing::debug!(count = delta.addresses().len(), "not connected, delta applies on connect");
        return;
    };
    let sent = match delta {
        RegistryDelta::Added(addresses) => running.connection.subscribe(addresses),
        RegistryDelta::Removed(addresses) => running.connection.unsubscribe(addresses),
    };
    if !sent {
        tracing::debug!("connection task stopped, delta applies on next connect");
    }
}

async fn sweep_cache(cache: Arc<MetadataCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, remaining = cache.len(), "expired metadata swept");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainwatch_core::error::MetadataError;
    use chainwatch_core::types::TokenMetadata;

    const W1: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    struct NoMetadata;

    #[async_trait]
    impl MetadataSource for NoMetadata {
        async fn fetch(&self, mint: &str) -> Result<TokenMetadata, MetadataError> {
            Err(MetadataError::Unavailable {
                mint: mint.into(),
                reason: "offline".into(),
            })
        }
    }

    fn engine() -> MonitorEngine {
        MonitorEngine::with_metadata_source(EngineConfig::with_keys(["k1"]), Arc::new(NoMetadata))
            .unwrap()
    }

    #[test]
    fn rejects_config_without_keys() {
        let err = MonitorEngine::with_metadata_source(EngineConfig::default(), Arc::new(NoMetadata));
        assert!(matches!(err, Err(EngineError::Config(_))));
    }

    #[test]
    fn add_remove_reset() {
        let e = engine();
        assert!(e.add_wallet(W1).unwrap());
        assert!(!e.add_wallet(&format!("  {W1} ")).unwrap());
        assert!(matches!(e.add_wallet("not-an-address"), Err(EngineError::InvalidAddress(_))));
        assert_eq!(e.status().tracked_wallets, 1);
        assert!(e.remove_wallet(W1));
        assert!(!e.remove_wallet(W1));
        e.add_wallet(W1).unwrap();
        assert_eq!(e.reset_wallets(), vec![W1.to_string()]);
        assert!(e.tracked_wallets().is_empty());
    }

    #[test]
    fn status_before_connect() {
        let s = engine().status();
        assert!(!s.connected);
        assert_eq!(s.state, ConnectionState::Disconnected);
        assert_eq!(s.credentials, CredentialHealth::Healthy);
        assert_eq!(s.records_dispatched, 0);
    }

    #[test]
    fn connect_outside_runtime_is_an_error() {
        assert!(matches!(engine().connect(), Err(EngineError::Runtime(_))));
    }

    #[test]
    fn status_serializes_camel_case() {
        let v = serde_json::to_value(engine().status()).unwrap();
        assert_eq!(v["trackedWallets"], 0);
        assert_eq!(v["state"], "disconnected");
        assert_eq!(v["credentials"], "healthy");
    }

    fn processor_task(e: &MonitorEngine) -> Option<tokio::task::Id> {
        e.running().as_ref().map(|r| r.processor.id())
    }

    #[tokio::test]
    async fn second_connect_keeps_running_tasks() {
        let mut config = EngineConfig::with_keys(["k1"]);
        config.ws_url = "ws://127.0.0.1:9/?api-key={api_key}".into();
        let e = MonitorEngine::with_metadata_source(config, Arc::new(NoMetadata)).unwrap();

        e.connect().unwrap();
        assert_eq!(e.status().state, ConnectionState::Connecting);
        let first = processor_task(&e).unwrap();
        e.connect().unwrap();
        assert_eq!(processor_task(&e), Some(first));

        e.shutdown().await;
        assert_eq!(e.status().state, ConnectionState::Disconnected);
        e.connect().unwrap();
        assert_ne!(processor_task(&e), Some(first));
        e.shutdown().await;
    }
}
