//! Engine configuration.
//!
//! Loaded from JSON, then overlaid with environment variables:
//! - `CHAINWATCH_API_KEYS`     comma-separated provider keys
//! - `CHAINWATCH_WS_URL`       streaming endpoint (`{api_key}` placeholder)
//! - `CHAINWATCH_METADATA_URL` token metadata endpoint

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::credentials::RotationConfig;
use crate::error::EngineError;
use crate::policy::ReconnectConfig;

pub const ENV_API_KEYS: &str = "CHAINWATCH_API_KEYS";
pub const ENV_WS_URL: &str = "CHAINWATCH_WS_URL";
pub const ENV_METADATA_URL: &str = "CHAINWATCH_METADATA_URL";

/// Placeholder substituted with the active key in `ws_url`.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

/// Heartbeat and handshake timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between WebSocket pings.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// No inbound data for this long marks the connection stale.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Maximum time for the WebSocket handshake.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_ping_interval_secs() -> u64 { 15 }
fn default_stale_timeout_secs() -> u64 { 45 }
fn default_handshake_timeout_secs() -> u64 { 10 }

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: crate name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider API keys, rotated round-robin.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Streaming endpoint; `{api_key}` is replaced with the active key.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Token metadata REST endpoint.
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    /// Timeout for one metadata request.
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// (wallet, signature) pairs remembered for deduplication.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_ws_url() -> String {
    "wss://atlas-mainnet.helius-rpc.com/?api-key={api_key}".into()
}
fn default_metadata_url() -> String {
    "https://api.helius.xyz/v0/token-metadata".into()
}
fn default_metadata_timeout_secs() -> u64 { 10 }
fn default_dedup_window() -> usize { 10_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            ws_url: default_ws_url(),
            metadata_url: default_metadata_url(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            rotation: RotationConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cache: CacheConfig::default(),
            dedup_window: default_dedup_window(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config with the given keys and every other field defaulted.
    pub fn with_keys(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            api_keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(keys) = get(ENV_API_KEYS) {
            let keys: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !keys.is_empty() {
                self.api_keys = keys;
            }
        }
        if let Some(url) = get(ENV_WS_URL).filter(|u| !u.trim().is_empty()) {
            self.ws_url = url;
        }
        if let Some(url) = get(ENV_METADATA_URL).filter(|u| !u.trim().is_empty()) {
            self.metadata_url = url;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(EngineError::Config("at least one API key is required".into()));
        }
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(EngineError::Config(format!(
                "ws_url must be a ws:// or wss:// URL, got '{}'",
                self.ws_url
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(EngineError::Config("cache.max_entries must be > 0".into()));
        }
        if self.rotation.calls_per_rotation == 0 {
            return Err(EngineError::Config("rotation.calls_per_rotation must be > 0".into()));
        }
        if self.dedup_window == 0 {
            return Err(EngineError::Config("dedup_window must be > 0".into()));
        }
        if self.heartbeat.stale_timeout_secs <= self.heartbeat.ping_interval_secs {
            return Err(EngineError::Config(
                "heartbeat.stale_timeout_secs must exceed ping_interval_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let cfg = EngineConfig::from_json_str(r#"{"api_keys":["k1"]}"#).unwrap();
        assert_eq!(cfg.rotation.calls_per_rotation, 100);
        assert_eq!(cfg.reconnect.max_attempts, 10);
        assert_eq!(cfg.cache.max_entries, 1_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn nested_overrides() {
        let cfg = EngineConfig::from_json_str(
            r#"{"api_keys":["k1"],"reconnect":{"max_attempts":3},"cache":{"ttl_secs":5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 1_000);
        assert_eq!(cfg.cache.ttl_secs, 5);
        assert_eq!(cfg.cache.max_entries, 1_000);
    }

    #[test]
    fn env_overlay() {
        let mut cfg = EngineConfig::default();
        cfg.apply_vars(|name| match name {
            ENV_API_KEYS => Some(" a , b,,c ".into()),
            ENV_WS_URL => Some("wss://example.test/?key={api_key}".into()),
            _ => None,
        });
        assert_eq!(cfg.api_keys, vec!["a", "b", "c"]);
        assert_eq!(cfg.ws_url, "wss://example.test/?key={api_key}");
    }

    #[test]
    fn validation_errors() {
        assert!(EngineConfig::default().validate().is_err());
        let mut cfg = EngineConfig::with_keys(["k"]);
        cfg.ws_url = "https://nope".into();
        assert!(cfg.validate().is_err());
        let mut cfg = EngineConfig::with_keys(["k"]);
        cfg.heartbeat.stale_timeout_secs = cfg.heartbeat.ping_interval_secs;
        assert!(cfg.validate().is_err());
    }
}
