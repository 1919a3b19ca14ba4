//! Exponential reconnect backoff with a stability-window reset.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before the connection is terminated.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Cap on the delay between attempts.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor applied per consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// A Connected period at least this long resets the backoff.
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_initial_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_stability_window_secs() -> u64 { 30 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            stability_window_secs: default_stability_window_secs(),
        }
    }
}

impl ReconnectConfig {
    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }

    /// Delay before the `attempt`-th consecutive reconnect (1-based), ignoring
    /// the attempt limit.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = base_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Tracks consecutive failures for one connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Consecutive failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return the delay before the next attempt.
    ///
    /// Returns `None` once `max_attempts` consecutive failures have been
    /// recorded; the connection should terminate.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for(self.attempt))
    }

    /// Report how long the last Connected period lasted.
    ///
    /// Resets the backoff if it exceeded the stability window. A short blip
    /// keeps the accumulated backoff so a flapping provider is not hammered.
    pub fn record_connected(&mut self, uptime: Duration) -> bool {
        if uptime >= self.config.stability_window() {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
