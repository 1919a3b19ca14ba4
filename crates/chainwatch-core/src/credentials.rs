//! Round-robin provider credential pool.
//!
//! Rotation triggers:
//! - `CallThreshold`: the active key served `calls_per_rotation` calls
//! - `Interval`:      the active key has been active for `rotation_interval`
//! - `RateLimited`:   the provider answered 429; the key cools down for `cooldown`
//!
//! When every key is cooling down, [`CredentialPool::active`] fails fast with
//! [`CredentialError::Exhausted`] instead of waiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

/// Rotation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Calls served by one key before proactively moving to the next.
    #[serde(default = "default_calls_per_rotation")]
    pub calls_per_rotation: u32,
    /// Wall-clock time one key stays active before proactively rotating.
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// How long a rate-limited key is skipped.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_calls_per_rotation() -> u32 { 100 }
fn default_rotation_interval_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 60 }

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            calls_per_rotation: default_calls_per_rotation(),
            rotation_interval_secs: default_rotation_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl RotationConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Why the pool advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    CallThreshold,
    Interval,
    RateLimited,
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallThreshold => write!(f, "call-threshold"),
            Self::Interval => write!(f, "interval"),
            Self::RateLimited => write!(f, "rate-limited"),
        }
    }
}

/// Aggregate credential health, reported through engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialHealth {
    /// No key is cooling down.
    Healthy,
    /// Some keys are cooling down, at least one is usable.
    Degraded,
    /// Every key is cooling down.
    Exhausted,
}

impl std::fmt::Display for CredentialHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// One provider key plus its usage bookkeeping.
#[derive(Clone)]
pub struct Credential {
    key: String,
    calls: u32,
    last_rotated: Instant,
    cooldown_until: Option<Instant>,
}

impl Credential {
    fn new(key: String, now: Instant) -> Self {
        Self {
            key,
            calls: 0,
            last_rotated: now,
            cooldown_until: None,
        }
    }

    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key", &redact(&self.key))
            .field("calls", &self.calls)
            .field("cooldown_until", &self.cooldown_until)
            .finish()
    }
}

/// The credential a caller should use right now.
#[derive(Clone, PartialEq, Eq)]
pub struct ActiveCredential {
    /// Position in the pool; pass back to [`CredentialPool::report_rate_limited`].
    pub index: usize,
    pub key: String,
}

impl std::fmt::Debug for ActiveCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCredential")
            .field("index", &self.index)
            .field("key", &redact(&self.key))
            .finish()
    }
}

/// Keep the first four characters of a key for log correlation.
pub fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}***")
}

struct PoolInner {
    credentials: Vec<Credential>,
    active: usize,
}

/// Thread-safe round-robin credential pool.
///
/// Both the metadata client and the connection manager draw from the same
/// pool. Every rotation reads the current state first, so redundant rotation
/// requests for the same key advance the pool only once.
pub struct CredentialPool {
    config: RotationConfig,
    inner: Mutex<PoolInner>,
}

impl CredentialPool {
    /// Build a pool from raw keys. Blank keys are ignored.
    pub fn new(
        keys: impl IntoIterator<Item = impl Into<String>>,
        config: RotationConfig,
    ) -> Result<Self, CredentialError> {
        let now = Instant::now();
        let credentials: Vec<Credential> = keys
            .into_iter()
            .map(Into::into)
            .map(|k: String| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| Credential::new(k, now))
            .collect();
        if credentials.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                credentials,
                active: 0,
            }),
        })
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    /// Returns `true` if the pool has no keys (never true for a built pool).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The credential to use for the next provider call.
    pub fn active(&self) -> Result<ActiveCredential, CredentialError> {
        self.active_at(Instant::now())
    }

    /// Count one provider call against the active key.
    pub fn record_call(&self) {
        self.record_call_at(Instant::now());
    }

    /// Advance to the next usable key.
    pub fn rotate(&self, reason: RotationReason) -> Result<ActiveCredential, CredentialError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let from = inner.active;
        self.advance(&mut inner, from, reason, now)
    }

    /// The provider rate-limited the call made with `used`.
    ///
    /// Cools `used` down and advances if it is still the active key. If some
    /// other call site already rotated away from it, this only marks it cooling.
    pub fn report_rate_limited(
        &self,
        used: &ActiveCredential,
    ) -> Result<ActiveCredential, CredentialError> {
        self.report_rate_limited_at(used, Instant::now())
    }

    /// Aggregate health for status reporting.
    pub fn health(&self) -> CredentialHealth {
        self.health_at(Instant::now())
    }

    // ─── Clock-explicit variants ─────────────────────────────────────────────

    fn active_at(&self, now: Instant) -> Result<ActiveCredential, CredentialError> {
        let mut inner = self.lock();
        let current = inner.active;
        let cred = &inner.credentials[current];
        if cred.is_cooling(now) {
            return self.advance(&mut inner, current, RotationReason::RateLimited, now);
        }
        if now.duration_since(cred.last_rotated) >= self.config.rotation_interval() {
            return self.advance(&mut inner, current, RotationReason::Interval, now);
        }
        Ok(ActiveCredential {
            index: current,
            key: cred.key.clone(),
        })
    }

    fn record_call_at(&self, now: Instant) {
        let mut inner = self.lock();
        let current = inner.active;
        inner.credentials[current].calls += 1;
        if inner.credentials[current].calls >= self.config.calls_per_rotation.max(1) {
            if let Err(e) = self.advance(&mut inner, current, RotationReason::CallThreshold, now) {
                tracing::warn!(error = %e, "credential rotation after call threshold failed");
            }
        }
    }

    fn report_rate_limited_at(
        &self,
        used: &ActiveCredential,
        now: Instant,
    ) -> Result<ActiveCredential, CredentialError> {
        let mut inner = self.lock();
        if used.index >= inner.credentials.len() {
            let current = inner.active;
            return self.advance(&mut inner, current, RotationReason::RateLimited, now);
        }
        let cred = &mut inner.credentials[used.index];
        cred.cooldown_until = Some(now + self.config.cooldown());
        tracing::warn!(
            key = %redact(&cred.key),
            cooldown_secs = self.config.cooldown_secs,
            "credential rate limited, cooling down"
        );
        let current = inner.active;
        if current == used.index {
            self.advance(&mut inner, current, RotationReason::RateLimited, now)
        } else {
            drop(inner);
            self.active_at(now)
        }
    }

    fn health_at(&self, now: Instant) -> CredentialHealth {
        let inner = self.lock();
        let cooling = inner
            .credentials
            .iter()
            .filter(|c| c.is_cooling(now))
            .count();
        match cooling {
            0 => CredentialHealth::Healthy,
            n if n == inner.credentials.len() => CredentialHealth::Exhausted,
            _ => CredentialHealth::Degraded,
        }
    }

    /// Move from `from` to the next key that is not cooling down.
    fn advance(
        &self,
        inner: &mut PoolInner,
        from: usize,
        reason: RotationReason,
        now: Instant,
    ) -> Result<ActiveCredential, CredentialError> {
        let len = inner.credentials.len();
        if reason == RotationReason::RateLimited && !inner.credentials[from].is_cooling(now) {
            inner.credentials[from].cooldown_until = Some(now + self.config.cooldown());
        }
        for step in 1..=len {
            let idx = (from + step) % len;
            let cred = &mut inner.credentials[idx];
            if cred.is_cooling(now) {
                continue;
            }
            cred.calls = 0;
            cred.last_rotated = now;
            cred.cooldown_until = None;
            inner.active = idx;
            if idx != from {
                tracing::debug!(from, to = idx, %reason, "rotated provider credential");
            }
            return Ok(ActiveCredential {
                index: idx,
                key: inner.credentials[idx].key.clone(),
            });
        }

        let retry_in = inner
            .credentials
            .iter()
            .filter_map(|c| c.cooldown_until)
            .map(|until| until.saturating_duration_since(now))
            .min()
            .unwrap_or(Duration::ZERO);
        Err(CredentialError::Exhausted { retry_in })
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CredentialPool")
            .field("credentials", &inner.credentials)
            .field("active", &inner.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: &[&str], threshold: u32) -> CredentialPool {
        CredentialPool::new(
            keys.iter().copied(),
            RotationConfig {
                calls_per_rotation: threshold,
                rotation_interval_secs: 3_600,
                cooldown_secs: 60,
            },
        )
        .unwrap()
    }

    #[test]
    fn empty_pool_rejected() {
        let err = CredentialPool::new(Vec::<String>::new(), RotationConfig::default()).unwrap_err();
        assert_eq!(err, CredentialError::Empty);
        let err = CredentialPool::new(["  ", ""], RotationConfig::default()).unwrap_err();
        assert_eq!(err, CredentialError::Empty);
    }

    #[test]
    fn round_robin_by_call_threshold() {
        let p = pool(&["k0", "k1", "k2"], 4);
        let mut used = Vec::new();
        for _ in 0..(4 * 3) {
            used.push(p.active().unwrap().key);
            p.record_call();
        }
        let expected: Vec<String> = ["k0", "k1", "k2"]
            .iter()
            .flat_map(|k| std::iter::repeat(k.to_string()).take(4))
            .collect();
        assert_eq!(used, expected);
        // Wrapped back to the first key
        assert_eq!(p.active().unwrap().key, "k0");
    }

    #[test]
    fn interval_rotation() {
        let p = pool(&["k0", "k1"], 100);
        let later = Instant::now() + Duration::from_secs(3_601);
        assert_eq!(p.active_at(later).unwrap().key, "k1");
    }

    #[test]
    fn rate_limit_skips_cooling_keys() {
        let p = pool(&["k0", "k1", "k2"], 100);
        let k0 = p.active().unwrap();
        let next = p.report_rate_limited(&k0).unwrap();
        assert_eq!(next.key, "k1");
        let next = p.report_rate_limited(&next).unwrap();
        assert_eq!(next.key, "k2");
        // k0 and k1 are cooling, so the threshold rotation lands back on k2
        for _ in 0..100 {
            p.record_call();
        }
        assert_eq!(p.active().unwrap().key, "k2");
        assert_eq!(p.health(), CredentialHealth::Degraded);
    }

    #[test]
    fn redundant_rate_limit_reports_advance_once() {
        let p = pool(&["k0", "k1", "k2"], 100);
        let k0 = p.active().unwrap();
        assert_eq!(p.report_rate_limited(&k0).unwrap().key, "k1");
        // Second call site saw the same 429 on k0
        assert_eq!(p.report_rate_limited(&k0).unwrap().key, "k1");
    }

    #[test]
    fn all_cooling_fails_fast() {
        let p = pool(&["k0", "k1"], 100);
        let k0 = p.active().unwrap();
        let k1 = p.report_rate_limited(&k0).unwrap();
        let err = p.report_rate_limited(&k1).unwrap_err();
        assert!(matches!(err, CredentialError::Exhausted { .. }));
        assert!(p.active().is_err());
        assert_eq!(p.health(), CredentialHealth::Exhausted);
    }

    #[test]
    fn cooldown_expires() {
        let p = pool(&["k0"], 100);
        let k0 = p.active().unwrap();
        assert!(p.report_rate_limited(&k0).is_err());
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(p.active_at(later).unwrap().key, "k0");
        assert_eq!(p.health_at(later), CredentialHealth::Healthy);
    }

    #[test]
    fn debug_redacts_keys() {
        let p = pool(&["secret-key-123"], 100);
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("secret-key-123"));
        assert!(dbg.contains("secr***"));
    }
}
