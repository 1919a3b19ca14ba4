//! Error types for the monitoring engine.
//!
//! Every error here is contained by the component that detects it. None of
//! them is process-fatal.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the streaming connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The WebSocket handshake was rejected or failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The provider rejected the handshake with a rate-limit response.
    #[error("Handshake rate limited by provider")]
    RateLimited,

    /// The handshake did not complete in time.
    #[error("Handshake timed out after {ms}ms")]
    HandshakeTimeout { ms: u64 },

    /// No data or pong was observed within the heartbeat window.
    #[error("Connection stale: no data for {ms}ms")]
    Stale { ms: u64 },

    /// Send/receive error on an established connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider closed the connection.
    #[error("Connection closed by provider")]
    Closed,

    /// No credential could be used to authenticate.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ConnectionError {
    /// Returns `true` if the active credential should be rotated before retrying.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Errors from the credential pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// The pool was configured without any keys.
    #[error("No provider credentials configured")]
    Empty,

    /// Every credential is cooling down after a rate-limit signal.
    #[error("All credentials exhausted, next recovers in {}ms", .retry_in.as_millis())]
    Exhausted { retry_in: Duration },
}

/// Errors produced while parsing an inbound provider frame.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The frame is not valid JSON.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame is JSON but does not have a recognised shape.
    #[error("Unrecognised payload shape: {0}")]
    Unrecognised(String),
}

/// Errors from token metadata resolution.
///
/// `Clone` so a single in-flight fetch can hand its outcome to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata unavailable for {mint}: {reason}")]
    Unavailable { mint: String, reason: String },

    #[error("Metadata request rate limited")]
    RateLimited,

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl MetadataError {
    /// Returns `true` if the provider signalled rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Errors surfaced through the engine control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Address failed the format check; no network call was made.
    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Background tasks need a Tokio runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
