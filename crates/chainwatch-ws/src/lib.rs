//! chainwatch-ws — the provider streaming connection.
//!
//! # Features
//! - One background task owns the WebSocket
//! - Explicit lifecycle: Disconnected → Connecting → Connected → Reconnecting → Terminated
//! - Capped exponential backoff, reset only after a stable session
//! - Heartbeat pings with stale-connection detection
//! - Full resubscribe from the registry snapshot on every connect
//! - Credential rotation when the handshake is rate limited

pub mod connection;

pub use connection::{ConnCommand, ConnectionConfig, ConnectionHandle, ConnectionManager};
