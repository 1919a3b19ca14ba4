//! Connection policies.
//!
//! ```text
//! failure → [ReconnectPolicy::next_delay] → sleep → reconnect
//! stable Connected period → [ReconnectPolicy::record_connected] → reset
//! ```

pub mod backoff;

pub use backoff::{ReconnectConfig, ReconnectPolicy};
