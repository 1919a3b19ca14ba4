//! chainwatch-core — building blocks for the ChainWatch wallet monitor.
//!
//! # Overview
//!
//! ChainWatch keeps one long-lived streaming connection to a Solana data
//! provider, subscribed to a dynamic set of wallets, and turns pushed
//! transactions into canonical [`TransactionRecord`]s. This crate holds the
//! transport-free pieces:
//!
//! - [`AddressRegistry`]: the tracked wallet set
//! - [`CredentialPool`]: API key rotation with rate-limit cooldowns
//! - [`MessageNormalizer`]: raw payload → per-wallet records
//! - [`MetadataCache`] / [`MetadataResolver`]: bounded, single-flight token metadata
//! - [`EventDispatcher`]: single-slot callback delivery
//! - [`policy`] module: reconnect backoff
//! - [`protocol`] module: wire frames

pub mod address;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod metadata;
pub mod normalizer;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod types;

pub use address::is_valid_address;
pub use cache::{CacheConfig, MetadataCache};
pub use config::{EngineConfig, HeartbeatConfig, LogConfig};
pub use credentials::{
    ActiveCredential, CredentialHealth, CredentialPool, RotationConfig, RotationReason,
};
pub use dedup::SignatureWindow;
pub use dispatcher::{BoxError, DispatchOutcome, EventDispatcher, TransactionCallback};
pub use error::{ConnectionError, CredentialError, EngineError, MetadataError, PayloadError};
pub use metadata::{MetadataResolver, MetadataSource};
pub use normalizer::MessageNormalizer;
pub use policy::{ReconnectConfig, ReconnectPolicy};
pub use protocol::{parse_frame, ControlFrame, InboundFrame};
pub use registry::{AddressRegistry, RegistryDelta};
pub use types::{ConnectionState, Direction, TokenMetadata, TransactionRecord};
