//! chainwatch-http — token metadata over the provider's REST API.

pub mod client;

pub use client::{HttpMetadataClient, MetadataClientConfig};
