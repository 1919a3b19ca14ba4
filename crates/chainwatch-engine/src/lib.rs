//! chainwatch-engine — the wallet monitoring engine.
//!
//! [`MonitorEngine`] wires the pieces from `chainwatch-core`, the metadata
//! client and the streaming connection into one control surface:
//!
//! ```text
//! add_wallet ─▶ AddressRegistry ─▶ ConnectionManager ─▶ provider
//!                                          │ frames
//!                                          ▼
//!                 FrameProcessor: normalize ─▶ dedup ─▶ EventDispatcher ─▶ callback
//! ```

pub mod engine;
pub mod processor;
pub mod telemetry;

pub use engine::{EngineStatus, MonitorEngine};
pub use processor::FrameProcessor;
pub use telemetry::init_tracing;
