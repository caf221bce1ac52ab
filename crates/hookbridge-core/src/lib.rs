//! Core abstractions for the instrumentation bridge.
//!
//! This crate provides the fundamental building blocks:
//! - Capability traits the engine is consumed through
//! - `ScriptEvent` - Raw engine events and their classification
//! - `EnvelopeBuilder` - Wraps caller code so it reports one receipt
//! - `MessageQueue` - Drainable per-session buffer of script output
//! - `BridgeConfig` - Timeouts, queue limits and device defaults
//! - A simulated engine (feature: sim)

pub mod config;
pub mod envelope;
pub mod message;
pub mod msg_queue;
pub mod traits;

#[cfg(feature = "sim")]
pub mod sim;

pub use config::{BridgeConfig, ConfigError, QueueLimits};
pub use envelope::EnvelopeBuilder;
pub use message::{EventKind, ExecutionReceipt, QueuedMessage, ReceiptError, ScriptEvent};
pub use msg_queue::{Drained, MessageQueue};
pub use traits::{
    Device, EngineError, EngineScript, EngineSession, ExportError, MessageHandler, Platform,
    ScriptId, SessionId,
};
