//! Transport layer for automated callers.
//!
//! Provides:
//! - Wire protocol (JSON, binary payloads as base64)
//! - `Dispatcher` - Runs requests against the platform and session layer
//! - HTTP/WebSocket transport (feature: websocket)

pub mod dispatch;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use dispatch::Dispatcher;
pub use protocol::{ClientMessage, OperationResponse, Request, ServerMessage};
