//! Session lifecycle and script execution.
//!
//! This crate provides:
//! - `SessionRegistry` - Attach, lookup and teardown of sessions
//! - `ExecutionBridge` - One-shot and keep-alive code execution
//! - `RpcInvoker` - Export calls and message posting to persistent scripts

pub mod bridge;
pub mod error;
pub mod outcome;
pub mod registry;
pub mod rpc;
pub mod script;

pub use bridge::{ExecuteOptions, ExecutionBridge};
pub use error::{BridgeError, ErrorCode};
pub use outcome::{ExecutionOutcome, RpcOutcome, Status};
pub use registry::{Session, SessionInfo, SessionRegistry};
pub use rpc::RpcInvoker;
pub use script::{ScriptHandle, ScriptState, ScriptSummary};
