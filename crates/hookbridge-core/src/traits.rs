//! Capability traits for the instrumentation engine.
//!
//! The engine itself (device discovery, process control, code injection) is an
//! external collaborator. Everything the bridge needs from it goes through the
//! narrow interfaces in this module.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::ScriptEvent;

/// Session identifier.
pub type SessionId = Uuid;

/// Script identifier, unique within one session.
pub type ScriptId = u32;

/// Callback invoked by the engine for every event a script emits.
///
/// The engine calls it in emission order, one event at a time.
pub type MessageHandler = Arc<dyn Fn(ScriptEvent) + Send + Sync>;

/// How a device is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The host the bridge runs on.
    Local,
    /// A device reachable over USB.
    Usb,
    /// A device reachable over the network.
    Remote,
}

/// Device description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}

/// Running process description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Installed application description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub identifier: String,
    pub name: String,
    /// Set when the application is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Why an attach handle went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The bridge asked for the detach.
    ApplicationRequested,
    /// The target process exited.
    ProcessTerminated,
    /// The target process replaced its image (exec).
    ProcessReplaced,
    /// The connection to the device broke.
    ConnectionTerminated,
    /// The device disappeared.
    DeviceLost,
}

/// Engine error.
///
/// Every variant displays the engine's own diagnostic unchanged so callers can
/// forward it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("{0}")]
    NotSupported(String),
    #[error("{0}")]
    Failed(String),
}

/// Outcome of calling an exported function that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// The script never registered an export with this name.
    #[error("Export not found: {0}")]
    NotFound(String),
    /// The export ran and threw.
    #[error("{0}")]
    Raised(String),
    /// The call could not be delivered.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Entry point into the engine.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Enumerate all devices the engine can see.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, EngineError>;

    /// Look up a device by id.
    async fn get_device(&self, id: &str) -> Result<Arc<dyn Device>, EngineError>;
}

/// One device and its process-level primitives.
#[async_trait]
pub trait Device: Send + Sync {
    fn info(&self) -> DeviceInfo;

    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>, EngineError>;

    async fn enumerate_applications(&self) -> Result<Vec<ApplicationInfo>, EngineError>;

    async fn frontmost_application(&self) -> Result<Option<ApplicationInfo>, EngineError>;

    /// Spawn a program suspended and return its pid.
    async fn spawn(&self, program: &str, argv: &[String]) -> Result<u32, EngineError>;

    async fn resume(&self, pid: u32) -> Result<(), EngineError>;

    async fn kill(&self, pid: u32) -> Result<(), EngineError>;

    /// Attach to a running process.
    async fn attach(&self, pid: u32) -> Result<Arc<dyn EngineSession>, EngineError>;
}

/// An attach handle to one target process.
#[async_trait]
pub trait EngineSession: Send + Sync {
    fn pid(&self) -> u32;

    /// Compile a script unit. The script is not running until `load` is called.
    async fn create_script(&self, source: &str) -> Result<Arc<dyn EngineScript>, EngineError>;

    async fn detach(&self) -> Result<(), EngineError>;

    fn is_detached(&self) -> bool;

    /// Resolves once the attach handle is gone.
    ///
    /// Resolves immediately when detachment already happened.
    async fn detached(&self) -> DetachReason;
}

/// One compiled unit of injected code.
#[async_trait]
pub trait EngineScript: Send + Sync {
    /// Install the event handler, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);

    async fn load(&self) -> Result<(), EngineError>;

    async fn unload(&self) -> Result<(), EngineError>;

    /// Deliver a message to the script's inbox.
    async fn post(&self, message: Value, data: Option<Bytes>) -> Result<(), EngineError>;

    /// Invoke a function the script registered as an RPC export.
    async fn call_export(&self, name: &str, args: Vec<Value>) -> Result<Value, ExportError>;
}
