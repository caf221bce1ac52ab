//! Bridge error taxonomy.

use hookbridge_core::{EngineError, ScriptId, SessionId};
use serde::{Deserialize, Serialize};

/// Failure at the calling boundary.
///
/// Errors raised inside the target after a call was established are not
/// represented here; they travel as data in the call's outcome.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The engine refused the attach. Carries its diagnostic verbatim.
    #[error("{0}")]
    AttachFailure(String),
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Failed to inject script: {0}")]
    InjectionFailure(String),
    #[error("No active script in session {0}")]
    NoActiveScript(SessionId),
    #[error("Script {script_id} not found in session {session_id}")]
    ScriptNotFound {
        session_id: SessionId,
        script_id: ScriptId,
    },
    #[error("Export not found: {0}")]
    ExportNotFound(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Stable, wire-friendly error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AttachFailure,
    SessionNotFound,
    InjectionFailure,
    NoActiveScript,
    ScriptNotFound,
    ExportNotFound,
    DeviceNotFound,
    EngineError,
}

impl BridgeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AttachFailure(_) => ErrorCode::AttachFailure,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::InjectionFailure(_) => ErrorCode::InjectionFailure,
            Self::NoActiveScript(_) => ErrorCode::NoActiveScript,
            Self::ScriptNotFound { .. } => ErrorCode::ScriptNotFound,
            Self::ExportNotFound(_) => ErrorCode::ExportNotFound,
            Self::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Self::Engine(_) => ErrorCode::EngineError,
        }
    }
}
