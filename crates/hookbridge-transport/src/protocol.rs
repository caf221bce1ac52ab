//! Wire protocol for client-server communication.

use bytes::Bytes;
use hookbridge_core::{ScriptId, SessionId, message::base64_bytes};
use hookbridge_session::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// One operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListDevices,
    GetDevice {
        #[serde(default)]
        device_id: Option<String>,
    },
    EnumerateProcesses {
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Case-insensitive substring match; the first hit wins.
    GetProcessByName {
        name: String,
        #[serde(default)]
        device_id: Option<String>,
    },
    EnumerateApplications {
        #[serde(default)]
        device_id: Option<String>,
    },
    GetFrontmostApplication {
        #[serde(default)]
        device_id: Option<String>,
    },
    /// Spawn suspended.
    SpawnProcess {
        program: String,
        #[serde(default)]
        argv: Vec<String>,
        #[serde(default)]
        device_id: Option<String>,
    },
    ResumeProcess {
        pid: u32,
        #[serde(default)]
        device_id: Option<String>,
    },
    KillProcess {
        pid: u32,
        #[serde(default)]
        device_id: Option<String>,
    },
    CreateSession {
        pid: u32,
        #[serde(default)]
        device_id: Option<String>,
    },
    ListSessions,
    DetachSession {
        session_id: SessionId,
    },
    ExecuteCode {
        session_id: SessionId,
        code: String,
        #[serde(default)]
        keep_alive: bool,
        /// Overrides the configured execution timeout. `0` waits for the
        /// receipt without a deadline, matching a zero configured timeout.
        #[serde(default)]
        timeout_ms: Option<u64>,
        /// Overrides the configured console methods to capture. An empty
        /// list leaves the console alone.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_methods: Option<Vec<String>>,
    },
    /// Drains the session's message queue.
    GetMessages {
        session_id: SessionId,
    },
    CallExport {
        session_id: SessionId,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        script_id: Option<ScriptId>,
    },
    PostMessage {
        session_id: SessionId,
        message: Value,
        /// Binary attachment (base64 encoded).
        #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
        data: Option<Bytes>,
        #[serde(default)]
        script_id: Option<ScriptId>,
    },
    ListScripts {
        session_id: SessionId,
    },
    UnloadScript {
        session_id: SessionId,
        script_id: ScriptId,
    },
}

impl Request {
    /// Operation name as it appears on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ListDevices => "list_devices",
            Self::GetDevice { .. } => "get_device",
            Self::EnumerateProcesses { .. } => "enumerate_processes",
            Self::GetProcessByName { .. } => "get_process_by_name",
            Self::EnumerateApplications { .. } => "enumerate_applications",
            Self::GetFrontmostApplication { .. } => "get_frontmost_application",
            Self::SpawnProcess { .. } => "spawn_process",
            Self::ResumeProcess { .. } => "resume_process",
            Self::KillProcess { .. } => "kill_process",
            Self::CreateSession { .. } => "create_session",
            Self::ListSessions => "list_sessions",
            Self::DetachSession { .. } => "detach_session",
            Self::ExecuteCode { .. } => "execute_code",
            Self::GetMessages { .. } => "get_messages",
            Self::CallExport { .. } => "call_export",
            Self::PostMessage { .. } => "post_message",
            Self::ListScripts { .. } => "list_scripts",
            Self::UnloadScript { .. } => "unload_script",
        }
    }
}

/// Self-describing result of one operation.
///
/// `is_error` is set only for failures at the calling boundary. Errors raised
/// inside the target are reported in `body` with `is_error: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub is_error: bool,
    pub body: Value,
}

impl OperationResponse {
    /// Successful response. Object bodies get `"status": "success"` unless
    /// they already carry a status.
    #[must_use]
    pub fn success(body: Value) -> Self {
        let body = match body {
            Value::Object(mut fields) => {
                fields.entry("status").or_insert_with(|| json!("success"));
                Value::Object(fields)
            }
            other => {
                let mut fields = Map::new();
                fields.insert("status".into(), json!("success"));
                fields.insert("result".into(), other);
                Value::Object(fields)
            }
        };
        Self { is_error: false, body }
    }

    /// Response carrying an outcome as data, whatever its status.
    ///
    /// # Errors
    /// Returns error if the outcome does not serialize.
    pub fn outcome<T: Serialize>(outcome: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            is_error: false,
            body: serde_json::to_value(outcome)?,
        })
    }

    /// Boundary failure.
    #[must_use]
    pub fn failure(error: &BridgeError) -> Self {
        Self {
            is_error: true,
            body: json!({
                "status": "error",
                "code": error.code(),
                "error": error.to_string(),
            }),
        }
    }

    /// Failure of the transport itself, such as a malformed request.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            body: json!({
                "status": "error",
                "code": "invalid_request",
                "error": message.into(),
            }),
        }
    }

    /// The body's `status` field.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.body.get("status").and_then(Value::as_str)
    }
}

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run one operation. `id` is echoed back in the result.
    Call { id: String, request: Request },
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of a call.
    Result {
        id: String,
        #[serde(flatten)]
        response: OperationResponse,
    },
    /// Frame that could not be handled.
    Error { message: String },
    /// Pong response.
    Pong,
}
