//! Result shapes returned to callers.

use hookbridge_core::{ExecutionReceipt, ScriptId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome status of a call that reached the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    /// No receipt arrived within the configured execution timeout.
    Timeout,
}

/// Outcome of executing code in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: Status,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    /// Set when the script stayed loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_id: Option<ScriptId>,
}

impl ExecutionOutcome {
    /// Build from the envelope's receipt. `status` follows the presence of `error`.
    #[must_use]
    pub fn from_receipt(receipt: ExecutionReceipt) -> Self {
        let (status, error, stack) = match receipt.error {
            Some(e) => (Status::Error, Some(e.message), e.stack),
            None => (Status::Success, None, None),
        };
        Self {
            status,
            result: receipt.result,
            error,
            stack,
            logs: receipt.logs,
            script_id: None,
        }
    }

    /// Build from an engine-level error raised before any receipt.
    #[must_use]
    pub const fn fatal(description: String, stack: Option<String>) -> Self {
        Self {
            status: Status::Error,
            result: Value::Null,
            error: Some(description),
            stack,
            logs: Vec::new(),
            script_id: None,
        }
    }

    #[must_use]
    pub fn timeout(after_ms: u128) -> Self {
        Self {
            status: Status::Timeout,
            result: Value::Null,
            error: Some(format!("no execution receipt within {after_ms} ms")),
            stack: None,
            logs: Vec::new(),
            script_id: None,
        }
    }
}

/// Outcome of calling an exported function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcOutcome {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcOutcome {
    #[must_use]
    pub const fn success(result: Value) -> Self {
        Self {
            status: Status::Success,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub const fn error(description: String) -> Self {
        Self {
            status: Status::Error,
            result: None,
            error: Some(description),
        }
    }
}
