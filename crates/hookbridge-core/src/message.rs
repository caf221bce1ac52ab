//! Script event model.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::RECEIPT_KIND;

/// Raw event as delivered by the engine.
///
/// `message` is the engine's JSON envelope (`{"type": "send", "payload": ...}`,
/// `{"type": "error", ...}`, `{"type": "log", ...}`), `data` the optional binary
/// attachment that travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    pub message: Value,
    pub data: Option<Bytes>,
}

/// What an event means to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The terminal event of an execution envelope.
    Receipt(ExecutionReceipt),
    /// Engine-level error raised by the script.
    Fatal {
        description: String,
        stack: Option<String>,
    },
    /// Anything else: custom `send` payloads, log lines, unknown kinds.
    Other,
}

/// Result reported by an execution envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<ReceiptError>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Error captured inside an execution envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawMessage {
    Send {
        #[serde(default)]
        payload: Value,
    },
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Log {},
}

impl ScriptEvent {
    /// Create an event without binary data.
    #[must_use]
    pub const fn new(message: Value) -> Self {
        Self {
            message,
            data: None,
        }
    }

    /// Create an event carrying a binary attachment.
    #[must_use]
    pub const fn with_data(message: Value, data: Option<Bytes>) -> Self {
        Self { message, data }
    }

    /// Classify the event.
    ///
    /// A `send` whose payload is tagged `execution_receipt` but does not parse
    /// as a receipt is classified as `Other`.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match RawMessage::deserialize(&self.message) {
            Ok(RawMessage::Send { payload }) => {
                if payload.get("type").and_then(Value::as_str) != Some(RECEIPT_KIND) {
                    return EventKind::Other;
                }
                ExecutionReceipt::deserialize(&payload).map_or(EventKind::Other, EventKind::Receipt)
            }
            Ok(RawMessage::Error { description, stack }) => EventKind::Fatal { description, stack },
            Ok(RawMessage::Log {}) | Err(_) => EventKind::Other,
        }
    }

    /// The `type` field of the envelope, if any.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.message.get("type").and_then(Value::as_str)
    }

    /// Approximate in-memory size, used for queue accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let json = serde_json::to_vec(&self.message).map_or(0, |v| v.len());
        json + self.data.as_ref().map_or(0, Bytes::len) + OVERHEAD
    }
}

/// An event accumulated for a persistent script, waiting to be polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Raw engine envelope.
    pub message: Value,
    /// Binary attachment, base64 on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

impl From<ScriptEvent> for QueuedMessage {
    fn from(event: ScriptEvent) -> Self {
        Self {
            message: event.message,
            data: event.data,
        }
    }
}

/// Serde adapter for optional binary payloads carried as base64 strings.
pub mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        data: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                BASE64
                    .decode(s)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_receipt_classification() {
        let event = ScriptEvent::new(json!({
            "type": "send",
            "payload": {"type": "execution_receipt", "result": 2, "error": null, "logs": ["hi"]}
        }));
        match event.kind() {
            EventKind::Receipt(receipt) => {
                assert_eq!(receipt.result, json!(2));
                assert!(receipt.error.is_none());
                assert_eq!(receipt.logs, vec!["hi".to_string()]);
            }
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[test]
    fn test_fatal_classification() {
        let event = ScriptEvent::new(json!({
            "type": "error",
            "description": "ReferenceError: foo is not defined",
            "stack": "at <eval>:1",
            "fileName": "<eval>",
            "lineNumber": 1
        }));
        assert_eq!(
            event.kind(),
            EventKind::Fatal {
                description: "ReferenceError: foo is not defined".into(),
                stack: Some("at <eval>:1".into()),
            }
        );
    }

    #[test]
    fn test_other_events() {
        let custom = ScriptEvent::new(json!({"type": "send", "payload": {"type": "hook", "x": 1}}));
        let log = ScriptEvent::new(json!({"type": "log", "level": "info", "payload": "hello"}));
        let unknown = ScriptEvent::new(json!({"type": "mystery"}));
        let untyped = ScriptEvent::new(json!("just a string"));

        for event in [custom, log, unknown, untyped] {
            assert_eq!(event.kind(), EventKind::Other);
        }
    }

    #[test]
    fn test_queued_message_encodes_data_as_base64() {
        let msg = QueuedMessage {
            message: json!({"type": "send", "payload": 1}),
            data: Some(Bytes::from_static(b"\x00\x01abc")),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], json!("AAFhYmM="));

        let parsed: QueuedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_queued_message_without_data_omits_field() {
        let msg = QueuedMessage::from(ScriptEvent::new(json!({"type": "send", "payload": null})));
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("data").is_none());
    }
}
