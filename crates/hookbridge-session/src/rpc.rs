//! Calls into a session's persistent script.

use std::sync::Arc;

use bytes::Bytes;
use hookbridge_core::{ExportError, ScriptId, SessionId};
use serde_json::Value;

use crate::{BridgeError, RpcOutcome, SessionRegistry};

/// Invokes exports on, and posts messages to, persistent scripts.
#[derive(Clone)]
pub struct RpcInvoker {
    registry: Arc<SessionRegistry>,
}

impl RpcInvoker {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Call an exported function.
    ///
    /// `script_id` selects a script explicitly; `None` targets the session's
    /// current script. A throwing export is reported in the outcome.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NoActiveScript`, `ScriptNotFound` or
    /// `ExportNotFound`.
    pub async fn call(
        &self,
        session_id: SessionId,
        function: &str,
        args: Vec<Value>,
        script_id: Option<ScriptId>,
    ) -> Result<RpcOutcome, BridgeError> {
        let session = self.registry.get(session_id).await?;
        let handle = session.target_script(script_id)?;

        match handle.call_export(function, args).await {
            Ok(result) => Ok(RpcOutcome::success(result)),
            Err(ExportError::NotFound(name)) => Err(BridgeError::ExportNotFound(name)),
            Err(ExportError::Raised(description)) => Ok(RpcOutcome::error(description)),
            Err(ExportError::Engine(e)) => {
                if session.is_detached() {
                    return Err(BridgeError::SessionNotFound(session_id));
                }
                tracing::debug!(
                    session_id = %session_id,
                    script_id = handle.id(),
                    function,
                    "Export call failed: {e}"
                );
                Ok(RpcOutcome::error(e.to_string()))
            }
        }
    }

    /// Deliver a message to a persistent script. Returns once delivered;
    /// effects show up in the message queue.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `NoActiveScript`, `ScriptNotFound`, or the
    /// engine error if delivery fails.
    pub async fn post(
        &self,
        session_id: SessionId,
        message: Value,
        data: Option<Bytes>,
        script_id: Option<ScriptId>,
    ) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id).await?;
        let handle = session.target_script(script_id)?;
        handle.post(message, data).await.map_err(|e| {
            if session.is_detached() {
                BridgeError::SessionNotFound(session_id)
            } else {
                BridgeError::Engine(e)
            }
        })
    }

    /// Unload one persistent script.
    ///
    /// # Errors
    /// Returns `SessionNotFound`, `ScriptNotFound`, or `NoActiveScript` when
    /// the script is still executing or was never kept alive.
    pub async fn unload(
        &self,
        session_id: SessionId,
        script_id: ScriptId,
    ) -> Result<(), BridgeError> {
        let session = self.registry.get(session_id).await?;
        session.target_script(Some(script_id))?;
        let handle = session
            .remove_script(script_id)
            .ok_or(BridgeError::ScriptNotFound { session_id, script_id })?;
        handle.unload().await?;
        tracing::info!(session_id = %session_id, script_id, "Script unloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hookbridge_core::{
        BridgeConfig, Platform,
        sim::{SimDevice, SimPlatform, SimScript},
        traits::DeviceKind,
    };
    use serde_json::json;

    use super::*;
    use crate::{ExecuteOptions, ExecutionBridge, Status};

    async fn persistent_session() -> (Arc<SimDevice>, ExecutionBridge, RpcInvoker, SessionId) {
        let device = SimDevice::new("usb", "Phone", DeviceKind::Usb);
        device.add_process(1234, "Target");
        device.set_behavior(|script: &SimScript| {
            script.export("fail", |_| Err("Error: boom".into()));
            script.send_receipt(json!(null), Vec::<String>::new());
            Ok(())
        });
        let platform: Arc<dyn Platform> = Arc::new(SimPlatform::new(vec![Arc::clone(&device)]));
        let registry = Arc::new(SessionRegistry::new(platform, BridgeConfig::default()));
        let id = registry.create_session(1234, None).await.unwrap();
        let bridge = ExecutionBridge::new(Arc::clone(&registry));
        bridge.execute(id, "setup()", ExecuteOptions::keep_alive(true)).await.unwrap();
        (device, bridge, RpcInvoker::new(registry), id)
    }

    #[tokio::test]
    async fn test_throwing_export_is_data() {
        let (_device, _bridge, rpc, id) = persistent_session().await;
        let outcome = rpc.call(id, "fail", vec![], None).await.unwrap();
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error.as_deref(), Some("Error: boom"));
    }

    #[tokio::test]
    async fn test_explicit_script_selection() {
        let (_device, bridge, rpc, id) = persistent_session().await;
        let second = bridge.execute(id, "setup()", ExecuteOptions::keep_alive(true)).await.unwrap();
        let second_id = second.script_id.unwrap();

        rpc.unload(id, second_id).await.unwrap();
        assert!(matches!(
            rpc.call(id, "fail", vec![], Some(second_id)).await,
            Err(BridgeError::ScriptNotFound { .. })
        ));
        // The first script is current again.
        let outcome = rpc.call(id, "fail", vec![], None).await.unwrap();
        assert_eq!(outcome.status, Status::Error);
    }

    #[tokio::test]
    async fn test_post_reaches_inbox() {
        let (device, _bridge, rpc, id) = persistent_session().await;
        rpc.post(id, json!({"type": "ping"}), None, None).await.unwrap();
        let script = device.last_session().unwrap().last_script().unwrap();
        assert_eq!(script.posted(), vec![json!({"type": "ping"})]);
    }
}
