//! Runs caller code in a fresh script and correlates its single result.
//!
//! # Flow
//!
//! 1. Wrap the code in the execution envelope and create a script from it
//! 2. Install the dispatching handler, register the handle, load the script
//! 3. Await the one correlated outcome (first receipt or first fatal error)
//! 4. Transient: unload and forget the handle. Persistent: keep it; later
//!    events go to the session's message queue

use std::{sync::Arc, time::Duration};

use hookbridge_core::{EnvelopeBuilder, SessionId};
use tokio::sync::oneshot;

use crate::{
    BridgeError, ExecutionOutcome, SessionRegistry,
    registry::Session,
    script::{ScriptHandle, ScriptState},
};

/// Execution request options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Keep the script loaded after the result is reported.
    pub keep_alive: bool,
    /// Overrides the configured execution timeout. `Duration::ZERO` waits
    /// without a deadline.
    pub timeout: Option<Duration>,
    /// Overrides the configured console methods to capture. An empty list
    /// turns capture off.
    pub log_methods: Option<Vec<String>>,
}

impl ExecuteOptions {
    #[must_use]
    pub fn keep_alive(keep_alive: bool) -> Self {
        Self {
            keep_alive,
            ..Self::default()
        }
    }
}

/// Executes code against sessions in a registry.
#[derive(Clone)]
pub struct ExecutionBridge {
    registry: Arc<SessionRegistry>,
}

impl ExecutionBridge {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Execute `code` in a session.
    ///
    /// Errors raised by the code itself are reported in the outcome, not as
    /// `Err`.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown or detached sessions and
    /// `InjectionFailure` if the script cannot be created or loaded.
    pub async fn execute(
        &self,
        session_id: SessionId,
        code: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionOutcome, BridgeError> {
        let session = self.registry.get(session_id).await?;
        let source = self.envelope(code, options.log_methods.as_deref());

        let script = session
            .engine()
            .create_script(&source)
            .await
            .map_err(|e| BridgeError::InjectionFailure(e.to_string()))?;

        let script_id = session.allocate_script_id();
        let (handle, rx) = ScriptHandle::new(
            script_id,
            Arc::clone(&script),
            options.keep_alive,
            session.queue(),
        );
        session.insert_script(Arc::clone(&handle));

        // The detach watcher may have drained the session before the insert.
        if session.is_detached() {
            handle.retire();
            session.remove_script(script_id);
            return Err(BridgeError::SessionNotFound(session_id));
        }

        if let Err(e) = script.load().await {
            handle.retire();
            session.remove_script(script_id);
            return Err(BridgeError::InjectionFailure(e.to_string()));
        }

        let timeout = match options.timeout {
            Some(limit) => Some(limit).filter(|d| !d.is_zero()),
            None => self.registry.config().execution_timeout(),
        };
        let Some(mut outcome) = Self::await_outcome(&session, &handle, rx, timeout).await else {
            // The handle was retired underneath us: the session went away.
            session.remove_script(script_id);
            return Err(BridgeError::SessionNotFound(session_id));
        };

        if handle.state() == ScriptState::Persistent {
            outcome.script_id = Some(script_id);
            tracing::info!(session_id = %session_id, script_id, "Script kept alive");
        } else {
            if let Err(e) = handle.unload().await {
                tracing::warn!(session_id = %session_id, script_id, "Failed to unload script: {e}");
            }
            session.remove_script(script_id);
        }

        Ok(outcome)
    }

    fn envelope(&self, code: &str, log_methods: Option<&[String]>) -> String {
        let methods = log_methods.or_else(|| self.registry.config().log_methods.as_deref());
        let builder = EnvelopeBuilder::new(code);
        let builder = match methods {
            None => builder,
            Some([]) => builder.without_log_capture(),
            Some(methods) => builder.log_methods(methods.iter().cloned()),
        };
        builder.build()
    }

    async fn await_outcome(
        session: &Session,
        handle: &ScriptHandle,
        mut rx: oneshot::Receiver<ExecutionOutcome>,
        timeout: Option<Duration>,
    ) -> Option<ExecutionOutcome> {
        let Some(limit) = timeout else {
            return rx.await.ok();
        };
        if let Ok(received) = tokio::time::timeout(limit, &mut rx).await {
            return received.ok();
        }
        if !handle.expire() {
            // A receipt raced the deadline; take it.
            return rx.try_recv().ok();
        }
        tracing::warn!(
            session_id = %session.id(),
            script_id = handle.id(),
            timeout_ms = limit.as_millis(),
            "Execution timed out"
        );
        Some(ExecutionOutcome::timeout(limit.as_millis()))
    }
}

#[cfg(test)]
mod tests {
    use hookbridge_core::{
        BridgeConfig, Platform,
        sim::{SimDevice, SimPlatform, SimScript},
        traits::{DetachReason, DeviceKind},
    };
    use serde_json::json;

    use super::*;
    use crate::Status;

    fn setup(config: BridgeConfig) -> (Arc<SimDevice>, ExecutionBridge, Arc<SessionRegistry>) {
        let device = SimDevice::new("usb", "Phone", DeviceKind::Usb);
        device.add_process(1234, "Target");
        let platform: Arc<dyn Platform> = Arc::new(SimPlatform::new(vec![Arc::clone(&device)]));
        let registry = Arc::new(SessionRegistry::new(platform, config));
        (device, ExecutionBridge::new(Arc::clone(&registry)), registry)
    }

    #[tokio::test]
    async fn test_load_failure_is_injection_failure() {
        let (device, bridge, registry) = setup(BridgeConfig::default());
        device.set_behavior(|_: &SimScript| {
            Err("script(line 1): SyntaxError: unexpected token".into())
        });
        let id = registry.create_session(1234, None).await.unwrap();

        let err = bridge
            .execute(id, "function (", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InjectionFailure(ref m) if m.contains("SyntaxError")));
        assert_eq!(registry.get(id).await.unwrap().script_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_unloads_silent_script() {
        let config = BridgeConfig::default().with_execution_timeout(Duration::from_millis(20));
        let (device, bridge, registry) = setup(config);
        device.set_behavior(|_: &SimScript| Ok(()));
        let id = registry.create_session(1234, None).await.unwrap();

        let outcome = bridge
            .execute(id, "while (true) {}", ExecuteOptions::keep_alive(true))
            .await
            .unwrap();
        assert_eq!(outcome.status, Status::Timeout);
        assert_eq!(outcome.script_id, None);

        let session = registry.get(id).await.unwrap();
        assert_eq!(session.script_count(), 0);

        // A late receipt neither resolves anything nor reaches the queue.
        let script = device.last_session().unwrap().last_script().unwrap();
        script.send_receipt(json!(1), Vec::<String>::new());
        assert!(session.drain_messages().messages.is_empty());
    }

    #[tokio::test]
    async fn test_per_call_timeout_overrides_config() {
        let (device, bridge, registry) = setup(BridgeConfig::default());
        device.set_behavior(|_: &SimScript| Ok(()));
        let id = registry.create_session(1234, None).await.unwrap();

        let options = ExecuteOptions {
            timeout: Some(Duration::from_millis(10)),
            ..ExecuteOptions::default()
        };
        let outcome = bridge.execute(id, "never()", options).await.unwrap();
        assert_eq!(outcome.status, Status::Timeout);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_past_configured_deadline() {
        let config = BridgeConfig::default().with_execution_timeout(Duration::from_millis(5));
        let (device, bridge, registry) = setup(config);
        device.set_behavior(|_: &SimScript| Ok(()));
        let id = registry.create_session(1234, None).await.unwrap();

        let pending = tokio::spawn({
            let bridge = bridge.clone();
            let options = ExecuteOptions {
                timeout: Some(Duration::ZERO),
                ..ExecuteOptions::default()
            };
            async move { bridge.execute(id, "slow()", options).await }
        });
        while device.last_session().unwrap().last_script().is_none() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let script = device.last_session().unwrap().last_script().unwrap();
        script.send_receipt(json!("late but fine"), Vec::<String>::new());

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.result, json!("late but fine"));
    }

    #[tokio::test]
    async fn test_log_methods_reach_envelope() {
        let (device, bridge, registry) = setup(BridgeConfig::default().with_log_methods(["warn"]));
        let id = registry.create_session(1234, None).await.unwrap();

        bridge.execute(id, "1", ExecuteOptions::default()).await.unwrap();
        let script = device.last_session().unwrap().last_script().unwrap();
        assert!(script.source().contains(r#"var __hbMethods = ["warn"];"#));

        let options = ExecuteOptions {
            log_methods: Some(Vec::new()),
            ..ExecuteOptions::default()
        };
        bridge.execute(id, "2", options).await.unwrap();
        let script = device.last_session().unwrap().last_script().unwrap();
        assert!(script.source().contains("var __hbMethods = [];"));
    }

    #[tokio::test]
    async fn test_detach_before_load_is_session_not_found() {
        let (device, bridge, registry) = setup(BridgeConfig::default());
        let id = registry.create_session(1234, None).await.unwrap();
        let session = registry.get(id).await.unwrap();
        device
            .last_session()
            .unwrap()
            .detach_after_next_create(DetachReason::ProcessTerminated);

        let result = bridge.execute(id, "1", ExecuteOptions::default()).await;
        assert!(matches!(result, Err(BridgeError::SessionNotFound(_))));
        assert_eq!(session.script_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_while_waiting() {
        let (device, bridge, registry) = setup(BridgeConfig::default());
        device.set_behavior(|_: &SimScript| Ok(()));
        let id = registry.create_session(1234, None).await.unwrap();

        let pending = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.execute(id, "wait()", ExecuteOptions::default()).await }
        });
        while device.last_session().unwrap().last_script().is_none() {
            tokio::task::yield_now().await;
        }
        device
            .last_session()
            .unwrap()
            .simulate_detach(DetachReason::ProcessTerminated);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BridgeError::SessionNotFound(_))));
    }
}
