//! Maps wire requests onto the platform and the session layer.

use std::{sync::Arc, time::Duration};

use hookbridge_core::Device;
use hookbridge_session::{
    BridgeError, ExecuteOptions, ExecutionBridge, RpcInvoker, SessionRegistry,
};
use serde_json::json;

use crate::protocol::{OperationResponse, Request};

/// Executes requests against one registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    bridge: ExecutionBridge,
    rpc: RpcInvoker,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            bridge: ExecutionBridge::new(Arc::clone(&registry)),
            rpc: RpcInvoker::new(Arc::clone(&registry)),
            registry,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one request. Never fails: boundary errors become error responses.
    pub async fn dispatch(&self, request: Request) -> OperationResponse {
        let op = request.name();
        match self.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(op, code = ?e.code(), "Operation failed: {e}");
                OperationResponse::failure(&e)
            }
        }
    }

    async fn device(&self, selector: Option<&str>) -> Result<Arc<dyn Device>, BridgeError> {
        self.registry.resolve_device(selector).await
    }

    async fn handle(&self, request: Request) -> Result<OperationResponse, BridgeError> {
        let response = match request {
            Request::ListDevices => {
                let devices = self.registry.platform().list_devices().await?;
                OperationResponse::success(json!({ "devices": devices }))
            }
            Request::GetDevice { device_id } => {
                let device = self.device(device_id.as_deref()).await?;
                OperationResponse::success(json!({ "device": device.info() }))
            }
            Request::EnumerateProcesses { device_id } => {
                let processes = self
                    .device(device_id.as_deref())
                    .await?
                    .enumerate_processes()
                    .await?;
                OperationResponse::success(json!({ "processes": processes }))
            }
            Request::GetProcessByName { name, device_id } => {
                let needle = name.to_lowercase();
                let processes = self
                    .device(device_id.as_deref())
                    .await?
                    .enumerate_processes()
                    .await?;
                match processes
                    .into_iter()
                    .find(|p| p.name.to_lowercase().contains(&needle))
                {
                    Some(process) => {
                        OperationResponse::success(json!({ "found": true, "process": process }))
                    }
                    None => OperationResponse::success(json!({ "found": false, "name": name })),
                }
            }
            Request::EnumerateApplications { device_id } => {
                let applications = self
                    .device(device_id.as_deref())
                    .await?
                    .enumerate_applications()
                    .await?;
                OperationResponse::success(json!({ "applications": applications }))
            }
            Request::GetFrontmostApplication { device_id } => {
                let application = self
                    .device(device_id.as_deref())
                    .await?
                    .frontmost_application()
                    .await?;
                OperationResponse::success(json!({ "application": application }))
            }
            Request::SpawnProcess {
                program,
                argv,
                device_id,
            } => {
                let pid = self.device(device_id.as_deref()).await?.spawn(&program, &argv).await?;
                tracing::info!(pid, program = %program, "Process spawned");
                OperationResponse::success(json!({ "pid": pid }))
            }
            Request::ResumeProcess { pid, device_id } => {
                self.device(device_id.as_deref()).await?.resume(pid).await?;
                OperationResponse::success(json!({ "pid": pid, "resumed": true }))
            }
            Request::KillProcess { pid, device_id } => {
                self.device(device_id.as_deref()).await?.kill(pid).await?;
                OperationResponse::success(json!({ "pid": pid, "killed": true }))
            }
            Request::CreateSession { pid, device_id } => {
                let session_id = self.registry.create_session(pid, device_id.as_deref()).await?;
                OperationResponse::success(json!({ "session_id": session_id }))
            }
            Request::ListSessions => {
                let sessions = self.registry.list().await;
                OperationResponse::success(json!({ "sessions": sessions }))
            }
            Request::DetachSession { session_id } => {
                self.registry.detach(session_id).await?;
                OperationResponse::success(json!({ "session_id": session_id, "detached": true }))
            }
            Request::ExecuteCode {
                session_id,
                code,
                keep_alive,
                timeout_ms,
                log_methods,
            } => {
                let options = ExecuteOptions {
                    keep_alive,
                    timeout: timeout_ms.map(Duration::from_millis),
                    log_methods,
                };
                let outcome = self.bridge.execute(session_id, &code, options).await?;
                outcome_response(&outcome)
            }
            Request::GetMessages { session_id } => {
                let drained = self.registry.get(session_id).await?.drain_messages();
                OperationResponse::success(json!({
                    "messages": drained.messages,
                    "dropped": drained.dropped,
                }))
            }
            Request::CallExport {
                session_id,
                function,
                args,
                script_id,
            } => {
                let outcome = self.rpc.call(session_id, &function, args, script_id).await?;
                outcome_response(&outcome)
            }
            Request::PostMessage {
                session_id,
                message,
                data,
                script_id,
            } => {
                self.rpc.post(session_id, message, data, script_id).await?;
                OperationResponse::success(json!({ "sent": true }))
            }
            Request::ListScripts { session_id } => {
                let session = self.registry.get(session_id).await?;
                let current = session.current_script().map(|h| h.id());
                OperationResponse::success(json!({
                    "scripts": session.scripts(),
                    "current_script": current,
                }))
            }
            Request::UnloadScript { session_id, script_id } => {
                self.rpc.unload(session_id, script_id).await?;
                OperationResponse::success(json!({ "script_id": script_id, "unloaded": true }))
            }
        };
        Ok(response)
    }
}

fn outcome_response<T: serde::Serialize>(outcome: &T) -> OperationResponse {
    OperationResponse::outcome(outcome).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize outcome: {e}");
        OperationResponse::invalid(format!("Failed to serialize outcome: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use hookbridge_core::{
        BridgeConfig, Platform,
        sim::{SimDevice, SimPlatform, SimScript},
        traits::DeviceKind,
    };
    use serde_json::Value;
    use uuid::Uuid;

    use super::*;

    fn dispatcher() -> (Arc<SimDevice>, Dispatcher) {
        let local = SimDevice::new("local", "Local System", DeviceKind::Local);
        let usb = SimDevice::new("usb-1", "Phone", DeviceKind::Usb);
        usb.add_process(1234, "Target");
        usb.add_process(4321, "com.example.Notes");
        usb.add_application("com.example.notes", "Notes", Some(4321));
        usb.set_frontmost("com.example.notes");
        let platform: Arc<dyn Platform> = Arc::new(SimPlatform::new(vec![local, Arc::clone(&usb)]));
        let registry = Arc::new(SessionRegistry::new(platform, BridgeConfig::default()));
        (usb, Dispatcher::new(registry))
    }

    async fn session(d: &Dispatcher) -> Uuid {
        let response = d
            .dispatch(Request::CreateSession {
                pid: 1234,
                device_id: None,
            })
            .await;
        assert!(!response.is_error, "{:?}", response.body);
        serde_json::from_value(response.body["session_id"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_platform_delegation() {
        let (_usb, d) = dispatcher();
        let devices = d.dispatch(Request::ListDevices).await;
        assert_eq!(devices.body["devices"].as_array().map(Vec::len), Some(2));

        let device = d.dispatch(Request::GetDevice { device_id: None }).await;
        assert_eq!(device.body["device"]["id"], json!("usb-1"));

        let front = d.dispatch(Request::GetFrontmostApplication { device_id: None }).await;
        assert_eq!(front.body["application"]["identifier"], json!("com.example.notes"));

        let missing = d
            .dispatch(Request::GetDevice {
                device_id: Some("nope".into()),
            })
            .await;
        assert!(missing.is_error);
        assert_eq!(missing.body["code"], json!("device_not_found"));
    }

    #[tokio::test]
    async fn test_process_by_name() {
        let (_usb, d) = dispatcher();
        let found = d
            .dispatch(Request::GetProcessByName {
                name: "NOTES".into(),
                device_id: None,
            })
            .await;
        assert_eq!(found.body["found"], json!(true));
        assert_eq!(found.body["process"]["pid"], json!(4321));

        let none = d
            .dispatch(Request::GetProcessByName {
                name: "absent".into(),
                device_id: None,
            })
            .await;
        assert!(!none.is_error);
        assert_eq!(none.body["found"], json!(false));
    }

    #[tokio::test]
    async fn test_spawn_resume_kill() {
        let (usb, d) = dispatcher();
        let spawned = d
            .dispatch(Request::SpawnProcess {
                program: "/bin/app".into(),
                argv: vec![],
                device_id: None,
            })
            .await;
        let pid = u32::try_from(spawned.body["pid"].as_u64().unwrap()).unwrap();
        assert!(usb.is_suspended(pid));

        let resumed = d.dispatch(Request::ResumeProcess { pid, device_id: None }).await;
        assert_eq!(resumed.status(), Some("success"));
        let killed = d.dispatch(Request::KillProcess { pid, device_id: None }).await;
        assert_eq!(killed.body["killed"], json!(true));

        let again = d.dispatch(Request::KillProcess { pid, device_id: None }).await;
        assert!(again.is_error);
        assert_eq!(again.body["code"], json!("engine_error"));
    }

    #[tokio::test]
    async fn test_attach_failure_flags_error() {
        let (_usb, d) = dispatcher();
        let response = d
            .dispatch(Request::CreateSession {
                pid: 999,
                device_id: None,
            })
            .await;
        assert!(response.is_error);
        assert_eq!(response.body["code"], json!("attach_failure"));
        assert_eq!(response.body["error"], json!("unable to find process with pid 999"));
    }

    #[tokio::test]
    async fn test_execution_error_is_not_flagged() {
        let (usb, d) = dispatcher();
        usb.set_behavior(|script: &SimScript| {
            script.send_error_receipt("TypeError: undefined is not a function");
            Ok(())
        });
        let session_id = session(&d).await;

        let response = d
            .dispatch(Request::ExecuteCode {
                session_id,
                code: "f()".into(),
                keep_alive: false,
                timeout_ms: None,
                log_methods: None,
            })
            .await;
        assert!(!response.is_error);
        assert_eq!(response.status(), Some("error"));
        assert_eq!(response.body["error"], json!("TypeError: undefined is not a function"));
    }

    #[tokio::test]
    async fn test_persistent_script_lifecycle() {
        let (usb, d) = dispatcher();
        usb.set_behavior(|script: &SimScript| {
            script.on_post(|script, message, data| {
                script.send_with_data(message, data.unwrap_or_default());
            });
            script.send_receipt(json!(null), Vec::<String>::new());
            Ok(())
        });
        let session_id = session(&d).await;
        let executed = d
            .dispatch(Request::ExecuteCode {
                session_id,
                code: "recv()".into(),
                keep_alive: true,
                timeout_ms: None,
                log_methods: None,
            })
            .await;
        let script_id = executed.body["script_id"].as_u64().unwrap();

        let scripts = d.dispatch(Request::ListScripts { session_id }).await;
        assert_eq!(scripts.body["current_script"], json!(script_id));
        assert_eq!(scripts.body["scripts"][0]["state"], json!("persistent"));

        let posted = d
            .dispatch(Request::PostMessage {
                session_id,
                message: json!({"type": "x"}),
                data: Some(bytes::Bytes::from_static(b"hi")),
                script_id: None,
            })
            .await;
        assert_eq!(posted.body, json!({"status": "success", "sent": true}));

        let messages = d.dispatch(Request::GetMessages { session_id }).await;
        let entries = messages.body["messages"].as_array().cloned().unwrap_or_default();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["message"]["payload"], json!({"type": "x"}));
        assert_eq!(entries[0]["data"], json!("aGk="));
        assert_eq!(messages.body["dropped"], json!(0));

        let unloaded = d
            .dispatch(Request::UnloadScript {
                session_id,
                script_id: u32::try_from(script_id).unwrap(),
            })
            .await;
        assert_eq!(unloaded.body["unloaded"], json!(true));
        let scripts = d.dispatch(Request::ListScripts { session_id }).await;
        assert_eq!(scripts.body["scripts"], json!([]));
        assert_eq!(scripts.body["current_script"], Value::Null);
    }

    #[tokio::test]
    async fn test_detach_session() {
        let (_usb, d) = dispatcher();
        let session_id = session(&d).await;
        let listed = d.dispatch(Request::ListSessions).await;
        assert_eq!(listed.body["sessions"][0]["pid"], json!(1234));

        let detached = d.dispatch(Request::DetachSession { session_id }).await;
        assert_eq!(detached.body["detached"], json!(true));

        let messages = d.dispatch(Request::GetMessages { session_id }).await;
        assert!(messages.is_error);
        assert_eq!(messages.body["code"], json!("session_not_found"));
    }
}
