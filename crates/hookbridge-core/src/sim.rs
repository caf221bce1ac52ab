//! In-process simulated engine.
//!
//! Implements every capability trait without touching real processes. Script
//! behavior is supplied as a closure that runs on `load` and can emit events,
//! register exports and react to posted messages. Tests keep typed handles to
//! the simulated objects to emit deferred events or force a detach.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::{
    ScriptEvent,
    envelope::{self, RECEIPT_KIND},
    traits::{
        ApplicationInfo, DetachReason, Device, DeviceInfo, DeviceKind, EngineError, EngineScript,
        EngineSession, ExportError, MessageHandler, Platform, ProcessInfo,
    },
};

/// Runs when a simulated script loads. `Err` fails the load.
pub type LoadFn = Arc<dyn Fn(&SimScript) -> Result<(), String> + Send + Sync>;
/// Body of a simulated RPC export. `Err` is reported as a thrown error.
pub type ExportFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;
/// Reaction to a posted message.
pub type PostFn = Arc<dyn Fn(&SimScript, Value, Option<Bytes>) + Send + Sync>;

/// Behavior that answers every execution with its code parsed as a JSON literal.
///
/// Code that is not a JSON literal reports a `SyntaxError` inside the receipt.
#[must_use]
pub fn literal_behavior() -> LoadFn {
    Arc::new(|script: &SimScript| {
        let code = script.user_code().unwrap_or_default();
        match serde_json::from_str::<Value>(code.trim()) {
            Ok(value) => script.send_receipt(value, Vec::<String>::new()),
            Err(e) => script.send_error_receipt(format!(
                "SyntaxError: simulated engine only evaluates literals ({e})"
            )),
        }
        Ok(())
    })
}

/// Simulated platform with a fixed set of devices.
pub struct SimPlatform {
    devices: Vec<Arc<SimDevice>>,
}

impl SimPlatform {
    #[must_use]
    pub fn new(devices: Vec<Arc<SimDevice>>) -> Self {
        Self { devices }
    }

    /// A local device plus one USB device, both running `literal_behavior`.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(vec![
            SimDevice::new("local", "Local System", DeviceKind::Local),
            SimDevice::new("sim-usb", "Simulated Phone", DeviceKind::Usb),
        ])
    }

    /// Typed access to a device.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<Arc<SimDevice>> {
        self.devices.iter().find(|d| d.info.id == id).cloned()
    }
}

#[async_trait]
impl Platform for SimPlatform {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        Ok(self.devices.iter().map(|d| d.info.clone()).collect())
    }

    async fn get_device(&self, id: &str) -> Result<Arc<dyn Device>, EngineError> {
        self.device(id)
            .map(|d| d as Arc<dyn Device>)
            .ok_or_else(|| EngineError::NotFound(format!("unable to find device with id '{id}'")))
    }
}

struct ProcessTable {
    processes: Vec<ProcessInfo>,
    suspended: HashSet<u32>,
    denied: HashSet<u32>,
    applications: Vec<ApplicationInfo>,
    frontmost: Option<String>,
}

/// Simulated device.
pub struct SimDevice {
    info: DeviceInfo,
    table: Mutex<ProcessTable>,
    next_pid: AtomicU32,
    behavior: Arc<RwLock<LoadFn>>,
    sessions: Mutex<Vec<Arc<SimSession>>>,
}

impl SimDevice {
    #[must_use]
    pub fn new(id: &str, name: &str, kind: DeviceKind) -> Arc<Self> {
        Arc::new(Self {
            info: DeviceInfo {
                id: id.to_string(),
                name: name.to_string(),
                kind,
            },
            table: Mutex::new(ProcessTable {
                processes: Vec::new(),
                suspended: HashSet::new(),
                denied: HashSet::new(),
                applications: Vec::new(),
                frontmost: None,
            }),
            next_pid: AtomicU32::new(20_000),
            behavior: Arc::new(RwLock::new(literal_behavior())),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Add a running process.
    pub fn add_process(&self, pid: u32, name: &str) {
        self.table.lock().processes.push(ProcessInfo {
            pid,
            name: name.to_string(),
        });
    }

    /// Add an installed application, optionally running as `pid`.
    pub fn add_application(&self, identifier: &str, name: &str, pid: Option<u32>) {
        let mut table = self.table.lock();
        if let Some(pid) = pid {
            table.processes.push(ProcessInfo {
                pid,
                name: name.to_string(),
            });
        }
        table.applications.push(ApplicationInfo {
            identifier: identifier.to_string(),
            name: name.to_string(),
            pid,
        });
    }

    /// Mark an application identifier as frontmost.
    pub fn set_frontmost(&self, identifier: &str) {
        self.table.lock().frontmost = Some(identifier.to_string());
    }

    /// Make `attach(pid)` fail with a permission error.
    pub fn deny_attach(&self, pid: u32) {
        self.table.lock().denied.insert(pid);
    }

    /// Replace the script behavior for scripts created from now on.
    pub fn set_behavior<F>(&self, behavior: F)
    where
        F: Fn(&SimScript) -> Result<(), String> + Send + Sync + 'static,
    {
        *self.behavior.write() = Arc::new(behavior);
    }

    /// Whether `pid` is spawned and not yet resumed.
    #[must_use]
    pub fn is_suspended(&self, pid: u32) -> bool {
        self.table.lock().suspended.contains(&pid)
    }

    /// Attach handles created so far.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SimSession>> {
        self.sessions.lock().clone()
    }

    /// Most recent attach handle.
    #[must_use]
    pub fn last_session(&self) -> Option<Arc<SimSession>> {
        self.sessions.lock().last().cloned()
    }

    fn has_process(&self, pid: u32) -> bool {
        self.table.lock().processes.iter().any(|p| p.pid == pid)
    }
}

#[async_trait]
impl Device for SimDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>, EngineError> {
        Ok(self.table.lock().processes.clone())
    }

    async fn enumerate_applications(&self) -> Result<Vec<ApplicationInfo>, EngineError> {
        Ok(self.table.lock().applications.clone())
    }

    async fn frontmost_application(&self) -> Result<Option<ApplicationInfo>, EngineError> {
        let table = self.table.lock();
        Ok(table
            .frontmost
            .as_ref()
            .and_then(|id| table.applications.iter().find(|a| &a.identifier == id))
            .cloned())
    }

    async fn spawn(&self, program: &str, _argv: &[String]) -> Result<u32, EngineError> {
        if program.trim().is_empty() {
            return Err(EngineError::InvalidArgument("program must not be empty".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let name = program.rsplit('/').next().unwrap_or(program).to_string();
        let mut table = self.table.lock();
        table.processes.push(ProcessInfo { pid, name });
        table.suspended.insert(pid);
        Ok(pid)
    }

    async fn resume(&self, pid: u32) -> Result<(), EngineError> {
        let mut table = self.table.lock();
        if !table.processes.iter().any(|p| p.pid == pid) {
            return Err(EngineError::NotFound(format!("unable to find process with pid {pid}")));
        }
        if !table.suspended.remove(&pid) {
            return Err(EngineError::InvalidOperation(format!(
                "process with pid {pid} is not suspended"
            )));
        }
        Ok(())
    }

    async fn kill(&self, pid: u32) -> Result<(), EngineError> {
        {
            let mut table = self.table.lock();
            let before = table.processes.len();
            table.processes.retain(|p| p.pid != pid);
            if table.processes.len() == before {
                return Err(EngineError::NotFound(format!("unable to find process with pid {pid}")));
            }
            table.suspended.remove(&pid);
            for app in table.applications.iter_mut().filter(|a| a.pid == Some(pid)) {
                app.pid = None;
            }
        }
        for session in self.sessions().into_iter().filter(|s| s.pid == pid) {
            session.simulate_detach(DetachReason::ProcessTerminated);
        }
        Ok(())
    }

    async fn attach(&self, pid: u32) -> Result<Arc<dyn EngineSession>, EngineError> {
        if !self.has_process(pid) {
            return Err(EngineError::NotFound(format!("unable to find process with pid {pid}")));
        }
        if self.table.lock().denied.contains(&pid) {
            return Err(EngineError::PermissionDenied(format!(
                "unable to access process with pid {pid} from the current user account"
            )));
        }
        let (detached, _) = watch::channel(None);
        let session = Arc::new(SimSession {
            pid,
            behavior: Arc::clone(&self.behavior),
            scripts: Mutex::new(Vec::new()),
            detached,
            detach_on_create: Mutex::new(None),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Simulated attach handle.
pub struct SimSession {
    pid: u32,
    behavior: Arc<RwLock<LoadFn>>,
    scripts: Mutex<Vec<Arc<SimScript>>>,
    detached: watch::Sender<Option<DetachReason>>,
    detach_on_create: Mutex<Option<DetachReason>>,
}

impl SimSession {
    /// Fire the detach notification. Later calls are ignored.
    pub fn simulate_detach(&self, reason: DetachReason) {
        let fired = self.detached.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if fired {
            for script in self.scripts.lock().iter() {
                script.destroy();
            }
        }
    }

    /// Detach right after the next script is created, before it loads.
    pub fn detach_after_next_create(&self, reason: DetachReason) {
        *self.detach_on_create.lock() = Some(reason);
    }

    /// Scripts created so far.
    #[must_use]
    pub fn scripts(&self) -> Vec<Arc<SimScript>> {
        self.scripts.lock().clone()
    }

    /// Most recently created script.
    #[must_use]
    pub fn last_script(&self) -> Option<Arc<SimScript>> {
        self.scripts.lock().last().cloned()
    }
}

#[async_trait]
impl EngineSession for SimSession {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_script(&self, source: &str) -> Result<Arc<dyn EngineScript>, EngineError> {
        if self.is_detached() {
            return Err(EngineError::InvalidOperation("session is gone".into()));
        }
        let script = Arc::new(SimScript {
            source: source.to_string(),
            behavior: self.behavior.read().clone(),
            handler: Mutex::new(None),
            exports: Mutex::new(HashMap::new()),
            on_post: Mutex::new(None),
            inbox: Mutex::new(Vec::new()),
            state: Mutex::new(SimScriptState::Created),
        });
        self.scripts.lock().push(Arc::clone(&script));
        let pending = self.detach_on_create.lock().take();
        if let Some(reason) = pending {
            self.simulate_detach(reason);
        }
        Ok(script)
    }

    async fn detach(&self) -> Result<(), EngineError> {
        self.simulate_detach(DetachReason::ApplicationRequested);
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.detached.borrow().is_some()
    }

    async fn detached(&self) -> DetachReason {
        let mut rx = self.detached.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return DetachReason::ConnectionTerminated;
            }
        }
    }
}

/// Lifecycle of a simulated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimScriptState {
    Created,
    Loaded,
    Unloaded,
}

/// Simulated script unit.
pub struct SimScript {
    source: String,
    behavior: LoadFn,
    handler: Mutex<Option<MessageHandler>>,
    exports: Mutex<HashMap<String, ExportFn>>,
    on_post: Mutex<Option<PostFn>>,
    inbox: Mutex<Vec<Value>>,
    state: Mutex<SimScriptState>,
}

impl SimScript {
    /// Full source the script was created from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Caller code embedded in the execution envelope.
    #[must_use]
    pub fn user_code(&self) -> Option<String> {
        envelope::user_code(&self.source)
    }

    #[must_use]
    pub fn state(&self) -> SimScriptState {
        *self.state.lock()
    }

    /// Emit a raw event to the installed handler.
    ///
    /// Dropped once the script is unloaded, like a real engine.
    pub fn emit(&self, message: Value, data: Option<Bytes>) {
        if self.state() == SimScriptState::Unloaded {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(ScriptEvent::with_data(message, data));
        }
    }

    /// Emit a `send` event.
    pub fn send(&self, payload: Value) {
        self.emit(json!({"type": "send", "payload": payload}), None);
    }

    /// Emit a `send` event with a binary attachment.
    pub fn send_with_data(&self, payload: Value, data: impl Into<Bytes>) {
        self.emit(json!({"type": "send", "payload": payload}), Some(data.into()));
    }

    /// Emit a successful execution receipt.
    pub fn send_receipt<I, S>(&self, result: Value, logs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let logs: Vec<String> = logs.into_iter().map(Into::into).collect();
        self.send(json!({"type": RECEIPT_KIND, "result": result, "error": null, "logs": logs}));
    }

    /// Emit a receipt reporting a thrown error.
    pub fn send_error_receipt(&self, message: impl Into<String>) {
        self.send(json!({
            "type": RECEIPT_KIND,
            "result": null,
            "error": {"message": message.into(), "stack": null},
            "logs": []
        }));
    }

    /// Emit an engine-level error event.
    pub fn fatal(&self, description: impl Into<String>) {
        self.emit(
            json!({"type": "error", "description": description.into(), "stack": null}),
            None,
        );
    }

    /// Emit a console log event.
    pub fn log(&self, level: &str, text: &str) {
        self.emit(json!({"type": "log", "level": level, "payload": text}), None);
    }

    /// Register an RPC export.
    pub fn export<F>(&self, name: &str, body: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.exports.lock().insert(name.to_string(), Arc::new(body));
    }

    /// React to posted messages.
    pub fn on_post<F>(&self, reaction: F)
    where
        F: Fn(&Self, Value, Option<Bytes>) + Send + Sync + 'static,
    {
        *self.on_post.lock() = Some(Arc::new(reaction));
    }

    /// Messages posted to this script, in order.
    #[must_use]
    pub fn posted(&self) -> Vec<Value> {
        self.inbox.lock().clone()
    }

    fn destroy(&self) {
        *self.state.lock() = SimScriptState::Unloaded;
        self.exports.lock().clear();
    }
}

#[async_trait]
impl EngineScript for SimScript {
    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn load(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            match *state {
                SimScriptState::Created => *state = SimScriptState::Loaded,
                SimScriptState::Loaded => {
                    return Err(EngineError::InvalidOperation("script is already loaded".into()));
                }
                SimScriptState::Unloaded => {
                    return Err(EngineError::InvalidOperation("script is destroyed".into()));
                }
            }
        }
        let behavior = Arc::clone(&self.behavior);
        behavior(self).map_err(|e| {
            self.destroy();
            EngineError::Failed(e)
        })
    }

    async fn unload(&self) -> Result<(), EngineError> {
        if self.state() == SimScriptState::Unloaded {
            return Err(EngineError::InvalidOperation("script is destroyed".into()));
        }
        self.destroy();
        Ok(())
    }

    async fn post(&self, message: Value, data: Option<Bytes>) -> Result<(), EngineError> {
        if self.state() != SimScriptState::Loaded {
            return Err(EngineError::InvalidOperation("script is destroyed".into()));
        }
        self.inbox.lock().push(message.clone());
        let reaction = self.on_post.lock().clone();
        if let Some(reaction) = reaction {
            reaction(self, message, data);
        }
        Ok(())
    }

    async fn call_export(&self, name: &str, args: Vec<Value>) -> Result<Value, ExportError> {
        if self.state() != SimScriptState::Loaded {
            return Err(EngineError::InvalidOperation("script is destroyed".into()).into());
        }
        let export = self.exports.lock().get(name).cloned();
        let export = export.ok_or_else(|| ExportError::NotFound(name.to_string()))?;
        export(args).map_err(ExportError::Raised)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::EventKind;

    // `tokio_test::assert_err!` formats the `Ok` value, so the trait object needs `Debug`.
    impl std::fmt::Debug for dyn EngineScript {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dyn EngineScript")
        }
    }

    fn capture(script: &SimScript) -> Arc<Mutex<Vec<ScriptEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        script.on_message(Arc::new(move |event| sink.lock().push(event)));
        seen
    }

    #[tokio::test]
    async fn test_literal_behavior_answers_with_receipt() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        device.add_process(42, "target");
        let session = device.attach(42).await.unwrap();
        let source = envelope::EnvelopeBuilder::new("[1, 2]").build();
        let script = session.create_script(&source).await.unwrap();

        let sim = device.last_session().unwrap().last_script().unwrap();
        let seen = capture(&sim);
        script.load().await.unwrap();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 1);
        match events[0].kind() {
            EventKind::Receipt(receipt) => assert_eq!(receipt.result, json!([1, 2])),
            other => panic!("expected receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attach_errors() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        device.add_process(7, "locked");
        device.deny_attach(7);

        let missing = device.attach(1234).await.err().unwrap();
        assert_eq!(missing.to_string(), "unable to find process with pid 1234");
        let denied = device.attach(7).await.err().unwrap();
        assert!(matches!(denied, EngineError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_kill_detaches_sessions() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        device.add_process(9, "victim");
        let session = device.attach(9).await.unwrap();
        assert!(!session.is_detached());

        device.kill(9).await.unwrap();
        assert!(session.is_detached());
        assert_eq!(session.detached().await, DetachReason::ProcessTerminated);
    }

    #[tokio::test]
    async fn test_spawn_and_resume() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        let pid = assert_ok!(device.spawn("/usr/bin/true", &[]).await);
        assert!(device.is_suspended(pid));
        assert_ok!(device.resume(pid).await);
        assert!(!device.is_suspended(pid));
        assert_err!(device.resume(pid).await);
    }

    #[tokio::test]
    async fn test_unloaded_script_rejects_calls() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        device.set_behavior(|script: &SimScript| {
            script.export("ping", |_| Ok(json!("pong")));
            Ok(())
        });
        device.add_process(5, "svc");
        let session = device.attach(5).await.unwrap();
        let script = session.create_script("").await.unwrap();
        script.load().await.unwrap();
        assert_eq!(script.call_export("ping", vec![]).await.unwrap(), json!("pong"));

        script.unload().await.unwrap();
        assert!(matches!(
            script.call_export("ping", vec![]).await,
            Err(ExportError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_after_next_create() {
        let device = SimDevice::new("local", "Local", DeviceKind::Local);
        device.add_process(6, "svc");
        let session = device.attach(6).await.unwrap();
        device
            .last_session()
            .unwrap()
            .detach_after_next_create(DetachReason::ProcessTerminated);

        let script = assert_ok!(session.create_script("").await);
        assert!(session.is_detached());
        assert_err!(script.load().await);
        assert_err!(session.create_script("").await);
    }
}
