//! Session registry: attach, lookup and teardown.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use hookbridge_core::{
    BridgeConfig, Device, Drained, EngineError, EngineSession, MessageQueue, Platform, QueueLimits,
    ScriptId, SessionId,
    traits::{DeviceInfo, DeviceKind},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use uuid::Uuid;

use crate::{
    BridgeError,
    script::{ScriptHandle, ScriptState, ScriptSummary},
};

type SessionMap = RwLock<HashMap<SessionId, Arc<Session>>>;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Remove a record. Shared by explicit teardown and the detach watcher.
async fn take_record(sessions: &SessionMap, id: SessionId) -> Option<Arc<Session>> {
    sessions.write().await.remove(&id)
}

/// Session description returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub pid: u32,
    pub device_id: String,
    pub scripts: Vec<ScriptSummary>,
    pub pending_messages: usize,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
}

/// One attachment to a target process, its scripts and its message queue.
pub struct Session {
    id: SessionId,
    pid: u32,
    device: DeviceInfo,
    engine: Arc<dyn EngineSession>,
    scripts: Mutex<Vec<Arc<ScriptHandle>>>,
    queue: Arc<MessageQueue>,
    next_script_id: AtomicU32,
    created_at: i64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn new(
        id: SessionId,
        device: DeviceInfo,
        engine: Arc<dyn EngineSession>,
        limits: QueueLimits,
    ) -> Self {
        Self {
            id,
            pid: engine.pid(),
            device,
            engine,
            scripts: Mutex::new(Vec::new()),
            queue: Arc::new(MessageQueue::new(limits)),
            next_script_id: AtomicU32::new(1),
            created_at: now_millis(),
            watcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub const fn device(&self) -> &DeviceInfo {
        &self.device
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.engine.is_detached()
    }

    /// The script RPC calls and posts go to when none is named: the most
    /// recently created script that is still persistent.
    #[must_use]
    pub fn current_script(&self) -> Option<Arc<ScriptHandle>> {
        self.scripts
            .lock()
            .iter()
            .rev()
            .find(|h| h.state() == ScriptState::Persistent)
            .cloned()
    }

    /// Look up a script by id.
    #[must_use]
    pub fn script(&self, id: ScriptId) -> Option<Arc<ScriptHandle>> {
        self.scripts.lock().iter().find(|h| h.id() == id).cloned()
    }

    /// Resolve an explicit script id, or the current script when `None`.
    ///
    /// # Errors
    /// Returns error if there is no matching persistent script.
    pub fn target_script(&self, id: Option<ScriptId>) -> Result<Arc<ScriptHandle>, BridgeError> {
        match id {
            None => self.current_script().ok_or(BridgeError::NoActiveScript(self.id)),
            Some(script_id) => {
                let handle = self.script(script_id).ok_or(BridgeError::ScriptNotFound {
                    session_id: self.id,
                    script_id,
                })?;
                if handle.state() == ScriptState::Persistent {
                    Ok(handle)
                } else {
                    Err(BridgeError::NoActiveScript(self.id))
                }
            }
        }
    }

    /// Scripts that are not unloaded, in creation order.
    #[must_use]
    pub fn scripts(&self) -> Vec<ScriptSummary> {
        self.scripts
            .lock()
            .iter()
            .map(|h| h.summary())
            .filter(|s| s.state != ScriptState::Unloaded)
            .collect()
    }

    #[must_use]
    pub fn script_count(&self) -> usize {
        self.scripts().len()
    }

    /// Take all queued messages.
    #[must_use]
    pub fn drain_messages(&self) -> Drained {
        self.queue.drain()
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            pid: self.pid,
            device_id: self.device.id.clone(),
            scripts: self.scripts(),
            pending_messages: self.queue.len(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn EngineSession> {
        &self.engine
    }

    pub(crate) fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub(crate) fn allocate_script_id(&self) -> ScriptId {
        self.next_script_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_script(&self, handle: Arc<ScriptHandle>) {
        self.scripts.lock().push(handle);
    }

    pub(crate) fn remove_script(&self, id: ScriptId) -> Option<Arc<ScriptHandle>> {
        let mut scripts = self.scripts.lock();
        let index = scripts.iter().position(|h| h.id() == id)?;
        Some(scripts.remove(index))
    }

    fn take_scripts(&self) -> Vec<Arc<ScriptHandle>> {
        std::mem::take(&mut *self.scripts.lock())
    }

    /// Forget every handle; pending executions resolve as gone.
    fn retire_scripts(&self) {
        for handle in self.take_scripts() {
            handle.retire();
        }
    }

    fn stop_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

/// Registry of live sessions.
///
/// A record is removed on explicit teardown or when the engine reports the
/// attach handle gone. The detach notification comes from the engine only.
pub struct SessionRegistry {
    platform: Arc<dyn Platform>,
    config: BridgeConfig,
    sessions: Arc<SessionMap>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, config: BridgeConfig) -> Self {
        Self {
            platform,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolve a device: explicit id, then the configured default, then the
    /// first USB device.
    ///
    /// # Errors
    /// Returns `DeviceNotFound` if nothing matches.
    pub async fn resolve_device(
        &self,
        selector: Option<&str>,
    ) -> Result<Arc<dyn Device>, BridgeError> {
        let id = match selector.or(self.config.default_device.as_deref()) {
            Some(id) => id.to_string(),
            None => self
                .platform
                .list_devices()
                .await?
                .into_iter()
                .find(|d| d.kind == DeviceKind::Usb)
                .map(|d| d.id)
                .ok_or_else(|| BridgeError::DeviceNotFound("no USB device connected".into()))?,
        };
        self.platform.get_device(&id).await.map_err(|e| match e {
            EngineError::NotFound(_) => BridgeError::DeviceNotFound(id),
            other => BridgeError::Engine(other),
        })
    }

    /// Attach to `pid` and register a new session.
    ///
    /// # Errors
    /// Returns `AttachFailure` with the engine's message if the attach fails.
    pub async fn create_session(
        &self,
        pid: u32,
        device: Option<&str>,
    ) -> Result<SessionId, BridgeError> {
        let device = self.resolve_device(device).await?;
        let engine = device
            .attach(pid)
            .await
            .map_err(|e| BridgeError::AttachFailure(e.to_string()))?;

        let id = Uuid::new_v4();
        let info = device.info();
        let session = Arc::new(Session::new(
            id,
            info.clone(),
            Arc::clone(&engine),
            self.config.queue,
        ));
        self.sessions.write().await.insert(id, Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        let watcher = tokio::spawn(async move {
            let reason = engine.detached().await;
            tracing::info!(session_id = %id, ?reason, "Session detached");
            if let Some(session) = take_record(&sessions, id).await {
                session.retire_scripts();
            }
        });
        *session.watcher.lock() = Some(watcher);

        tracing::info!(session_id = %id, pid, device = %info.id, "Session created");
        Ok(id)
    }

    /// Look up a live session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` for unknown or detached sessions.
    pub async fn get(&self, id: SessionId) -> Result<Arc<Session>, BridgeError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .filter(|s| !s.is_detached())
            .cloned()
            .ok_or(BridgeError::SessionNotFound(id))
    }

    /// Drop a session record and invalidate its script handles.
    ///
    /// Does not talk to the engine. Returns whether a record was removed.
    pub async fn remove(&self, id: SessionId) -> bool {
        let Some(session) = take_record(&self.sessions, id).await else {
            return false;
        };
        session.stop_watcher();
        session.retire_scripts();
        true
    }

    /// Explicit teardown: remove the record, unload its scripts and detach.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session is unknown.
    pub async fn detach(&self, id: SessionId) -> Result<(), BridgeError> {
        let session = take_record(&self.sessions, id)
            .await
            .ok_or(BridgeError::SessionNotFound(id))?;
        session.stop_watcher();

        for handle in session.take_scripts() {
            if let Err(e) = handle.unload().await {
                tracing::warn!(
                    session_id = %id,
                    script_id = handle.id(),
                    "Failed to unload script: {e}"
                );
            }
        }
        if !session.is_detached() {
            if let Err(e) = session.engine().detach().await {
                tracing::warn!(session_id = %id, "Failed to detach session: {e}");
            }
        }

        tracing::info!(session_id = %id, "Session closed");
        Ok(())
    }

    /// Live sessions, newest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut result: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_detached())
            .map(|s| s.info())
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    /// Number of registered sessions, including ones whose removal is pending.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tear down every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            // The detach watcher may have removed it first.
            if let Err(e) = self.detach(id).await {
                tracing::debug!(session_id = %id, "Skipping session during shutdown: {e}");
            }
        }
    }
}
