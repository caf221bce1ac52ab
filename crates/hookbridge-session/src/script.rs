//! Lifecycle of one injected script unit.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use hookbridge_core::{
    EngineError, EngineScript, EventKind, ExportError, MessageQueue, ScriptEvent, ScriptId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::ExecutionOutcome;

/// Script lifecycle state.
///
/// `Loading` moves to `Transient` or `Persistent` exactly once, on the first
/// receipt or fatal error. `Transient` always ends in `Unloaded`; `Persistent`
/// only does so on explicit unload or session teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    Loading,
    Transient,
    Persistent,
    Unloaded,
}

/// Script description returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSummary {
    pub script_id: ScriptId,
    pub state: ScriptState,
}

struct HandleInner {
    state: ScriptState,
    pending: Option<oneshot::Sender<ExecutionOutcome>>,
}

/// One script unit and its correlation state.
///
/// All engine events go through [`ScriptHandle::dispatch`], which branches on
/// the current state under one lock: while loading, the first receipt answers
/// the pending call; once persistent, every event is queued.
pub struct ScriptHandle {
    id: ScriptId,
    keep_alive: bool,
    script: Arc<dyn EngineScript>,
    queue: Arc<MessageQueue>,
    inner: Mutex<HandleInner>,
}

impl ScriptHandle {
    /// Wrap an engine script and install the dispatching handler.
    ///
    /// Returns the receiver for the single correlated outcome.
    pub(crate) fn new(
        id: ScriptId,
        script: Arc<dyn EngineScript>,
        keep_alive: bool,
        queue: Arc<MessageQueue>,
    ) -> (Arc<Self>, oneshot::Receiver<ExecutionOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(Self {
            id,
            keep_alive,
            script,
            queue,
            inner: Mutex::new(HandleInner {
                state: ScriptState::Loading,
                pending: Some(tx),
            }),
        });

        // Weak: the engine script owns the handler and the handle owns the script.
        let weak: Weak<Self> = Arc::downgrade(&handle);
        handle.script.on_message(Arc::new(move |event| {
            if let Some(handle) = weak.upgrade() {
                handle.dispatch(event);
            }
        }));

        (handle, rx)
    }

    #[must_use]
    pub const fn id(&self) -> ScriptId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ScriptState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn summary(&self) -> ScriptSummary {
        ScriptSummary {
            script_id: self.id,
            state: self.state(),
        }
    }

    /// Route one engine event according to the current state.
    pub fn dispatch(&self, event: ScriptEvent) {
        let mut inner = self.inner.lock();
        match inner.state {
            ScriptState::Loading => {
                let outcome = match event.kind() {
                    EventKind::Receipt(receipt) => ExecutionOutcome::from_receipt(receipt),
                    EventKind::Fatal { description, stack } => {
                        ExecutionOutcome::fatal(description, stack)
                    }
                    EventKind::Other => {
                        tracing::debug!(
                            script_id = self.id,
                            kind = event.type_name(),
                            "Dropping event received before execution receipt"
                        );
                        return;
                    }
                };
                inner.state = if self.keep_alive {
                    ScriptState::Persistent
                } else {
                    ScriptState::Transient
                };
                if let Some(tx) = inner.pending.take() {
                    let _ = tx.send(outcome);
                }
            }
            ScriptState::Persistent => self.queue.enqueue(event),
            ScriptState::Transient | ScriptState::Unloaded => {
                tracing::trace!(script_id = self.id, state = ?inner.state, "Ignoring event");
            }
        }
    }

    /// Give up on a pending correlation. The handle becomes transient, so
    /// late events are ignored and the caller is expected to unload it.
    ///
    /// Returns `false` when an outcome was already produced, in which case it
    /// is waiting in the receiver.
    pub(crate) fn expire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ScriptState::Loading {
            return false;
        }
        inner.state = ScriptState::Transient;
        inner.pending = None;
        true
    }

    /// Mark unloaded without touching the engine. Returns the previous state.
    pub(crate) fn retire(&self) -> ScriptState {
        let mut inner = self.inner.lock();
        inner.pending = None;
        std::mem::replace(&mut inner.state, ScriptState::Unloaded)
    }

    /// Unload the engine script. A no-op if already unloaded.
    pub(crate) async fn unload(&self) -> Result<(), EngineError> {
        if self.retire() == ScriptState::Unloaded {
            return Ok(());
        }
        self.script.unload().await
    }

    pub(crate) async fn call_export(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExportError> {
        self.script.call_export(name, args).await
    }

    pub(crate) async fn post(
        &self,
        message: Value,
        data: Option<Bytes>,
    ) -> Result<(), EngineError> {
        self.script.post(message, data).await
    }
}
