//! Drainable per-session queue of asynchronous script output.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{QueuedMessage, ScriptEvent, config::QueueLimits};

struct StoredMsg {
    msg: QueuedMessage,
    bytes: usize,
}

struct Inner {
    entries: VecDeque<StoredMsg>,
    total_bytes: usize,
    dropped: u64,
}

/// Result of a drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Drained {
    /// Entries in arrival order.
    pub messages: Vec<QueuedMessage>,
    /// Entries evicted since the previous drain because a limit was hit.
    pub dropped: u64,
}

/// FIFO buffer with consume-once reads.
///
/// Bounded by entry count and approximate size; the oldest entries are
/// evicted first.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    limits: QueueLimits,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}

impl MessageQueue {
    /// Create a queue with the given limits.
    #[must_use]
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(32),
                total_bytes: 0,
                dropped: 0,
            }),
            limits,
        }
    }

    /// Append an event.
    pub fn enqueue(&self, event: ScriptEvent) {
        let bytes = event.approx_bytes();
        let msg = QueuedMessage::from(event);

        let mut inner = self.inner.lock();
        let mut evicted = 0u64;
        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.limits.max_messages
                || inner.total_bytes.saturating_add(bytes) > self.limits.max_bytes)
        {
            if let Some(front) = inner.entries.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
                evicted += 1;
            }
        }
        if evicted > 0 {
            inner.dropped += evicted;
            tracing::debug!(
                evicted,
                total_dropped = inner.dropped,
                "message queue full, evicted oldest entries"
            );
        }
        inner.entries.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Take every queued entry, leaving the queue empty.
    #[must_use]
    pub fn drain(&self) -> Drained {
        let mut inner = self.inner.lock();
        let entries = std::mem::take(&mut inner.entries);
        inner.total_bytes = 0;
        Drained {
            messages: entries.into_iter().map(|s| s.msg).collect(),
            dropped: std::mem::take(&mut inner.dropped),
        }
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(n: u64) -> ScriptEvent {
        ScriptEvent::new(json!({"type": "send", "payload": n}))
    }

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let queue = MessageQueue::default();
        for n in 0..5 {
            queue.enqueue(event(n));
        }
        assert_eq!(queue.len(), 5);

        let drained = queue.drain();
        let payloads: Vec<_> = drained
            .messages
            .iter()
            .map(|m| m.message["payload"].clone())
            .collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(drained.dropped, 0);

        assert!(queue.is_empty());
        assert_eq!(queue.drain(), Drained::default());
    }

    #[test]
    fn test_count_limit_evicts_oldest() {
        let queue = MessageQueue::new(QueueLimits {
            max_messages: 3,
            ..QueueLimits::default()
        });
        for n in 0..5 {
            queue.enqueue(event(n));
        }

        let drained = queue.drain();
        assert_eq!(drained.dropped, 2);
        assert_eq!(drained.messages.first().map(|m| m.message["payload"].clone()), Some(json!(2)));
        assert_eq!(drained.messages.len(), 3);

        queue.enqueue(event(9));
        assert_eq!(queue.drain().dropped, 0);
    }

    #[test]
    fn test_byte_limit_keeps_latest_entry() {
        let big = ScriptEvent::with_data(json!({"type": "send"}), Some(vec![0u8; 256].into()));
        let queue = MessageQueue::new(QueueLimits {
            max_messages: 100,
            max_bytes: 300,
        });
        queue.enqueue(big.clone());
        queue.enqueue(big);

        let drained = queue.drain();
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.dropped, 1);
    }
}
