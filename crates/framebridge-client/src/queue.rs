use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

pub const SEND_QUEUE_CAPACITY: usize = 512;

/// What happened to a buffer offered to [`SendQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; its oldest buffer was discarded.
    DroppedOldest,
    /// Nothing could be queued (zero capacity).
    Rejected,
}

/// Bounded FIFO of already-framed outbound buffers.
///
/// `push` never blocks: when full, the oldest buffer is dropped to admit the
/// newest.
#[derive(Debug)]
pub struct SendQueue {
    items: Mutex<VecDeque<Bytes>>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(SEND_QUEUE_CAPACITY))),
            capacity,
        }
    }

    pub fn push(&self, framed: Bytes) -> PushOutcome {
        let mut items = self.lock();
        if items.len() < self.capacity {
            items.push_back(framed);
            return PushOutcome::Queued;
        }
        if items.pop_front().is_none() {
            return PushOutcome::Rejected;
        }
        items.push_back(framed);
        PushOutcome::DroppedOldest
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.lock().pop_front()
    }

    /// Discard everything queued. Returns how many buffers were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(SEND_QUEUE_CAPACITY)
    }
}
