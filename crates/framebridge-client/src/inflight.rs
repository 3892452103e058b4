use std::collections::VecDeque;

/// Bounded FIFO of frame ids awaiting acknowledgement.
///
/// Registering over capacity evicts the oldest id; evicted frames are lost,
/// not retried.
#[derive(Debug, Clone)]
pub struct InflightFrames {
    ids: VecDeque<u64>,
    capacity: usize,
}

impl InflightFrames {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Track `frame_id`, returning the id evicted to make room, if any.
    pub fn register(&mut self, frame_id: u64) -> Option<u64> {
        let evicted = if self.ids.len() >= self.capacity {
            self.ids.pop_front()
        } else {
            None
        };
        self.ids.push_back(frame_id);
        evicted
    }

    /// Remove an acknowledged id. Unknown ids are ignored.
    pub fn ack(&mut self, frame_id: u64) -> bool {
        match self.ids.iter().position(|id| *id == frame_id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.ids.contains(&frame_id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }
}
