use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;
use crate::ring::{ring_name, slot_size_for, ShmRing};

/// How long a replaced ring stays mapped so the consumer can finish reading
/// frames already announced from it.
pub const RING_RETIRE_GRACE: Duration = Duration::from_millis(2000);

/// Result of writing one frame through a [`RingSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingWrite {
    pub ring_name: String,
    pub slot: usize,
    pub slot_size: usize,
}

#[derive(Debug)]
struct RetiredRing {
    ring: ShmRing,
    expires_at: Instant,
}

/// The producer's active ring plus rings retired by a resize.
///
/// When the frame size changes, the active ring is retired for
/// [`RING_RETIRE_GRACE`] instead of being unlinked immediately. Expired rings
/// are destroyed lazily on the next write; a retired ring whose slot size is
/// needed again is revived rather than re-created.
#[derive(Debug)]
pub struct RingSet {
    port: Option<u16>,
    slot_count: usize,
    grace: Duration,
    active: Option<ShmRing>,
    retired: Vec<RetiredRing>,
}

impl RingSet {
    pub fn new(slot_count: usize) -> Self {
        Self::with_grace(slot_count, RING_RETIRE_GRACE)
    }

    pub fn with_grace(slot_count: usize, grace: Duration) -> Self {
        Self {
            port: None,
            slot_count: slot_count.max(1),
            grace,
            active: None,
            retired: Vec::new(),
        }
    }

    /// Write a frame payload, creating, reviving, or retiring rings as needed.
    pub fn write_frame(
        &mut self,
        port: u16,
        payload: &[u8],
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Result<RingWrite> {
        self.write_frame_at(port, payload, frame_id, timestamp_ms, Instant::now())
    }

    fn write_frame_at(
        &mut self,
        port: u16,
        payload: &[u8],
        frame_id: u64,
        timestamp_ms: u64,
        now: Instant,
    ) -> Result<RingWrite> {
        if self.port != Some(port) {
            self.destroy_all();
            self.port = Some(port);
        }
        self.reap(now);

        let slot_size = slot_size_for(payload.len());
        let ring = self.ensure_active(port, slot_size, now)?;
        let slot = ring.write_next(payload, frame_id, timestamp_ms)?;
        Ok(RingWrite {
            ring_name: ring.name().to_string(),
            slot,
            slot_size,
        })
    }

    fn ensure_active(&mut self, port: u16, slot_size: usize, now: Instant) -> Result<&ShmRing> {
        let reusable = self
            .active
            .as_ref()
            .is_some_and(|ring| ring.slot_size() == slot_size);

        if !reusable {
            if let Some(old) = self.active.take() {
                debug!(name = old.name(), "retiring shared memory ring");
                self.retired.push(RetiredRing {
                    ring: old,
                    expires_at: now + self.grace,
                });
            }

            let ring = match self
                .retired
                .iter()
                .position(|r| r.ring.slot_size() == slot_size)
            {
                Some(pos) => {
                    let revived = self.retired.remove(pos).ring;
                    debug!(name = revived.name(), "reviving retired shared memory ring");
                    revived
                }
                None => ShmRing::create(&ring_name(port, slot_size), self.slot_count, slot_size)?,
            };
            self.active = Some(ring);
        }

        // Populated above on every path that reaches here.
        match self.active.as_ref() {
            Some(ring) => Ok(ring),
            None => Err(crate::error::TransportError::Closed),
        }
    }

    /// Destroy retired rings whose grace window has elapsed. Returns how many.
    pub fn reap(&mut self, now: Instant) -> usize {
        let before = self.retired.len();
        self.retired.retain_mut(|retired| {
            if retired.expires_at <= now {
                retired.ring.close(true);
                false
            } else {
                true
            }
        });
        before - self.retired.len()
    }

    /// Unlink and drop every ring (stream shutdown).
    pub fn destroy_all(&mut self) {
        if let Some(mut ring) = self.active.take() {
            ring.close(true);
        }
        for mut retired in self.retired.drain(..) {
            retired.ring.close(true);
        }
    }

    pub fn active(&self) -> Option<&ShmRing> {
        self.active.as_ref()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

impl Drop for RingSet {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
