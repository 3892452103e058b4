use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::shm::ShmSegment;

/// Per-slot header: `seq:u32, payloadLen:u32, frameId:u64, timestampMs:u64`,
/// little-endian.
pub const SLOT_HEADER_BYTES: usize = 24;

const SEQ_OFFSET: usize = 0;
const LEN_OFFSET: usize = 4;
const FRAME_ID_OFFSET: usize = 8;
const TIMESTAMP_OFFSET: usize = 16;

/// Shared-memory name for a ring carrying `slot_size`-byte slots.
pub fn ring_name(port: u16, slot_size: usize) -> String {
    format!("sutu_bridge_v2_{port}_{slot_size}")
}

/// Slot size needed to hold a payload of `payload_len` bytes.
pub fn slot_size_for(payload_len: usize) -> usize {
    SLOT_HEADER_BYTES + payload_len
}

/// Ring geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingLayout {
    pub name: String,
    pub slot_count: usize,
    pub slot_size: usize,
}

impl RingLayout {
    pub fn new(name: impl Into<String>, slot_count: usize, slot_size: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(TransportError::InvalidLayout(
                "slot_count must be greater than 0".to_string(),
            ));
        }
        if slot_size <= SLOT_HEADER_BYTES {
            return Err(TransportError::InvalidLayout(format!(
                "slot_size must exceed the {SLOT_HEADER_BYTES}-byte header, got {slot_size}"
            )));
        }
        let layout = Self {
            name: name.into(),
            slot_count,
            slot_size,
        };
        if layout.slot_count.checked_mul(layout.slot_size).is_none() {
            return Err(TransportError::InvalidLayout("ring size overflows".to_string()));
        }
        Ok(layout)
    }

    pub fn total_size(&self) -> usize {
        self.slot_count * self.slot_size
    }

    pub fn payload_capacity(&self) -> usize {
        self.slot_size - SLOT_HEADER_BYTES
    }
}

/// A consistent snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRead {
    pub seq: u32,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

/// Fixed-slot frame ring in shared memory.
///
/// Each slot is guarded by a sequence counter: odd while a write is in
/// progress, even once committed. Readers in another process compare the
/// counter before and after copying and discard torn reads. Writers within
/// this process serialize on a local mutex.
#[derive(Debug)]
pub struct ShmRing {
    layout: RingLayout,
    segment: Option<ShmSegment>,
    next_slot: Mutex<usize>,
}

impl ShmRing {
    /// Exclusively create the ring. If the name already exists, attach to it
    /// as a non-owner after verifying it is large enough.
    pub fn create(name: &str, slot_count: usize, slot_size: usize) -> Result<Self> {
        let layout = RingLayout::new(name, slot_count, slot_size)?;
        let segment = match ShmSegment::create(name, layout.total_size()) {
            Ok(segment) => segment,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(name, "shared memory ring already exists, attaching");
                open_checked(&layout)?
            }
            Err(source) => {
                return Err(TransportError::ShmCreate {
                    name: name.to_string(),
                    source,
                })
            }
        };
        debug!(
            name,
            slot_count,
            slot_size,
            owner = segment.is_owner(),
            "shared memory ring ready"
        );
        Ok(Self {
            layout,
            segment: Some(segment),
            next_slot: Mutex::new(0),
        })
    }

    /// Attach to an existing ring without taking ownership.
    pub fn attach(name: &str, slot_count: usize, slot_size: usize) -> Result<Self> {
        let layout = RingLayout::new(name, slot_count, slot_size)?;
        let segment = open_checked(&layout)?;
        Ok(Self {
            layout,
            segment: Some(segment),
            next_slot: Mutex::new(0),
        })
    }

    /// Attach knowing only the slot size; the slot count is derived from the
    /// segment length. Used by consumers that learn geometry from `frame_meta`.
    pub fn attach_sized(name: &str, slot_size: usize) -> Result<Self> {
        let min_layout = RingLayout::new(name, 1, slot_size)?;
        let segment = open_checked(&min_layout)?;
        let layout = RingLayout::new(name, segment.len() / slot_size, slot_size)?;
        Ok(Self {
            layout,
            segment: Some(segment),
            next_slot: Mutex::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.layout.name
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn slot_count(&self) -> usize {
        self.layout.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.layout.slot_size
    }

    pub fn payload_capacity(&self) -> usize {
        self.layout.payload_capacity()
    }

    pub fn is_owner(&self) -> bool {
        self.segment.as_ref().is_some_and(ShmSegment::is_owner)
    }

    pub fn is_closed(&self) -> bool {
        self.segment.is_none()
    }

    /// Write into the next slot in round-robin order; returns the slot index.
    pub fn write_next(&self, payload: &[u8], frame_id: u64, timestamp_ms: u64) -> Result<usize> {
        let segment = self.segment.as_ref().ok_or(TransportError::Closed)?;
        self.check_payload(payload)?;

        let mut next = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = *next;
        *next = (index + 1) % self.layout.slot_count;
        self.write_locked(segment, index, payload, frame_id, timestamp_ms);
        Ok(index)
    }

    /// Write into a specific slot.
    pub fn write_slot(
        &self,
        index: usize,
        payload: &[u8],
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Result<usize> {
        let segment = self.segment.as_ref().ok_or(TransportError::Closed)?;
        self.check_index(index)?;
        self.check_payload(payload)?;

        let _guard = self
            .next_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.write_locked(segment, index, payload, frame_id, timestamp_ms);
        Ok(index)
    }

    /// Read a slot. Returns `None` if a write is in progress or raced the read.
    pub fn read_slot(&self, index: usize) -> Result<Option<SlotRead>> {
        let segment = self.segment.as_ref().ok_or(TransportError::Closed)?;
        self.check_index(index)?;
        let base = self.slot_ptr(segment, index);

        // SAFETY: base points at a full slot inside the live mapping.
        unsafe {
            let seq_before = read_u32(base.add(SEQ_OFFSET));
            if seq_before & 1 == 1 {
                return Ok(None);
            }
            fence(Ordering::Acquire);

            let len = read_u32(base.add(LEN_OFFSET)) as usize;
            let frame_id = read_u64(base.add(FRAME_ID_OFFSET));
            let timestamp_ms = read_u64(base.add(TIMESTAMP_OFFSET));
            if len > self.layout.payload_capacity() {
                return Ok(None);
            }
            let mut payload = vec![0u8; len];
            ptr::copy_nonoverlapping(base.add(SLOT_HEADER_BYTES), payload.as_mut_ptr(), len);

            fence(Ordering::Acquire);
            let seq_after = read_u32(base.add(SEQ_OFFSET));
            if seq_before != seq_after {
                return Ok(None);
            }

            Ok(Some(SlotRead {
                seq: seq_before,
                frame_id,
                timestamp_ms,
                payload: Bytes::from(payload),
            }))
        }
    }

    /// Unmap the ring; the owner also unlinks the name when `unlink` is set.
    /// Idempotent.
    pub fn close(&mut self, unlink: bool) {
        let Some(mut segment) = self.segment.take() else {
            return;
        };
        if unlink {
            if let Err(err) = segment.unlink() {
                warn!(name = %self.layout.name, error = %err, "failed to unlink shared memory ring");
            }
        }
        debug!(name = %self.layout.name, unlink, "closed shared memory ring");
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.layout.slot_count {
            return Err(TransportError::SlotOutOfRange {
                index,
                slots: self.layout.slot_count,
            });
        }
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        let capacity = self.layout.payload_capacity();
        if payload.len() > capacity || u32::try_from(payload.len()).is_err() {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                capacity,
            });
        }
        Ok(())
    }

    fn slot_ptr(&self, segment: &ShmSegment, index: usize) -> *mut u8 {
        // SAFETY: index < slot_count and the mapping spans total_size bytes.
        unsafe { segment.as_ptr().add(index * self.layout.slot_size) }
    }

    /// Seqlock write. Caller holds `next_slot` and has validated index/payload.
    fn write_locked(
        &self,
        segment: &ShmSegment,
        index: usize,
        payload: &[u8],
        frame_id: u64,
        timestamp_ms: u64,
    ) {
        let base = self.slot_ptr(segment, index);

        // SAFETY: base points at a full slot inside the live mapping and the
        // payload fits in the slot's capacity.
        unsafe {
            let mut committed = read_u32(base.add(SEQ_OFFSET));
            if committed & 1 == 1 {
                committed = committed.wrapping_add(1);
            }

            write_u32(base.add(SEQ_OFFSET), committed.wrapping_add(1));
            fence(Ordering::Release);

            write_u32(base.add(LEN_OFFSET), payload.len() as u32);
            write_u64(base.add(FRAME_ID_OFFSET), frame_id);
            write_u64(base.add(TIMESTAMP_OFFSET), timestamp_ms);
            ptr::copy_nonoverlapping(payload.as_ptr(), base.add(SLOT_HEADER_BYTES), payload.len());

            fence(Ordering::Release);
            write_u32(base.add(SEQ_OFFSET), committed.wrapping_add(2));
        }
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        let owner = self.is_owner();
        self.close(owner);
    }
}

fn open_checked(layout: &RingLayout) -> Result<ShmSegment> {
    let segment = ShmSegment::open(&layout.name).map_err(|err| TransportError::ShmAttach {
        name: layout.name.clone(),
        reason: err.to_string(),
    })?;
    if segment.len() < layout.total_size() {
        return Err(TransportError::ShmAttach {
            name: layout.name.clone(),
            reason: format!(
                "existing segment too small: {} < {}",
                segment.len(),
                layout.total_size()
            ),
        });
    }
    Ok(segment)
}

// Header fields are not necessarily aligned (slot sizes are arbitrary), so
// they are accessed as volatile byte arrays.

unsafe fn read_u32(p: *const u8) -> u32 {
    u32::from_le_bytes(ptr::read_volatile(p.cast::<[u8; 4]>()))
}

unsafe fn read_u64(p: *const u8) -> u64 {
    u64::from_le_bytes(ptr::read_volatile(p.cast::<[u8; 8]>()))
}

unsafe fn write_u32(p: *mut u8, value: u32) {
    ptr::write_volatile(p.cast::<[u8; 4]>(), value.to_le_bytes());
}

unsafe fn write_u64(p: *mut u8, value: u64) {
    ptr::write_volatile(p.cast::<[u8; 8]>(), value.to_le_bytes());
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "fbr_{}_{}_{tag}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn ring_name_encodes_port_and_slot_size() {
        assert_eq!(ring_name(30121, 88), "sutu_bridge_v2_30121_88");
        assert_eq!(slot_size_for(64), 88);
    }

    #[test]
    fn layout_validation() {
        assert!(matches!(
            RingLayout::new("x", 0, 64),
            Err(TransportError::InvalidLayout(_))
        ));
        assert!(matches!(
            RingLayout::new("x", 3, SLOT_HEADER_BYTES),
            Err(TransportError::InvalidLayout(_))
        ));
        let layout = RingLayout::new("x", 3, 64).unwrap();
        assert_eq!(layout.total_size(), 192);
        assert_eq!(layout.payload_capacity(), 40);
    }

    #[test]
    fn write_next_round_robins() {
        let name = unique_name("rr");
        let ring = ShmRing::create(&name, 3, slot_size_for(8)).unwrap();
        assert!(ring.is_owner());

        let slots: Vec<usize> = (0..7u64)
            .map(|i| ring.write_next(&i.to_le_bytes(), i, 100 + i).unwrap())
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);

        let read = ring.read_slot(1).unwrap().unwrap();
        assert_eq!(read.frame_id, 4);
        assert_eq!(read.timestamp_ms, 104);
        assert_eq!(read.payload.as_ref(), &4u64.to_le_bytes());
        assert_eq!(read.seq % 2, 0);
    }

    #[test]
    fn seq_advances_by_two_per_write() {
        let name = unique_name("seq");
        let ring = ShmRing::create(&name, 1, slot_size_for(4)).unwrap();
        ring.write_slot(0, b"aaaa", 1, 1).unwrap();
        let first = ring.read_slot(0).unwrap().unwrap().seq;
        ring.write_slot(0, b"bb", 2, 2).unwrap();
        let second = ring.read_slot(0).unwrap().unwrap();
        assert_eq!(second.seq, first + 2);
        assert_eq!(second.payload.as_ref(), b"bb");
    }

    #[test]
    fn rejects_bad_index_and_oversized_payload() {
        let name = unique_name("bad");
        let ring = ShmRing::create(&name, 2, slot_size_for(4)).unwrap();
        assert!(matches!(
            ring.write_slot(2, b"x", 1, 1),
            Err(TransportError::SlotOutOfRange { index: 2, slots: 2 })
        ));
        assert!(matches!(
            ring.write_next(b"12345", 1, 1),
            Err(TransportError::PayloadTooLarge {
                size: 5,
                capacity: 4
            })
        ));
        assert!(ring.read_slot(5).is_err());
    }

    #[test]
    fn attach_reads_owner_writes() {
        let name = unique_name("att");
        let owner = ShmRing::create(&name, 2, slot_size_for(16)).unwrap();
        owner.write_slot(1, b"shared", 9, 42).unwrap();

        let reader = ShmRing::attach(&name, 2, slot_size_for(16)).unwrap();
        assert!(!reader.is_owner());
        let read = reader.read_slot(1).unwrap().unwrap();
        assert_eq!(read.payload.as_ref(), b"shared");
        assert_eq!(read.frame_id, 9);
    }

    #[test]
    fn attach_sized_derives_slot_count() {
        let name = unique_name("sized");
        let owner = ShmRing::create(&name, 3, slot_size_for(8)).unwrap();
        owner.write_slot(2, b"last", 3, 3).unwrap();

        let reader = ShmRing::attach_sized(&name, slot_size_for(8)).unwrap();
        assert!(reader.slot_count() >= 3);
        assert_eq!(reader.read_slot(2).unwrap().unwrap().payload.as_ref(), b"last");
    }

    #[test]
    fn collision_attaches_when_large_enough_and_fails_when_too_small() {
        let name = unique_name("col");
        let _owner = ShmRing::create(&name, 2, 64).unwrap();

        let smaller = ShmRing::create(&name, 2, 32).unwrap();
        assert!(!smaller.is_owner());

        let err = ShmRing::create(&name, 8, 4096).unwrap_err();
        assert!(matches!(err, TransportError::ShmAttach { .. }));
        assert!(err.is_shm());
    }

    #[test]
    fn only_owner_unlinks() {
        let name = unique_name("own");
        let mut owner = ShmRing::create(&name, 1, 64).unwrap();
        let mut other = ShmRing::attach(&name, 1, 64).unwrap();

        other.close(true);
        assert!(other.is_closed());
        assert!(ShmRing::attach(&name, 1, 64).is_ok());

        owner.close(true);
        assert!(matches!(
            ShmRing::attach(&name, 1, 64),
            Err(TransportError::ShmAttach { .. })
        ));
        assert!(matches!(
            owner.write_next(b"x", 1, 1),
            Err(TransportError::Closed)
        ));
        owner.close(true);
    }

    #[test]
    fn drop_unlinks_owned_ring() {
        let name = unique_name("drop");
        {
            let _ring = ShmRing::create(&name, 1, 64).unwrap();
        }
        assert!(ShmRing::attach(&name, 1, 64).is_err());
    }

    #[test]
    fn concurrent_reader_never_sees_torn_frame() {
        const PAYLOAD: usize = 4096;
        let name = unique_name("torn");
        let writer = Arc::new(ShmRing::create(&name, 1, slot_size_for(PAYLOAD)).unwrap());
        let reader = ShmRing::attach(&name, 1, slot_size_for(PAYLOAD)).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let writer_thread = {
            let writer = Arc::clone(&writer);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for frame_id in 1..=2000u64 {
                    let len = 1 + (frame_id as usize * 37) % PAYLOAD;
                    let payload = vec![frame_id as u8; len];
                    writer.write_slot(0, &payload, frame_id, frame_id * 10).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        while !done.load(Ordering::SeqCst) {
            if let Some(read) = reader.read_slot(0).unwrap() {
                if read.frame_id == 0 {
                    continue;
                }
                let expected_len = 1 + (read.frame_id as usize * 37) % PAYLOAD;
                assert_eq!(read.payload.len(), expected_len);
                assert_eq!(read.timestamp_ms, read.frame_id * 10);
                assert!(read.payload.iter().all(|b| *b == read.frame_id as u8));
            }
        }
        writer_thread.join().unwrap();

        let last = reader.read_slot(0).unwrap().unwrap();
        assert_eq!(last.frame_id, 2000);
    }
}
