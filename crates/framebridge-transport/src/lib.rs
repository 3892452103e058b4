//! Transports for framebridge.
//!
//! - Loopback TCP helpers for the control/data socket
//! - POSIX shared-memory segments (Unix only)
//! - A seqlock-guarded frame ring over shared memory, and a ring set that
//!   retires rings on resize
//!
//! This is the lowest layer of framebridge next to the framing codec.

pub mod error;
pub mod ring;
pub mod ring_set;
pub mod shm;
pub mod tcp;

pub use error::{Result, TransportError};
pub use ring::{ring_name, slot_size_for, RingLayout, ShmRing, SlotRead, SLOT_HEADER_BYTES};
pub use ring_set::{RingSet, RingWrite, RING_RETIRE_GRACE};
pub use shm::ShmSegment;
pub use tcp::{bind_loopback, connect_loopback, loopback_addr, port_available};
