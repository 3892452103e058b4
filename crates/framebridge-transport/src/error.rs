use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the loopback listener.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the loopback peer.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A shared-memory segment could not be created.
    #[error("failed to create shared memory {name}: {source}")]
    ShmCreate {
        name: String,
        source: std::io::Error,
    },

    /// An existing shared-memory segment could not be attached or is too small.
    #[error("failed to attach shared memory {name}: {reason}")]
    ShmAttach { name: String, reason: String },

    /// Ring geometry is unusable (no slots, or slots no larger than the header).
    #[error("invalid ring layout: {0}")]
    InvalidLayout(String),

    /// Slot index outside the ring.
    #[error("slot {index} out of range (ring has {slots} slots)")]
    SlotOutOfRange { index: usize, slots: usize },

    /// Payload does not fit in a slot.
    #[error("payload too large for slot ({size} bytes, capacity {capacity})")]
    PayloadTooLarge { size: usize, capacity: usize },

    /// The ring has been closed.
    #[error("shared memory ring closed")]
    Closed,
}

impl TransportError {
    /// True for errors from the shared-memory layer rather than the socket.
    pub fn is_shm(&self) -> bool {
        !matches!(
            self,
            TransportError::Bind { .. } | TransportError::Connect { .. } | TransportError::Io(_)
        )
    }

    /// True when binding failed because another process holds the port.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            TransportError::Bind { source, .. }
                if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
