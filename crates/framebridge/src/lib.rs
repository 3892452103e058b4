//! Stream rendered frames between two local processes.
//!
//! A producer connects to a consumer on `127.0.0.1`, negotiates a transport,
//! and ships RGBA frames either through a shared-memory ring (`shm`) or as
//! LZ4-compressed chunks on the socket (`tcp_lz4`).
//!
//! # Crate Structure
//!
//! - [`frame`]: length-prefixed framing
//! - [`protocol`]: MessagePack control messages and error codes
//! - [`transport`]: loopback TCP, shared memory, frame rings
//! - [`client`]: connection manager, frame sender, consumer peer (behind the
//!   `client` feature)

/// Re-export framing types.
pub mod frame {
    pub use framebridge_frame::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use framebridge_protocol::*;
}

/// Re-export transport types.
pub mod transport {
    pub use framebridge_transport::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use framebridge_client::*;
}
