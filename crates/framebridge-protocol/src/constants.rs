pub use framebridge_frame::{MAX_BINARY_FRAME_BYTES, MAX_CONTROL_MESSAGE_BYTES};

pub const PROTOCOL_MAGIC: &str = "SUTU_BRIDGE_V2";
pub const PROTOCOL_VERSION: i64 = 2;

pub const DEFAULT_CAPABILITIES: [&str; 3] = ["shm_ring", "tcp_lz4", "chunked_frame"];
pub const PIXEL_FORMAT_RGBA8: &str = "rgba8";

pub const TRANSPORT_SHM: &str = "shm";
pub const TRANSPORT_TCP_LZ4: &str = "tcp_lz4";

pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;
pub const MAX_INFLIGHT_FRAMES: usize = 3;

pub const DEFAULT_PORT: u16 = 30121;
pub const MIN_PORT: u16 = 1024;
