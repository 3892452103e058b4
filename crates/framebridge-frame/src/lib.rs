//! Length-prefixed message framing for the framebridge stream.
//!
//! Every message on the socket is framed with a 4-byte big-endian payload
//! length followed by the payload. Control messages and binary frame chunks
//! share the same framing; only their size limits differ.
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
#[cfg(feature = "async")]
pub mod codec_async;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, encode_frame_into, FrameConfig, FrameDecoder, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAX_BINARY_FRAME_BYTES, MAX_CONTROL_MESSAGE_BYTES,
};
#[cfg(feature = "async")]
pub use codec_async::{framed, BridgeCodec};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
