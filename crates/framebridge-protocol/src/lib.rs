//! Control protocol for framebridge.
//!
//! Control messages are MessagePack maps carried in length-prefixed frames.
//! Decoding accepts three layouts (canonical `{type, payload}`, single-key
//! `{type: payload}`, and positional `[type, payload]`) and normalizes them
//! into a typed [`ControlMessage`]. Encoding always produces the canonical
//! layout unless a [`WireShape`] is requested explicitly.

pub mod code;
pub mod codec;
pub mod constants;
pub mod error;
pub mod message;
pub mod msgpack;
pub mod value;

pub use code::ErrorCode;
#[cfg(feature = "rmp")]
pub use codec::RmpCodec;
pub use codec::{default_codec, CompactCodec, ValueCodec};
pub use constants::*;
pub use error::{ProtocolError, Result};
pub use message::{
    decode_control_message, decode_with, encode_control_frame, encode_control_message,
    encode_shaped, normalize_transport, now_millis, parse_hello_ack, Ack, ControlMessage,
    ErrorMessage, FrameMeta, Heartbeat, Hello, HelloAck, MessageType, StartStream, StopStream,
    TransportKind, WireShape,
};
pub use value::Value;

/// Pure message constructors.
pub mod build {
    pub use crate::message::{
        ack, error, frame_meta, heartbeat, heartbeat_with_target, hello, hello_ack, start_stream,
        stop_stream,
    };
}
