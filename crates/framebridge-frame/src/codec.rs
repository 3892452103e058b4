use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: big-endian payload length.
pub const HEADER_SIZE: usize = 4;

/// Maximum encoded control message: 1 MiB.
pub const MAX_CONTROL_MESSAGE_BYTES: usize = 1024 * 1024;

/// Maximum single binary chunk: 128 MiB.
pub const MAX_BINARY_FRAME_BYTES: usize = 128 * 1024 * 1024;

/// Default maximum payload size accepted by readers and decoders.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_CONTROL_MESSAGE_BYTES;

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┐
/// │ Length (4B)  │ Payload         │
/// │ u32 BE       │ (Length bytes)  │
/// └──────────────┴─────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_frame_into(payload, max_len, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode a payload, appending the framed bytes to `dst`.
pub fn encode_frame_into(payload: &[u8], max_len: usize, dst: &mut BytesMut) -> Result<()> {
    let max = max_len.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(FrameError::MessageTooLarge {
            size: payload.len(),
            max,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The length limit is checked as soon as the prefix is visible, before the
/// payload has arrived.
pub fn decode_frame(src: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; HEADER_SIZE];
    prefix.copy_from_slice(&src[..HEADER_SIZE]);
    let payload_len = u32::from_be_bytes(prefix) as usize;

    if payload_len > max_len {
        tracing::debug!(size = payload_len, max = max_len, "rejecting oversized frame prefix");
        return Err(FrameError::MessageTooLarge {
            size: payload_len,
            max: max_len,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Stateful, per-connection frame reassembler.
///
/// Bytes are pushed in whatever chunks the socket delivers; complete
/// payloads come out in arrival order and partial trailing bytes stay
/// buffered for the next push. Discard or [`reset`](Self::reset) the decoder
/// whenever the underlying connection is replaced.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads larger than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_len,
        }
    }

    /// Append `chunk` and extract every complete frame.
    ///
    /// An oversized prefix fails the whole push: frames already decoded from
    /// the same chunk are discarded along with it, and the offending prefix
    /// stays buffered until [`reset`](Self::reset). The connection is not
    /// usable after that error.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(payload) = decode_frame(&mut self.buf, self.max_len)? {
            frames.push(payload);
        }
        Ok(frames)
    }

    /// Drop any buffered partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Configured payload limit.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Update the payload limit for subsequent frames.
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to socket-backed readers.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout applied to socket-backed writers.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
