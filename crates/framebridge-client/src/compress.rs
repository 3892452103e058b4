//! Payload compression for the `tcp_lz4` transport.

use std::io;

/// Compresses frame payloads before they go out as binary chunks.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;

    fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>>;

    /// True when this compressor sends raw bytes in place of LZ4.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Sends payloads unchanged. Used when LZ4 support is compiled out.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Compressor for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

#[cfg(feature = "lz4")]
pub use self::lz4::{decompress_lz4_frame, Lz4FrameCompressor};

#[cfg(feature = "lz4")]
mod lz4 {
    use std::io::{self, Read, Write};

    use lz4_flex::frame::{FrameDecoder, FrameEncoder};

    use super::Compressor;

    /// LZ4 frame format, readable by any standard LZ4 frame decoder.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Lz4FrameCompressor;

    impl Compressor for Lz4FrameCompressor {
        fn name(&self) -> &'static str {
            "lz4-frame"
        }

        fn compress(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
            let mut encoder = FrameEncoder::new(Vec::with_capacity(payload.len() / 2 + 64));
            encoder.write_all(payload)?;
            encoder.finish().map_err(io::Error::other)
        }
    }

    /// Inverse of [`Lz4FrameCompressor::compress`].
    pub fn decompress_lz4_frame(compressed: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(compressed.len() * 2);
        FrameDecoder::new(compressed).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// LZ4 when the `lz4` feature is on, otherwise [`Passthrough`].
pub fn default_compressor() -> Box<dyn Compressor> {
    #[cfg(feature = "lz4")]
    {
        Box::new(Lz4FrameCompressor)
    }
    #[cfg(not(feature = "lz4"))]
    {
        Box::new(Passthrough)
    }
}
