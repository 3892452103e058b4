use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::codec::{decode_frame, encode_frame_into, DEFAULT_MAX_PAYLOAD};
use crate::error::FrameError;

/// `tokio_util` codec speaking the bridge's length-prefixed framing.
#[derive(Debug, Clone)]
pub struct BridgeCodec {
    max_len: usize,
}

impl BridgeCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// Wrap an async byte stream so it yields and accepts whole frames.
pub fn framed<T>(io: T, max_len: usize) -> Framed<T, BridgeCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, BridgeCodec::new(max_len))
}

impl Default for BridgeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for BridgeCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_len)
    }
}

impl Encoder<Bytes> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_into(&item, self.max_len, dst)
    }
}

impl Encoder<&[u8]> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_into(item, self.max_len, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_waits_for_full_frame() {
        let mut codec = BridgeCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"async"), &mut buf).unwrap();

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.as_ref(), b"async");
        assert!(partial.is_empty());
    }

    #[tokio::test]
    async fn framed_duplex_roundtrip() {
        use futures_util::{SinkExt, StreamExt};

        let (left, right) = tokio::io::duplex(64);
        let mut tx = framed(left, DEFAULT_MAX_PAYLOAD);
        let mut rx = framed(right, DEFAULT_MAX_PAYLOAD);

        let sender = tokio::spawn(async move {
            tx.send(Bytes::from_static(b"first")).await.unwrap();
            tx.send(Bytes::from(vec![7u8; 300])).await.unwrap();
        });

        let first = rx.next().await.unwrap().unwrap();
        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"first");
        assert_eq!(second.len(), 300);
        sender.await.unwrap();
    }

    #[test]
    fn encoder_enforces_limit() {
        let mut codec = BridgeCodec::new(2);
        let mut buf = BytesMut::new();
        let err = codec.encode(&b"abc"[..], &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { size: 3, max: 2 }));
    }
}
