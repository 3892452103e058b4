use std::sync::Arc;

use framebridge_protocol::{build, now_millis, TransportKind};
use framebridge_transport::RingSet;
use serde_json::json;
use tracing::{debug, warn};

use crate::client::BridgeClient;
use crate::compress::{default_compressor, Compressor};
use crate::dump::{DebugSink, DumpStage, NoopSink};
use crate::error::{ClientError, Result};
use crate::state::ConnectionState;

pub const DEFAULT_RING_SLOTS: usize = 3;

/// Turns RGBA frames into `frame_meta` + payload on the negotiated transport.
///
/// With `shm`, pixels go into a shared-memory ring and `frame_meta` names the
/// slot. With `tcp_lz4`, pixels are compressed and sent as a binary chunk
/// right after `frame_meta`.
pub struct FrameSender {
    client: Arc<BridgeClient>,
    rings: RingSet,
    compressor: Box<dyn Compressor>,
    sink: Arc<dyn DebugSink>,
    next_frame_id: u64,
    streaming: bool,
    warned_fallback: bool,
}

impl FrameSender {
    pub fn new(client: Arc<BridgeClient>) -> Self {
        Self {
            client,
            rings: RingSet::new(DEFAULT_RING_SLOTS),
            compressor: default_compressor(),
            sink: Arc::new(NoopSink),
            next_frame_id: 0,
            streaming: false,
            warned_fallback: false,
        }
    }

    pub fn with_ring_slots(mut self, slots: usize) -> Self {
        self.rings = RingSet::new(slots);
        self
    }

    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn client(&self) -> &Arc<BridgeClient> {
        &self.client
    }

    /// Last frame id handed out (0 before the first frame).
    pub fn last_frame_id(&self) -> u64 {
        self.next_frame_id
    }

    pub fn start_stream(&mut self, stream_id: Option<&str>) -> Result<()> {
        self.sink.start_session();
        self.client
            .enqueue_control_message(&build::start_stream(stream_id), None)?;
        self.streaming = true;
        debug!(?stream_id, "stream started");
        Ok(())
    }

    /// Announce the stop (if streaming) and destroy all rings.
    pub fn stop_stream(&mut self, reason: Option<&str>) -> Result<()> {
        let result = if self.streaming {
            self.client
                .enqueue_control_message(&build::stop_stream(reason), None)
        } else {
            Ok(())
        };
        self.streaming = false;
        self.rings.destroy_all();
        result
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.stop_stream(Some("shutdown"))
    }

    /// Send one RGBA frame.
    ///
    /// Returns `Ok(None)` when there is nowhere to send it: the stream is not
    /// started, the connection is not streaming, or a dimension is zero.
    /// `stride` defaults to `width * 4`; `pixels` must hold at least
    /// `stride * height` bytes.
    pub fn send_rgba_frame(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u8],
        stride: Option<u32>,
        timestamp_ms: Option<u64>,
    ) -> Result<Option<u64>> {
        if !self.streaming || self.client.state() != ConnectionState::Streaming {
            return Ok(None);
        }
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let Some(transport) = self.client.selected_transport() else {
            return Ok(None);
        };

        let stride = match stride {
            Some(stride) => stride,
            None => width.checked_mul(4).ok_or_else(|| {
                ClientError::InvalidArgument(format!("width {width} overflows stride"))
            })?,
        };
        let required = (stride as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| ClientError::InvalidArgument("frame size overflows".to_string()))?;
        if pixels.len() < required {
            return Err(ClientError::InvalidArgument(format!(
                "pixel buffer too short: {} < {required}",
                pixels.len()
            )));
        }

        let payload = &pixels[..required];
        let timestamp_ms = timestamp_ms.unwrap_or_else(|| now_millis().max(0) as u64);
        self.next_frame_id += 1;
        let frame_id = self.next_frame_id;

        if self.sink.is_active() {
            self.sink.dump(
                frame_id,
                DumpStage::RgbaRaw,
                payload,
                json!({
                    "width": width,
                    "height": height,
                    "stride": stride,
                    "requiredBytes": required,
                    "timestampMs": timestamp_ms,
                    "transport": transport.as_str(),
                }),
            );
        }

        match transport {
            TransportKind::Shm => {
                let written = self
                    .rings
                    .write_frame(self.client.port(), payload, frame_id, timestamp_ms)
                    .map_err(|err| {
                        let err = ClientError::from(err);
                        self.client.fail_session(&err);
                        err
                    })?;
                let slot = u32::try_from(written.slot).map_err(|_| {
                    ClientError::InvalidArgument(format!("slot {} out of range", written.slot))
                })?;
                let meta = build::frame_meta(
                    frame_id,
                    width,
                    height,
                    stride,
                    TransportKind::Shm,
                    timestamp_ms,
                    Some(slot),
                    None,
                );
                self.client.enqueue_control_message(&meta, Some(frame_id))?;
            }
            TransportKind::TcpLz4 => {
                let chunk = self.compress(payload);
                if self.sink.is_active() {
                    let ratio = if payload.is_empty() {
                        0.0
                    } else {
                        chunk.len() as f64 / payload.len() as f64
                    };
                    self.sink.dump(
                        frame_id,
                        DumpStage::TcpChunk,
                        &chunk,
                        json!({
                            "width": width,
                            "height": height,
                            "stride": stride,
                            "rawBytes": payload.len(),
                            "chunkBytes": chunk.len(),
                            "compressor": self.compressor.name(),
                            "compressionRatio": ratio,
                        }),
                    );
                }
                let meta = build::frame_meta(
                    frame_id,
                    width,
                    height,
                    stride,
                    TransportKind::TcpLz4,
                    timestamp_ms,
                    None,
                    Some(chunk.len() as u64),
                );
                self.client.enqueue_control_message(&meta, Some(frame_id))?;
                self.client.enqueue_binary_chunk(&chunk, Some(frame_id))?;
            }
        }

        Ok(Some(frame_id))
    }

    /// Compress for `tcp_lz4`, falling back to raw bytes and flagging the
    /// session degraded when compression is unavailable or fails.
    fn compress(&mut self, payload: &[u8]) -> Vec<u8> {
        if !self.compressor.is_degraded() {
            match self.compressor.compress(payload) {
                Ok(chunk) => return chunk,
                Err(err) => {
                    if !self.warned_fallback {
                        warn!(error = %err, "compression failed; sending raw bytes");
                        self.warned_fallback = true;
                    }
                }
            }
        } else if !self.warned_fallback {
            warn!(
                compressor = self.compressor.name(),
                "lz4 unavailable; tcp_lz4 sends raw bytes"
            );
            self.warned_fallback = true;
        }
        self.client.mark_degraded();
        payload.to_vec()
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("streaming", &self.streaming)
            .field("next_frame_id", &self.next_frame_id)
            .field("compressor", &self.compressor.name())
            .field("active_ring", &self.rings.active().map(|r| r.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use framebridge_frame::FrameDecoder;
    use framebridge_protocol::{decode_control_message, ControlMessage, MAX_BINARY_FRAME_BYTES};

    use super::*;
    use crate::compress::Passthrough;

    struct Failing;

    impl Compressor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn compress(&self, _payload: &[u8]) -> io::Result<Vec<u8>> {
            Err(io::Error::other("boom"))
        }
    }

    fn streaming_client(transport: TransportKind, port: u32) -> Arc<BridgeClient> {
        let client = Arc::new(BridgeClient::default());
        client.configure(port, false).unwrap();
        client.shared_for_tests().begin_streaming(transport);
        client
    }

    fn queued(client: &BridgeClient) -> Vec<bytes::Bytes> {
        let mut decoder = FrameDecoder::new(MAX_BINARY_FRAME_BYTES);
        let mut out = Vec::new();
        while let Some(framed) = client.shared_for_tests().queue.pop() {
            out.extend(decoder.push(&framed).unwrap());
        }
        out
    }

    #[test]
    fn nothing_is_sent_until_stream_and_connection_are_live() {
        let client = Arc::new(BridgeClient::default());
        let mut sender = FrameSender::new(Arc::clone(&client));
        assert_eq!(sender.send_rgba_frame(4, 4, &[0; 64], None, None).unwrap(), None);

        sender.start_stream(Some("s")).unwrap();
        assert_eq!(sender.send_rgba_frame(4, 4, &[0; 64], None, None).unwrap(), None);
        assert_eq!(sender.last_frame_id(), 0);
    }

    #[test]
    fn zero_dimensions_and_short_buffers() {
        let client = streaming_client(TransportKind::TcpLz4, 40_001);
        let mut sender = FrameSender::new(Arc::clone(&client));
        sender.start_stream(None).unwrap();

        assert_eq!(sender.send_rgba_frame(0, 4, &[0; 64], None, None).unwrap(), None);
        let err = sender.send_rgba_frame(4, 4, &[0; 63], None, None).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
        assert_eq!(sender.last_frame_id(), 0);
    }

    #[test]
    fn tcp_frame_is_meta_then_chunk() {
        let client = streaming_client(TransportKind::TcpLz4, 40_002);
        let mut sender = FrameSender::new(Arc::clone(&client));
        sender.start_stream(Some("viewport")).unwrap();

        let pixels: Vec<u8> = (0..64u8).collect();
        let id = sender.send_rgba_frame(4, 4, &pixels, None, Some(77)).unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(client.status().inflight_frames, 1);

        let frames = queued(&client);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            decode_control_message(&frames[0]).unwrap(),
            ControlMessage::StartStream(_)
        ));
        let ControlMessage::FrameMeta(meta) = decode_control_message(&frames[1]).unwrap() else {
            panic!("expected frame_meta");
        };
        assert_eq!(meta.frame_id, 1);
        assert_eq!((meta.width, meta.height, meta.stride), (4, 4, 16));
        assert_eq!(meta.transport, "tcp_lz4");
        assert_eq!(meta.timestamp_ms, 77);
        assert_eq!(meta.chunk_size, Some(frames[2].len() as u64));
        assert_eq!(meta.shm_slot, None);
    }

    #[test]
    fn passthrough_marks_session_degraded() {
        let client = streaming_client(TransportKind::TcpLz4, 40_003);
        let mut sender =
            FrameSender::new(Arc::clone(&client)).with_compressor(Box::new(Passthrough));
        sender.start_stream(None).unwrap();
        sender.send_rgba_frame(2, 2, &[9; 16], None, None).unwrap();

        assert!(client.status().degraded);
        let frames = queued(&client);
        assert_eq!(frames[2].as_ref(), &[9; 16]);
    }

    #[test]
    fn failing_compressor_falls_back_to_raw() {
        let client = streaming_client(TransportKind::TcpLz4, 40_004);
        let mut sender = FrameSender::new(Arc::clone(&client)).with_compressor(Box::new(Failing));
        sender.start_stream(None).unwrap();
        sender.send_rgba_frame(2, 1, &[1, 2, 3, 4, 5, 6, 7, 8], None, None).unwrap();
        sender.send_rgba_frame(2, 1, &[1, 2, 3, 4, 5, 6, 7, 8], None, None).unwrap();

        assert!(client.status().degraded);
        let frames = queued(&client);
        assert_eq!(frames[2].as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[cfg(unix)]
    #[test]
    fn shm_frame_lands_in_ring_slot() {
        let port = 20_000 + (std::process::id() % 20_000);
        let client = streaming_client(TransportKind::Shm, port);
        let mut sender = FrameSender::new(Arc::clone(&client)).with_ring_slots(2);
        sender.start_stream(None).unwrap();

        let pixels = vec![0x5A; 2 * 2 * 4];
        for expected_slot in [0u32, 1, 0] {
            sender.send_rgba_frame(2, 2, &pixels, None, Some(5)).unwrap();
            let frames = queued(&client);
            let meta = frames
                .iter()
                .filter_map(|f| match decode_control_message(f) {
                    Ok(ControlMessage::FrameMeta(meta)) => Some(meta),
                    _ => None,
                })
                .last()
                .unwrap();
            assert_eq!(meta.shm_slot, Some(expected_slot));
            assert_eq!(meta.chunk_size, None);
            assert_eq!(meta.transport, "shm");
        }

        let name = framebridge_transport::ring_name(
            port as u16,
            framebridge_transport::slot_size_for(pixels.len()),
        );
        let reader = framebridge_transport::ShmRing::attach_sized(
            &name,
            framebridge_transport::slot_size_for(pixels.len()),
        )
        .unwrap();
        let slot = reader.read_slot(0).unwrap().unwrap();
        assert_eq!(slot.frame_id, 3);
        assert_eq!(slot.payload.as_ref(), pixels.as_slice());

        sender.stop_stream(Some("done")).unwrap();
        drop(reader);
        assert!(framebridge_transport::ShmRing::attach(&name, 2, slot.payload.len() + 24).is_err());
    }
}
