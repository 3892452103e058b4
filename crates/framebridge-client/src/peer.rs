//! Consumer side of the bridge: accepts a producer, answers the handshake,
//! and turns incoming frames back into pixels.
//!
//! Used by integration tests and by `framebridge serve`.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use framebridge_frame::{FrameConfig, FrameReader, FrameWriter, MAX_BINARY_FRAME_BYTES};
use framebridge_protocol::{
    build, decode_control_message, default_codec, encode_shaped, now_millis, ControlMessage,
    FrameMeta, Hello, TransportKind, WireShape, HEARTBEAT_TIMEOUT_MS,
};
use framebridge_transport::{bind_loopback, ring_name, slot_size_for, ShmRing, TransportError};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::handshake::handshake_server;

const TORN_READ_RETRIES: usize = 8;

/// How the consumer answers `hello`.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub accept: bool,
    pub transport: TransportKind,
    pub server_version: Option<String>,
    pub reject_reason: Option<String>,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    /// Layout used for outgoing control messages.
    pub reply_shape: WireShape,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            accept: true,
            transport: TransportKind::TcpLz4,
            server_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            reject_reason: None,
            handshake_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(20),
            reply_shape: WireShape::Canonical,
        }
    }
}

impl PeerConfig {
    fn hello_ack(&self) -> ControlMessage {
        if self.accept {
            build::hello_ack(
                true,
                self.server_version.as_deref(),
                Some(self.transport.as_str()),
                None,
            )
        } else {
            build::hello_ack(
                false,
                self.server_version.as_deref(),
                None,
                Some(self.reject_reason.as_deref().unwrap_or("rejected")),
            )
        }
    }
}

/// Loopback listener that hands out [`ConsumerPeer`]s.
#[derive(Debug)]
pub struct ConsumerListener {
    listener: TcpListener,
    config: PeerConfig,
}

impl ConsumerListener {
    /// Bind `127.0.0.1:port`; port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> Result<Self> {
        Ok(Self {
            listener: bind_loopback(port)?,
            config: PeerConfig::default(),
        })
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Block for the next producer and run the handshake.
    pub fn accept(&self) -> Result<ConsumerPeer> {
        let (stream, addr) = self.listener.accept()?;
        debug!(%addr, "producer connected");
        ConsumerPeer::handshake(stream, self.port()?, self.config.clone())
    }

    /// Like [`accept`](Self::accept) but gives up after `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<ConsumerPeer>> {
        let deadline = Instant::now() + timeout;
        self.listener.set_nonblocking(true)?;
        let accepted = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break Some(stream),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break None;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.listener.set_nonblocking(false)?;
                    return Err(err.into());
                }
            }
        };
        self.listener.set_nonblocking(false)?;

        match accepted {
            Some(stream) => {
                stream.set_nonblocking(false)?;
                ConsumerPeer::handshake(stream, self.port()?, self.config.clone()).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// A decoded frame: its `frame_meta` plus the pixel bytes.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub meta: FrameMeta,
    /// Uncompressed RGBA bytes.
    pub pixels: Bytes,
    /// Bytes that crossed the wire or the ring for this frame.
    pub wire_len: usize,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Control(ControlMessage),
    Frame(ReceivedFrame),
}

/// One accepted producer connection.
pub struct ConsumerPeer {
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
    hello: Hello,
    port: u16,
    config: PeerConfig,
    pending: VecDeque<Bytes>,
    awaiting_chunk: Option<FrameMeta>,
    ring: Option<ShmRing>,
}

impl ConsumerPeer {
    fn handshake(stream: TcpStream, port: u16, config: PeerConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let frame_config = FrameConfig {
            max_payload_size: MAX_BINARY_FRAME_BYTES,
            read_timeout: Some(config.read_timeout),
            write_timeout: None,
        };
        let mut reader = FrameReader::with_config_tcp(stream.try_clone()?, frame_config.clone())?;
        let mut writer = FrameWriter::with_config_tcp(stream, frame_config)?;

        let (hello, pending) = handshake_server(
            &mut reader,
            &mut writer,
            &config.hello_ack(),
            config.handshake_timeout,
        )?;
        if !config.accept {
            return Err(ClientError::HandshakeFailed(
                config
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            ));
        }

        Ok(Self {
            reader,
            writer,
            hello,
            port,
            config,
            pending: pending.into(),
            awaiting_chunk: None,
            ring: None,
        })
    }

    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn transport(&self) -> TransportKind {
        self.config.transport
    }

    /// Wait up to `timeout` for the next control message or complete frame.
    ///
    /// A `frame_meta` is folded together with its chunk (tcp_lz4) or its ring
    /// slot (shm) into a single [`PeerEvent::Frame`].
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<PeerEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.pending.pop_front() {
                if let Some(event) = self.process(payload)? {
                    return Ok(Some(event));
                }
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let frames = self.reader.poll()?;
            self.pending.extend(frames);
        }
    }

    /// Read frames until one arrives or `timeout` passes, skipping control
    /// messages other than `frame_meta`.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Option<ReceivedFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event(remaining)? {
                Some(PeerEvent::Frame(frame)) => return Ok(Some(frame)),
                Some(PeerEvent::Control(message)) => {
                    debug!(kind = %message.message_type(), "skipping control message");
                }
                None => return Ok(None),
            }
        }
    }

    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let payload = encode_shaped(message, self.config.reply_shape, default_codec())?;
        self.writer.send(&payload)?;
        Ok(())
    }

    /// Send arbitrary bytes as one frame.
    pub fn send_raw(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.send(payload)?;
        Ok(())
    }

    pub fn send_ack(&mut self, frame_id: u64) -> Result<()> {
        let frame_id = i64::try_from(frame_id)
            .map_err(|_| ClientError::InvalidArgument(format!("frame id {frame_id} too large")))?;
        self.send(&build::ack(frame_id))
    }

    /// Heartbeat, optionally carrying the requested stream size.
    pub fn send_heartbeat(&mut self, target: Option<(u32, u32)>) -> Result<()> {
        let message = match target {
            Some((width, height)) => {
                build::heartbeat_with_target(now_millis(), width.into(), height.into())
            }
            None => build::heartbeat(now_millis()),
        };
        self.send(&message)
    }

    pub fn send_error(&mut self, code: &str, message: &str) -> Result<()> {
        self.send(&build::error(code, message))
    }

    /// Close both directions of the socket.
    pub fn close(self) {
        let _ = self.writer.get_ref().shutdown(std::net::Shutdown::Both);
    }

    fn process(&mut self, payload: Bytes) -> Result<Option<PeerEvent>> {
        if let Some(meta) = self.awaiting_chunk.take() {
            let wire_len = payload.len();
            let pixels = unpack_chunk(payload);
            return Ok(Some(PeerEvent::Frame(ReceivedFrame {
                meta,
                pixels,
                wire_len,
            })));
        }

        let message = decode_control_message(&payload)?;
        if let ControlMessage::FrameMeta(meta) = &message {
            match (TransportKind::parse(&meta.transport), meta.shm_slot) {
                (Some(TransportKind::TcpLz4), _) if meta.chunk_size.is_some() => {
                    self.awaiting_chunk = Some(meta.clone());
                    return Ok(None);
                }
                (Some(TransportKind::Shm), Some(slot)) => {
                    let pixels = self.read_ring(meta, slot as usize)?;
                    return Ok(Some(PeerEvent::Frame(ReceivedFrame {
                        meta: meta.clone(),
                        wire_len: pixels.len(),
                        pixels,
                    })));
                }
                _ => {}
            }
        }
        Ok(Some(PeerEvent::Control(message)))
    }

    fn read_ring(&mut self, meta: &FrameMeta, slot: usize) -> Result<Bytes> {
        let payload_len = (meta.stride as usize) * (meta.height as usize);
        let slot_size = slot_size_for(payload_len);

        let reattach = self
            .ring
            .as_ref()
            .is_none_or(|ring| ring.slot_size() != slot_size);
        if reattach {
            let name = ring_name(self.port, slot_size);
            self.ring = Some(ShmRing::attach_sized(&name, slot_size)?);
        }
        let ring = self.ring.as_ref().ok_or(TransportError::Closed)?;

        for _ in 0..TORN_READ_RETRIES {
            if let Some(read) = ring.read_slot(slot)? {
                if read.frame_id != meta.frame_id {
                    debug!(
                        expected = meta.frame_id,
                        found = read.frame_id,
                        "ring slot already overwritten"
                    );
                }
                return Ok(read.payload);
            }
            thread::yield_now();
        }
        Err(TransportError::ShmAttach {
            name: ring.name().to_string(),
            reason: format!("slot {slot} kept changing while reading"),
        }
        .into())
    }
}

impl std::fmt::Debug for ConsumerPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPeer")
            .field("client", &self.hello.client_name)
            .field("port", &self.port)
            .field("transport", &self.config.transport)
            .finish()
    }
}

/// LZ4 frames are decompressed; anything else is taken as raw pixels.
fn unpack_chunk(chunk: Bytes) -> Bytes {
    #[cfg(feature = "lz4")]
    {
        const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
        if chunk.starts_with(&LZ4_FRAME_MAGIC) {
            match crate::compress::decompress_lz4_frame(&chunk) {
                Ok(raw) => return Bytes::from(raw),
                Err(err) => debug!(error = %err, "chunk is not valid lz4; using raw bytes"),
            }
        }
    }
    chunk
}
