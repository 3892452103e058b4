//! Producer-side connection management for framebridge.
//!
//! This is the "just works" layer. A [`BridgeClient`] owns one background
//! worker that connects to the consumer on loopback, runs the handshake,
//! drains a bounded send queue, and keeps the session alive with
//! heartbeats. A [`FrameSender`] turns RGBA frames into `frame_meta` plus a
//! shared-memory slot or an LZ4 chunk. [`BridgeContext`] wires both together
//! from [`BridgeSettings`].
//!
//! The consumer half ([`ConsumerListener`], [`ConsumerPeer`]) answers the
//! handshake and decodes frames; it backs the `serve` command and tests.

pub mod backoff;
pub mod client;
pub mod compress;
pub mod context;
pub mod dump;
pub mod error;
pub mod handshake;
pub mod inflight;
pub mod peer;
pub mod queue;
pub mod scale;
pub mod sender;
mod session;
pub mod settings;
pub mod state;

pub use backoff::{Backoff, DEFAULT_BACKOFF};
pub use client::{BridgeClient, ClientOptions, ClientTiming};
#[cfg(feature = "lz4")]
pub use compress::{decompress_lz4_frame, Lz4FrameCompressor};
pub use compress::{default_compressor, Compressor, Passthrough};
pub use context::BridgeContext;
pub use dump::{DebugSink, DumpStage, FileDumpSink, NoopSink};
pub use error::{ClientError, Result};
pub use handshake::{handshake_client, handshake_server, HandshakeConfig, HandshakeResult};
pub use inflight::InflightFrames;
pub use peer::{ConsumerListener, ConsumerPeer, PeerConfig, PeerEvent, ReceivedFrame};
pub use queue::{PushOutcome, SendQueue, SEND_QUEUE_CAPACITY};
pub use scale::{downscale_rgba, target_stream_size};
pub use sender::{FrameSender, DEFAULT_RING_SLOTS};
pub use settings::{BridgeSettings, DumpSettings};
pub use state::{BridgeStatus, ConnectionState, LastError, TargetSize};
