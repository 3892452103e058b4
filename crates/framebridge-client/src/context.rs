//! Application context: one client, one sender, one debug sink.
//!
//! Hosts create a [`BridgeContext`] at startup and hand it to whatever
//! produces frames. The producer side only needs three calls:
//! [`push_frame`](BridgeContext::push_frame),
//! [`target_size_hint`](BridgeContext::target_size_hint) and
//! [`stop_producer`](BridgeContext::stop_producer).

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::client::{BridgeClient, ClientOptions};
use crate::dump::{DebugSink, FileDumpSink, NoopSink};
use crate::error::Result;
use crate::scale::{downscale_rgba, target_stream_size};
use crate::sender::FrameSender;
use crate::settings::BridgeSettings;
use crate::state::{BridgeStatus, ConnectionState, TargetSize};

#[derive(Debug)]
struct Producer {
    sender: FrameSender,
    /// Session the current stream was started in.
    stream_session: Option<u64>,
}

pub struct BridgeContext {
    client: Arc<BridgeClient>,
    producer: Mutex<Producer>,
    sink: Arc<dyn DebugSink>,
    settings: BridgeSettings,
}

impl BridgeContext {
    pub fn new(settings: BridgeSettings) -> Self {
        Self::with_options(settings, ClientOptions::default())
    }

    /// Build with explicit client options. When dumping is enabled in
    /// `settings` the dump sink replaces `options.debug_sink`.
    pub fn with_options(settings: BridgeSettings, mut options: ClientOptions) -> Self {
        let sink: Arc<dyn DebugSink> = if settings.dump.enabled {
            let root = settings
                .dump
                .dir
                .clone()
                .unwrap_or_else(FileDumpSink::default_root);
            Arc::new(FileDumpSink::new(root, settings.dump.max_frames))
        } else if options.debug_sink.is_active() {
            options.debug_sink.clone()
        } else {
            Arc::new(NoopSink)
        };
        options.debug_sink = sink.clone();

        let client = Arc::new(BridgeClient::new(options));
        let sender = FrameSender::new(client.clone())
            .with_ring_slots(settings.ring_slots)
            .with_debug_sink(sink.clone());

        Self {
            client,
            producer: Mutex::new(Producer {
                sender,
                stream_session: None,
            }),
            sink,
            settings,
        }
    }

    /// Apply the settings to the client: set the port, enable if asked, and
    /// connect right away when `connect_now` is set.
    pub fn start(&self) -> Result<()> {
        self.client
            .configure(self.settings.port, self.settings.enable)?;
        if self.settings.connect_now {
            self.client.request_connect()?;
        }
        Ok(())
    }

    pub fn client(&self) -> &Arc<BridgeClient> {
        &self.client
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn debug_sink(&self) -> &Arc<dyn DebugSink> {
        &self.sink
    }

    pub fn status(&self) -> BridgeStatus {
        self.client.status()
    }

    /// Size the consumer last asked for.
    pub fn target_size_hint(&self) -> TargetSize {
        self.client.target_size_hint()
    }

    /// Hand one RGBA frame to the bridge.
    ///
    /// The frame is fitted to the consumer's target size first. A stream is
    /// started on demand for each new session. Returns the frame id, or
    /// `None` when no session is streaming.
    pub fn push_frame(
        &self,
        width: u32,
        height: u32,
        pixels: &[u8],
        stride: Option<u32>,
    ) -> Result<Option<u64>> {
        let status = self.client.status();
        if status.state != ConnectionState::Streaming {
            return Ok(None);
        }

        let mut producer = self.lock();
        if !producer.sender.is_streaming() || producer.stream_session != status.session_id {
            producer.sender.start_stream(None)?;
            producer.stream_session = status.session_id;
            debug!(session = ?status.session_id, "producer stream started");
        }

        let hint = TargetSize {
            width: status.target_stream_width,
            height: status.target_stream_height,
        };
        let (out_width, out_height) = target_stream_size(width, height, hint);
        let (frame, out_stride): (Cow<'_, [u8]>, Option<u32>) =
            if (out_width, out_height) == (width, height) {
                (Cow::Borrowed(pixels), stride)
            } else {
                let row = match stride {
                    Some(stride) => stride as usize,
                    None => width as usize * 4,
                };
                let scaled = downscale_rgba(pixels, width, height, row, out_width, out_height)?;
                (Cow::Owned(scaled), None)
            };

        producer
            .sender
            .send_rgba_frame(out_width, out_height, &frame, out_stride, None)
    }

    /// End the current stream (if any) and release shared-memory rings.
    pub fn stop_producer(&self, reason: Option<&str>) -> Result<()> {
        let mut producer = self.lock();
        producer.stream_session = None;
        producer.sender.stop_stream(reason)
    }

    /// Stop producing, then shut the connection down.
    pub fn shutdown(&self) {
        if let Err(err) = self.stop_producer(Some("shutdown")) {
            debug!(error = %err, "stop_stream during shutdown failed");
        }
        self.client.shutdown();
    }

    fn lock(&self) -> MutexGuard<'_, Producer> {
        self.producer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("client", &self.client)
            .field("settings", &self.settings)
            .field("dumping", &self.sink.is_active())
            .finish()
    }
}

impl Drop for BridgeContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
