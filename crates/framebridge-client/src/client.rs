use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use framebridge_frame::{encode_frame, MAX_BINARY_FRAME_BYTES};
use framebridge_protocol::{
    encode_control_frame, ControlMessage, TransportKind, DEFAULT_CAPABILITIES, DEFAULT_PORT,
    HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_INFLIGHT_FRAMES, MIN_PORT,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::backoff::DEFAULT_BACKOFF;
use crate::dump::{DebugSink, DumpStage, NoopSink};
use crate::error::{ClientError, Result};
use crate::handshake::HandshakeConfig;
use crate::inflight::InflightFrames;
use crate::queue::{PushOutcome, SendQueue, SEND_QUEUE_CAPACITY};
use crate::session;
use crate::state::{BridgeStatus, ConnectionState, LastError, TargetSize};

/// Timeouts and intervals driving the worker. Tests shorten these.
#[derive(Debug, Clone)]
pub struct ClientTiming {
    pub heartbeat_interval: Duration,
    /// Session ends when no peer heartbeat arrives for this long.
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Socket read timeout; paces the streaming loop.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Sleep between checks while the connection is disabled.
    pub idle_poll: Duration,
    pub backoff: Vec<Duration>,
}

impl Default for ClientTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(20),
            write_timeout: Duration::from_millis(50),
            idle_poll: Duration::from_millis(100),
            backoff: DEFAULT_BACKOFF.to_vec(),
        }
    }
}

/// Construction options for [`BridgeClient`].
#[derive(Clone)]
pub struct ClientOptions {
    pub timing: ClientTiming,
    pub client_name: String,
    pub client_version: String,
    pub capabilities: Vec<String>,
    pub max_inflight_frames: usize,
    pub queue_capacity: usize,
    pub debug_sink: Arc<dyn DebugSink>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timing: ClientTiming::default(),
            client_name: "framebridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            max_inflight_frames: MAX_INFLIGHT_FRAMES,
            queue_capacity: SEND_QUEUE_CAPACITY,
            debug_sink: Arc::new(NoopSink),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timing", &self.timing)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("capabilities", &self.capabilities)
            .field("max_inflight_frames", &self.max_inflight_frames)
            .field("queue_capacity", &self.queue_capacity)
            .field("debug_sink_active", &self.debug_sink.is_active())
            .finish()
    }
}

impl ClientOptions {
    pub(crate) fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            timeout: self.timing.handshake_timeout,
            client_name: self.client_name.clone(),
            client_version: self.client_version.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// State guarded by the state lock.
#[derive(Debug)]
struct Inner {
    port: u16,
    enabled: bool,
    state: ConnectionState,
    transport: Option<TransportKind>,
    degraded: bool,
    session_counter: u64,
    session_id: Option<u64>,
    inflight: InflightFrames,
    target: TargetSize,
    last_error: Option<LastError>,
    /// Error raised outside the worker that ends the live session.
    session_failure: Option<LastError>,
}

impl Inner {
    fn reset_session(&mut self) {
        self.transport = None;
        self.degraded = false;
        self.session_id = None;
        self.inflight.clear();
        self.target = TargetSize::default();
    }
}

/// Everything the worker thread shares with the public handle.
pub(crate) struct Shared {
    pub(crate) options: ClientOptions,
    inner: Mutex<Inner>,
    socket: Mutex<Option<TcpStream>>,
    pub(crate) queue: SendQueue,
    pub(crate) stop: Arc<AtomicBool>,
    watchers: Mutex<Vec<Sender<ConnectionState>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_socket(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot_config(&self) -> (u16, bool) {
        let inner = self.lock();
        (inner.port, inner.enabled)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.state = state;
        if state != ConnectionState::Streaming {
            inner.reset_session();
        }
        if previous != state {
            debug!(from = %previous, to = %state, "bridge state transition");
            self.notify(state);
        }
    }

    /// Enter `streaming` with a fresh session. Returns the new session id.
    pub(crate) fn begin_streaming(&self, transport: TransportKind) -> u64 {
        let mut inner = self.lock();
        inner.session_counter += 1;
        let session_id = inner.session_counter;
        inner.reset_session();
        inner.session_failure = None;
        inner.session_id = Some(session_id);
        inner.transport = Some(transport);
        let previous = inner.state;
        inner.state = ConnectionState::Streaming;
        if previous != ConnectionState::Streaming {
            debug!(from = %previous, to = "streaming", "bridge state transition");
            self.notify(ConnectionState::Streaming);
        }
        session_id
    }

    fn notify(&self, state: ConnectionState) {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.retain(|tx| tx.send(state).is_ok());
    }

    pub(crate) fn set_error(&self, error: LastError) {
        warn!(code = %error.code, message = %error.message, "bridge error");
        self.lock().last_error = Some(error);
    }

    pub(crate) fn clear_error(&self) {
        self.lock().last_error = None;
    }

    pub(crate) fn take_session_failure(&self) -> Option<LastError> {
        self.lock().session_failure.take()
    }

    pub(crate) fn update_target(&self, target: TargetSize) {
        let mut inner = self.lock();
        if inner.target != target {
            debug!(width = ?target.width, height = ?target.height, "stream target size changed");
            inner.target = target;
        }
    }

    pub(crate) fn register_inflight(&self, frame_id: u64) {
        if let Some(evicted) = self.lock().inflight.register(frame_id) {
            warn!(frame_id = evicted, "dropping stale inflight frame");
        }
    }

    pub(crate) fn ack_inflight(&self, frame_id: u64) {
        self.lock().inflight.ack(frame_id);
    }

    pub(crate) fn set_socket(&self, stream: TcpStream) {
        *self.lock_socket() = Some(stream);
    }

    /// Force-close the live socket so blocked reads and writes return.
    pub(crate) fn close_socket(&self) {
        if let Some(stream) = self.lock_socket().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Sleep up to `duration`, returning early (true) when stop is requested.
    pub(crate) fn wait_stop(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}

/// Producer-side connection manager.
///
/// Owns one worker thread per connection lifetime. The worker connects to the
/// consumer on `127.0.0.1:port`, performs the handshake, and then runs the
/// streaming duty cycle: flush queued frames, send heartbeats, poll incoming
/// control messages. Session-ending errors move the client through
/// `recovering` with tiered backoff.
pub struct BridgeClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn new(options: ClientOptions) -> Self {
        let inflight = InflightFrames::new(options.max_inflight_frames);
        let queue = SendQueue::new(options.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                options,
                inner: Mutex::new(Inner {
                    port: DEFAULT_PORT,
                    enabled: false,
                    state: ConnectionState::Disabled,
                    transport: None,
                    degraded: false,
                    session_counter: 0,
                    session_id: None,
                    inflight,
                    target: TargetSize::default(),
                    last_error: None,
                    session_failure: None,
                }),
                socket: Mutex::new(None),
                queue,
                stop: Arc::new(AtomicBool::new(false)),
                watchers: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Set the consumer port and whether the connection is enabled.
    ///
    /// An out-of-range port is recorded as the last error and nothing else
    /// changes. Changing the port of a live connection drops the current
    /// session so the next one uses the new port.
    pub fn configure(&self, port: u32, enable: bool) -> Result<()> {
        let port = match validate_port(port) {
            Ok(port) => port,
            Err(err) => {
                self.shared.set_error(LastError::from(&err));
                return Err(err);
            }
        };

        let port_changed = {
            let mut inner = self.shared.lock();
            let changed = inner.port != port && inner.state != ConnectionState::Disabled;
            inner.port = port;
            inner.enabled = enable;
            changed
        };

        if !enable {
            self.stop_worker();
            self.shared.set_state(ConnectionState::Disabled);
            return Ok(());
        }

        if port_changed {
            debug!(port, "port changed; dropping current session");
            self.shared.close_socket();
        }
        self.request_connect()
    }

    /// Enable the connection and make sure the worker is running.
    pub fn request_connect(&self) -> Result<()> {
        let was_disabled = {
            let mut inner = self.shared.lock();
            inner.enabled = true;
            inner.state == ConnectionState::Disabled
        };
        if was_disabled {
            self.shared.set_state(ConnectionState::Listening);
        }
        self.ensure_worker()
    }

    /// Stop the worker and return to `disabled`, clearing the last error.
    pub fn disable_connection(&self) {
        self.shared.lock().enabled = false;
        self.stop_worker();
        self.shared.set_state(ConnectionState::Disabled);
        self.shared.clear_error();
    }

    /// Disable and purge anything still queued.
    pub fn shutdown(&self) {
        self.disable_connection();
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            debug!(dropped, "purged send queue on shutdown");
        }
    }

    /// Queue a control message. Never blocks; see [`SendQueue`].
    ///
    /// When `frame_id` is given it is tracked as inflight until acked.
    pub fn enqueue_control_message(
        &self,
        message: &ControlMessage,
        frame_id: Option<u64>,
    ) -> Result<()> {
        let framed = encode_control_frame(message)?;
        self.push_framed(framed);
        if let Some(frame_id) = frame_id {
            self.shared.register_inflight(frame_id);
        }
        Ok(())
    }

    /// Queue a binary chunk (up to 128 MiB). Never blocks.
    pub fn enqueue_binary_chunk(&self, payload: &[u8], frame_id: Option<u64>) -> Result<()> {
        let framed = encode_frame(payload, MAX_BINARY_FRAME_BYTES)?;
        let sink = &self.shared.options.debug_sink;
        if let Some(frame_id) = frame_id.filter(|id| *id > 0) {
            if sink.is_active() {
                sink.dump(
                    frame_id,
                    DumpStage::TcpFramed,
                    &framed,
                    json!({
                        "payloadBytes": payload.len(),
                        "framedBytes": framed.len(),
                    }),
                );
            }
        }
        self.push_framed(framed);
        Ok(())
    }

    fn push_framed(&self, framed: Bytes) {
        match self.shared.queue.push(framed) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest => {
                warn!("send queue full; dropped oldest buffer");
            }
            PushOutcome::Rejected => {
                warn!("send queue rejected buffer; message dropped");
            }
        }
    }

    pub fn status(&self) -> BridgeStatus {
        let inner = self.shared.lock();
        BridgeStatus {
            state: inner.state,
            enabled: inner.enabled,
            port: inner.port,
            transport: inner.transport.map(|t| t.as_str().to_string()),
            degraded: inner.degraded,
            session_id: inner.session_id,
            inflight_frames: inner.inflight.len(),
            max_inflight_frames: inner.inflight.capacity(),
            target_stream_width: inner.target.width,
            target_stream_height: inner.target.height,
            last_error: inner.last_error.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn port(&self) -> u16 {
        self.shared.lock().port
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Transport negotiated for the current session, if streaming.
    pub fn selected_transport(&self) -> Option<TransportKind> {
        self.shared.lock().transport
    }

    pub fn target_size_hint(&self) -> TargetSize {
        self.shared.lock().target
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.shared.lock().last_error.clone()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Subscribe to state transitions. Each transition is sent once.
    pub fn watch_state(&self) -> Receiver<ConnectionState> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Flag the current session as degraded (e.g. raw bytes instead of LZ4).
    pub fn mark_degraded(&self) {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Streaming && !inner.degraded {
            inner.degraded = true;
            debug!("session marked degraded");
        }
    }

    /// Surface an error raised outside the worker (e.g. by the frame sender).
    pub fn record_error(&self, err: &ClientError) {
        self.shared.set_error(LastError::from(err));
    }

    /// End the live session with `err` and recover as if the worker had
    /// failed. Outside `streaming` the error is only recorded.
    pub fn fail_session(&self, err: &ClientError) {
        let failure = LastError::from(err);
        let streaming = {
            let mut inner = self.shared.lock();
            let streaming = inner.state == ConnectionState::Streaming;
            if streaming {
                inner.session_failure = Some(failure.clone());
            }
            streaming
        };
        if streaming {
            debug!(code = %failure.code, "ending session on producer-side failure");
            self.shared.close_socket();
        } else {
            self.shared.set_error(failure);
        }
    }

    #[cfg(test)]
    pub(crate) fn shared_for_tests(&self) -> &Shared {
        &self.shared
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("framebridge-worker".to_string())
            .spawn(move || session::run_worker(shared));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                let err = ClientError::Launch(err);
                self.shared.set_error(LastError::from(&err));
                self.shared.set_state(ConnectionState::Disabled);
                Err(err)
            }
        }
    }

    fn stop_worker(&self) {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.close_socket();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                warn!("bridge worker panicked");
            }
        }
        self.shared.stop.store(false, Ordering::SeqCst);
    }
}

impl Default for BridgeClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeClient")
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(port) if port >= MIN_PORT => Ok(port),
        _ => Err(ClientError::PortInvalid(port)),
    }
}
