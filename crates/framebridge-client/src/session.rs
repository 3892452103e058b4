//! The worker thread: connect, handshake, stream, recover.

use std::sync::Arc;
use std::time::Instant;

use framebridge_frame::{FrameConfig, FrameReader, FrameWriter, MAX_CONTROL_MESSAGE_BYTES};
use framebridge_protocol::{build, decode_control_message, now_millis, ControlMessage};
use framebridge_transport::connect_loopback;
use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::client::Shared;
use crate::error::{ClientError, Result};
use crate::handshake::{handshake_client, send_control};
use crate::state::{ConnectionState, LastError, TargetSize};

pub(crate) fn run_worker(shared: Arc<Shared>) {
    let timing = shared.options.timing.clone();
    let mut backoff = Backoff::new(timing.backoff.clone());

    while !shared.stopped() {
        let (port, enabled) = shared.snapshot_config();
        if !enabled {
            shared.set_state(ConnectionState::Disabled);
            if shared.wait_stop(timing.idle_poll) {
                break;
            }
            continue;
        }

        shared.set_state(ConnectionState::Listening);

        let mut streamed = false;
        let mut fast_reconnect = false;
        let result = run_session(&shared, port, &mut streamed);
        let failure = shared.take_session_failure();
        match result {
            Ok(()) => backoff.reset(),
            Err(ClientError::StopRequested) => {}
            Err(_) if shared.stopped() || !shared.is_enabled() => shared.clear_error(),
            Err(err) if failure.is_none() && streamed && err.is_peer_close() => {
                debug!(error = %err, "peer closed the session; reconnecting");
                shared.clear_error();
                fast_reconnect = true;
            }
            Err(err) => shared.set_error(failure.unwrap_or_else(|| LastError::from(&err))),
        }

        shared.close_socket();
        let purged = shared.queue.clear();
        if purged > 0 {
            debug!(purged, "dropped queued buffers from previous session");
        }

        if shared.stopped() {
            break;
        }
        if !shared.is_enabled() {
            continue;
        }
        if streamed {
            backoff.reset();
        }
        if fast_reconnect {
            continue;
        }

        shared.set_state(ConnectionState::Recovering);
        let delay = backoff.next_delay();
        debug!(?delay, "waiting before reconnect");
        if shared.wait_stop(delay) {
            break;
        }
    }

    shared.close_socket();
    shared.set_state(ConnectionState::Disabled);
}

/// One connection: returns `Ok` only when stopped or disabled while streaming.
fn run_session(shared: &Shared, port: u16, streamed: &mut bool) -> Result<()> {
    let timing = &shared.options.timing;
    let stream = connect_loopback(port, timing.connect_timeout)?;
    shared.set_socket(stream.try_clone()?);
    shared.clear_error();
    shared.set_state(ConnectionState::Handshaking);

    let config = FrameConfig {
        max_payload_size: MAX_CONTROL_MESSAGE_BYTES,
        read_timeout: Some(timing.read_timeout),
        write_timeout: Some(timing.write_timeout),
    };
    let mut reader = FrameReader::with_config_tcp(stream.try_clone()?, config.clone())?;
    let mut writer = FrameWriter::with_config_tcp(stream, config)?
        .with_cancel(Arc::clone(&shared.stop))
        .with_stall_timeout(timing.heartbeat_timeout);

    let handshake = handshake_client(
        &mut reader,
        &mut writer,
        &shared.options.handshake_config(),
        &shared.stop,
    )?;

    let session_id = shared.begin_streaming(handshake.transport);
    *streamed = true;
    info!(session_id, port, transport = %handshake.transport, "bridge session streaming");

    let mut last_peer_heartbeat = Instant::now();
    let mut last_sent_heartbeat: Option<Instant> = None;

    for payload in &handshake.pending {
        handle_incoming(shared, payload, &mut last_peer_heartbeat)?;
    }

    loop {
        if shared.stopped() || !shared.is_enabled() {
            return Ok(());
        }

        flush_queue(shared, &mut writer, last_peer_heartbeat)?;

        let now = Instant::now();
        let heartbeat_due = last_sent_heartbeat
            .is_none_or(|sent| now.duration_since(sent) >= timing.heartbeat_interval);
        if heartbeat_due {
            send_control(&mut writer, &build::heartbeat(now_millis()))?;
            last_sent_heartbeat = Some(now);
        }

        for payload in reader.poll()? {
            handle_incoming(shared, &payload, &mut last_peer_heartbeat)?;
        }

        if last_peer_heartbeat.elapsed() > timing.heartbeat_timeout {
            return Err(ClientError::HeartbeatTimeout(timing.heartbeat_timeout));
        }
    }
}

/// Write out whatever was queued when the flush started.
///
/// A long backlog still honours the heartbeat timeout between buffers.
fn flush_queue<W: std::io::Write>(
    shared: &Shared,
    writer: &mut FrameWriter<W>,
    last_peer_heartbeat: Instant,
) -> Result<()> {
    let timeout = shared.options.timing.heartbeat_timeout;
    for _ in 0..shared.queue.len() {
        if last_peer_heartbeat.elapsed() > timeout {
            return Err(ClientError::HeartbeatTimeout(timeout));
        }
        let Some(framed) = shared.queue.pop() else {
            break;
        };
        writer.write_framed(&framed)?;
    }
    Ok(())
}

fn handle_incoming(shared: &Shared, payload: &[u8], last_peer_heartbeat: &mut Instant) -> Result<()> {
    match decode_control_message(payload)? {
        ControlMessage::Heartbeat(heartbeat) => {
            *last_peer_heartbeat = Instant::now();
            shared.update_target(TargetSize::from_hint(
                heartbeat.target_width,
                heartbeat.target_height,
            ));
        }
        ControlMessage::Ack(ack) => {
            if ack.frame_id > 0 {
                shared.ack_inflight(ack.frame_id as u64);
            }
        }
        ControlMessage::Error(error) => {
            let message = if error.message.is_empty() {
                "peer reported an error".to_string()
            } else {
                error.message
            };
            return Err(ClientError::Peer {
                code: error.code,
                message,
            });
        }
        other => {
            debug!(kind = %other.message_type(), "ignoring control message while streaming");
        }
    }
    Ok(())
}
