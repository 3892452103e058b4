use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use framebridge_client::{ConsumerListener, ConsumerPeer, PeerConfig, PeerEvent};
use framebridge_protocol::{ControlMessage, TransportKind, HEARTBEAT_INTERVAL_MS};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, parse_size, ServeArgs};
use crate::exit::{client_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_frame, OutputFormat};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const EVENT_POLL: Duration = Duration::from_millis(100);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let target = args.target.as_deref().map(parse_size).transpose()?;
    let accept_timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let transport = TransportKind::from(args.transport);

    let listener = ConsumerListener::bind(args.port)
        .map_err(|err| client_error("bind failed", err))?
        .with_config(PeerConfig {
            transport,
            ..PeerConfig::default()
        });
    info!(port = args.port, %transport, "waiting for producer");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let started = Instant::now();
    let mut received = 0usize;

    while running.load(Ordering::SeqCst) {
        let mut peer = match listener.accept_timeout(ACCEPT_POLL) {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                if let Some(limit) = accept_timeout {
                    if received == 0 && started.elapsed() >= limit {
                        return Err(CliError::new(
                            TIMEOUT,
                            format!("no producer connected within {limit:?}"),
                        ));
                    }
                }
                continue;
            }
            Err(err) => {
                warn!(error = %err, "handshake with producer failed");
                continue;
            }
        };
        info!(
            client = %peer.hello().client_name,
            version = %peer.hello().client_version,
            "producer connected"
        );

        match serve_peer(&mut peer, &args, target, &running, &mut received, format) {
            Ok(()) => {
                peer.close();
                return Ok(SUCCESS);
            }
            Err(err) if err.is_peer_close() => info!("producer disconnected"),
            Err(err) => warn!(error = %err, "session with producer ended"),
        }
    }

    Ok(SUCCESS)
}

/// Serve one producer until the frame budget is reached or the process is
/// interrupted (`Ok`), or the session fails (`Err`).
fn serve_peer(
    peer: &mut ConsumerPeer,
    args: &ServeArgs,
    target: Option<(u32, u32)>,
    running: &AtomicBool,
    received: &mut usize,
    format: OutputFormat,
) -> framebridge_client::Result<()> {
    let interval = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    let mut last_heartbeat: Option<Instant> = None;

    while running.load(Ordering::SeqCst) {
        if last_heartbeat.is_none_or(|sent| sent.elapsed() >= interval) {
            peer.send_heartbeat(target)?;
            last_heartbeat = Some(Instant::now());
        }

        match peer.next_event(EVENT_POLL)? {
            Some(PeerEvent::Frame(frame)) => {
                print_frame(&frame, format);
                peer.send_ack(frame.meta.frame_id)?;
                *received += 1;
                if args.count.is_some_and(|count| *received >= count) {
                    return Ok(());
                }
            }
            Some(PeerEvent::Control(ControlMessage::StopStream(stop))) => {
                info!(reason = ?stop.reason, "producer stopped streaming");
            }
            Some(PeerEvent::Control(ControlMessage::Error(error))) => {
                warn!(code = %error.code, message = %error.message, "producer reported an error");
            }
            Some(PeerEvent::Control(message)) => {
                debug!(kind = %message.message_type(), "control message");
            }
            None => {}
        }
    }
    Ok(())
}
