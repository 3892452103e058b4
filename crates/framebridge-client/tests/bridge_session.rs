use std::net::TcpListener;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framebridge_client::{
    BridgeClient, BridgeContext, BridgeSettings, ClientError, ClientOptions, ClientTiming,
    ConnectionState, ConsumerListener, ConsumerPeer, FrameSender, PeerConfig, PeerEvent,
};
use framebridge_protocol::{ControlMessage, TransportKind};

fn timing(backoff: Duration) -> ClientTiming {
    ClientTiming {
        heartbeat_timeout: Duration::from_secs(3),
        handshake_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
        idle_poll: Duration::from_millis(20),
        backoff: vec![backoff],
        ..ClientTiming::default()
    }
}

fn client_with(timing: ClientTiming) -> Arc<BridgeClient> {
    Arc::new(BridgeClient::new(ClientOptions {
        timing,
        ..ClientOptions::default()
    }))
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral bind should work");
    listener.local_addr().expect("bound socket has an address").port()
}

/// Listener on an ephemeral port plus a client streaming to it.
fn connected(
    config: PeerConfig,
    timing: ClientTiming,
) -> (ConsumerListener, ConsumerPeer, Arc<BridgeClient>) {
    let listener = ConsumerListener::bind(0)
        .expect("listener should bind")
        .with_config(config);
    let port = listener.port().expect("listener has a port");
    let client = client_with(timing);
    client.configure(u32::from(port), true).expect("port is valid");

    let peer = listener
        .accept_timeout(Duration::from_secs(3))
        .expect("handshake should succeed")
        .expect("client should connect");
    assert!(
        wait_until(Duration::from_secs(2), || client.state() == ConnectionState::Streaming),
        "client never reached streaming: {:?}",
        client.status()
    );
    (listener, peer, client)
}

fn next_non_heartbeat(peer: &mut ConsumerPeer) -> PeerEvent {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match peer.next_event(remaining).expect("peer read should succeed") {
            Some(PeerEvent::Control(ControlMessage::Heartbeat(_))) => continue,
            Some(event) => return event,
            None => panic!("no event before deadline"),
        }
    }
}

fn collect_states(rx: &Receiver<ConnectionState>, count: usize) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while states.len() < count && Instant::now() < deadline {
        if let Ok(state) = rx.recv_timeout(Duration::from_millis(100)) {
            states.push(state);
        }
    }
    states
}

type StateLog = Vec<(ConnectionState, Instant)>;

/// Record transitions with their arrival time until `done` holds.
fn record_until(
    rx: &Receiver<ConnectionState>,
    log: &mut StateLog,
    timeout: Duration,
    done: impl Fn(&[(ConnectionState, Instant)]) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while !done(log) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if let Ok(state) = rx.recv_timeout(remaining.min(Duration::from_millis(50))) {
            log.push((state, Instant::now()));
        }
    }
    true
}

/// Time spent in `recovering` before each retry.
fn recovery_delays(log: &[(ConnectionState, Instant)]) -> Vec<Duration> {
    log.windows(2)
        .filter_map(|pair| match pair {
            [(ConnectionState::Recovering, entered), (ConnectionState::Listening, left)] => {
                Some(left.duration_since(*entered))
            }
            _ => None,
        })
        .collect()
}

/// Recovery delays observed after the first `streaming` transition.
fn delays_after_streaming(log: &[(ConnectionState, Instant)]) -> Vec<Duration> {
    log.iter()
        .position(|(state, _)| *state == ConnectionState::Streaming)
        .map(|start| recovery_delays(&log[start..]))
        .unwrap_or_default()
}

fn pattern(width: u32, height: u32) -> Vec<u8> {
    (0..width * height * 4).map(|i| (i % 251) as u8).collect()
}

#[test]
fn tcp_lz4_frame_arrives_as_meta_then_chunk() {
    let (_listener, mut peer, client) =
        connected(PeerConfig::default(), timing(Duration::from_millis(50)));
    assert_eq!(peer.hello().client_name, "framebridge");
    assert_eq!(client.selected_transport(), Some(TransportKind::TcpLz4));

    let mut sender = FrameSender::new(client.clone());
    sender.start_stream(Some("test")).unwrap();
    let pixels = pattern(4, 4);
    assert_eq!(sender.send_rgba_frame(4, 4, &pixels, None, None).unwrap(), Some(1));

    match next_non_heartbeat(&mut peer) {
        PeerEvent::Control(ControlMessage::StartStream(start)) => {
            assert_eq!(start.stream_id.as_deref(), Some("test"));
        }
        other => panic!("expected start_stream, got {other:?}"),
    }
    match next_non_heartbeat(&mut peer) {
        PeerEvent::Frame(frame) => {
            assert_eq!(frame.meta.frame_id, 1);
            assert_eq!((frame.meta.width, frame.meta.height, frame.meta.stride), (4, 4, 16));
            assert_eq!(frame.meta.transport, "tcp_lz4");
            assert_eq!(frame.meta.chunk_size, Some(frame.wire_len as u64));
            assert_eq!(&frame.pixels[..], &pixels[..]);
        }
        other => panic!("expected a frame, got {other:?}"),
    }

    assert_eq!(client.status().inflight_frames, 1);
    peer.send_ack(1).unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.status().inflight_frames == 0));

    client.shutdown();
    assert_eq!(client.state(), ConnectionState::Disabled);
}

#[cfg(unix)]
#[test]
fn shm_frame_is_read_from_the_ring() {
    let config = PeerConfig {
        transport: TransportKind::Shm,
        ..PeerConfig::default()
    };
    let (_listener, mut peer, client) = connected(config, timing(Duration::from_millis(50)));
    assert_eq!(client.selected_transport(), Some(TransportKind::Shm));

    let mut sender = FrameSender::new(client.clone());
    sender.start_stream(None).unwrap();
    let pixels = pattern(8, 2);
    for expected_id in 1..=4u64 {
        assert_eq!(
            sender.send_rgba_frame(8, 2, &pixels, None, Some(1_000)).unwrap(),
            Some(expected_id)
        );
        let frame = peer
            .next_frame(Duration::from_secs(2))
            .unwrap()
            .expect("frame should arrive");
        assert_eq!(frame.meta.frame_id, expected_id);
        assert_eq!(frame.meta.shm_slot, Some(((expected_id - 1) % 3) as u32));
        assert_eq!(frame.meta.timestamp_ms, 1_000);
        assert_eq!(&frame.pixels[..], &pixels[..]);
    }

    sender.stop_stream(Some("done")).unwrap();
    client.shutdown();
}

#[test]
fn missing_listener_cycles_through_recovering() {
    let client = client_with(timing(Duration::from_millis(50)));
    let states = client.watch_state();
    client.configure(u32::from(free_port()), true).unwrap();

    let seen = collect_states(&states, 4);
    assert_eq!(
        seen,
        vec![
            ConnectionState::Listening,
            ConnectionState::Recovering,
            ConnectionState::Listening,
            ConnectionState::Recovering,
        ]
    );
    let last = client.last_error().expect("connect failure is recorded");
    assert_eq!(last.code, "E_SOCKET_IO");

    client.shutdown();
    assert_eq!(client.state(), ConnectionState::Disabled);
    assert!(client.last_error().is_none());
}

#[test]
fn heartbeat_target_updates_the_hint() {
    let (_listener, mut peer, client) =
        connected(PeerConfig::default(), timing(Duration::from_millis(50)));
    peer.send_heartbeat(Some((320, 240))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        client.target_size_hint().width == Some(320)
    }));
    let status = client.status();
    assert_eq!(status.target_stream_width, Some(320));
    assert_eq!(status.target_stream_height, Some(240));
    client.shutdown();
}

#[test]
fn peer_error_ends_the_session_with_its_code() {
    let (_listener, mut peer, client) =
        connected(PeerConfig::default(), timing(Duration::from_secs(30)));
    peer.send_error("E_CUSTOM", "consumer is shutting down").unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == ConnectionState::Recovering
    }));
    let last = client.last_error().expect("peer error is recorded");
    assert_eq!(last.code, "E_CUSTOM");
    assert_eq!(last.message, "consumer is shutting down");
    assert_eq!(client.status().session_id, None);
    client.shutdown();
}

#[test]
fn silent_peer_times_out() {
    let mut fast = timing(Duration::from_secs(30));
    fast.heartbeat_timeout = Duration::from_millis(300);
    let (_listener, _peer, client) = connected(PeerConfig::default(), fast);

    assert!(wait_until(Duration::from_secs(3), || {
        client.state() == ConnectionState::Recovering
    }));
    assert_eq!(client.last_error().unwrap().code, "E_HEARTBEAT_TIMEOUT");
    client.shutdown();
}

#[test]
fn rejected_hello_is_a_protocol_mismatch() {
    let listener = ConsumerListener::bind(0).unwrap().with_config(PeerConfig {
        accept: false,
        reject_reason: Some("busy".to_string()),
        ..PeerConfig::default()
    });
    let port = listener.port().unwrap();
    let client = client_with(timing(Duration::from_secs(30)));
    client.configure(u32::from(port), true).unwrap();

    assert!(listener.accept_timeout(Duration::from_secs(3)).is_err());
    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == ConnectionState::Recovering
    }));
    let last = client.last_error().unwrap();
    assert_eq!(last.code, "E_PROTO_MISMATCH");
    assert!(last.message.contains("busy"), "{}", last.message);
    client.shutdown();
}

#[test]
fn peer_close_after_streaming_reconnects_without_backoff() {
    let (listener, peer, client) =
        connected(PeerConfig::default(), timing(Duration::from_secs(30)));
    let first_session = client.status().session_id;
    peer.close();

    let second = listener
        .accept_timeout(Duration::from_secs(2))
        .unwrap()
        .expect("client should reconnect immediately");
    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == ConnectionState::Streaming
    }));
    assert!(client.last_error().is_none());
    assert_ne!(client.status().session_id, first_session);

    drop(second);
    client.shutdown();
}

#[test]
fn disable_drops_back_to_disabled() {
    let (_listener, _peer, client) =
        connected(PeerConfig::default(), timing(Duration::from_millis(50)));
    client.disable_connection();
    assert_eq!(client.state(), ConnectionState::Disabled);
    assert!(!client.is_enabled());
    let status = client.status();
    assert_eq!(status.transport, None);
    assert_eq!(status.session_id, None);
    assert_eq!(status.inflight_frames, 0);
}

#[test]
fn backoff_grows_across_failures_and_resets_after_streaming() {
    let client = client_with(ClientTiming {
        backoff: vec![
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(900),
        ],
        ..timing(Duration::ZERO)
    });
    let states = client.watch_state();
    let port = free_port();
    client.configure(u32::from(port), true).unwrap();

    let mut log = StateLog::new();
    assert!(record_until(&states, &mut log, Duration::from_secs(5), |log| {
        recovery_delays(log).len() >= 3
    }));
    let delays = recovery_delays(&log);
    assert!(delays[0] < Duration::from_millis(250), "{delays:?}");
    assert!(
        delays[1] >= Duration::from_millis(250) && delays[1] < Duration::from_millis(800),
        "{delays:?}"
    );
    assert!(delays[2] >= Duration::from_millis(800), "{delays:?}");

    let listener = ConsumerListener::bind(port).expect("port is still free");
    let mut peer = listener
        .accept_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("client should retry into the new listener");
    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == ConnectionState::Streaming
    }));

    peer.send_error("E_CUSTOM", "restarting").unwrap();
    assert!(record_until(&states, &mut log, Duration::from_secs(3), |log| {
        !delays_after_streaming(log).is_empty()
    }));
    let first_after_streaming = delays_after_streaming(&log)[0];
    assert!(
        first_after_streaming < Duration::from_millis(250),
        "backoff was not reset: {first_after_streaming:?}"
    );

    client.shutdown();
}

#[test]
fn peer_that_stops_reading_cannot_wedge_the_worker() {
    let mut fast = timing(Duration::from_secs(30));
    fast.heartbeat_timeout = Duration::from_millis(300);
    let (_listener, _peer, client) = connected(PeerConfig::default(), fast);

    let chunk = vec![0u8; 8 << 20];
    for _ in 0..8 {
        client.enqueue_binary_chunk(&chunk, None).unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(3), || {
            client.state() == ConnectionState::Recovering
        }),
        "worker still {:?}",
        client.status()
    );
    let code = client.last_error().expect("stalled session is recorded").code;
    assert!(code == "E_SOCKET_IO" || code == "E_HEARTBEAT_TIMEOUT", "{code}");
    client.shutdown();
}

#[cfg(unix)]
#[test]
fn undersized_ring_segment_ends_the_session() {
    use framebridge_transport::{ring_name, slot_size_for, ShmSegment};

    let config = PeerConfig {
        transport: TransportKind::Shm,
        ..PeerConfig::default()
    };
    let (listener, _peer, client) = connected(config, timing(Duration::from_secs(30)));
    let port = listener.port().unwrap();
    let name = ring_name(port, slot_size_for(64 * 64 * 4));
    let mut squatter = ShmSegment::create(&name, 4096).expect("segment under the ring name");

    let mut sender = FrameSender::new(client.clone());
    sender.start_stream(None).unwrap();
    let err = sender
        .send_rgba_frame(64, 64, &pattern(64, 64), None, None)
        .unwrap_err();
    assert_eq!(err.code().as_str(), "E_SHM_ATTACH_FAIL");

    assert!(wait_until(Duration::from_secs(2), || {
        client.state() == ConnectionState::Recovering
    }));
    assert_eq!(client.last_error().unwrap().code, "E_SHM_ATTACH_FAIL");
    assert_eq!(client.status().session_id, None);

    client.shutdown();
    squatter.unlink().unwrap();
}

#[test]
fn context_rejects_short_buffers_when_downscaling() {
    let listener = ConsumerListener::bind(0).unwrap();
    let port = listener.port().unwrap();
    let ctx = BridgeContext::with_options(
        BridgeSettings {
            port: u32::from(port),
            enable: true,
            ..BridgeSettings::default()
        },
        ClientOptions {
            timing: timing(Duration::from_millis(50)),
            ..ClientOptions::default()
        },
    );
    ctx.start().unwrap();
    let mut peer = listener
        .accept_timeout(Duration::from_secs(3))
        .unwrap()
        .expect("producer should connect");
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.status().state == ConnectionState::Streaming
    }));
    peer.send_heartbeat(Some((2, 2))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.target_size_hint().width == Some(2)
    }));

    let err = ctx.push_frame(4, 4, &[0u8; 10], None).unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)), "{err}");

    assert_eq!(ctx.push_frame(4, 4, &pattern(4, 4), None).unwrap(), Some(1));
    let frame = peer
        .next_frame(Duration::from_secs(2))
        .unwrap()
        .expect("downscaled frame should arrive");
    assert_eq!((frame.meta.width, frame.meta.height), (2, 2));
    assert_eq!(frame.pixels.len(), 2 * 2 * 4);

    ctx.shutdown();
}
