use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use framebridge_frame::{FrameReader, FrameWriter};
use framebridge_protocol::{
    build, decode_control_message, encode_control_message, parse_hello_ack, ControlMessage, Hello,
    TransportKind, DEFAULT_CAPABILITIES, HEARTBEAT_TIMEOUT_MS, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Configuration for the producer side of the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long to wait for `hello_ack` after sending `hello`.
    pub timeout: Duration,
    pub client_name: String,
    pub client_version: String,
    pub capabilities: Vec<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            client_name: "framebridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Result of a successful producer handshake.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub transport: TransportKind,
    pub server_version: Option<String>,
    /// Frames that arrived in the same read as `hello_ack`.
    pub pending: Vec<Bytes>,
}

/// Send `hello` and wait for an accepting `hello_ack`.
///
/// The first control frame must be a `hello_ack`; anything else, a
/// rejection, an unknown transport, or silence until the timeout fails the
/// handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
    stop: &AtomicBool,
) -> Result<HandshakeResult> {
    let capabilities: Vec<&str> = config.capabilities.iter().map(String::as_str).collect();
    let hello = build::hello(
        &config.client_name,
        &config.client_version,
        Some(capabilities.as_slice()),
    );
    send_control(writer, &hello)?;

    let deadline = Instant::now() + config.timeout;
    let (first, pending) = recv_first_frame(reader, deadline, config.timeout, Some(stop))?;
    let message = decode_control_message(&first)?;
    let ack = parse_hello_ack(&message)?;

    if !ack.accepted {
        let reason = ack
            .reason
            .clone()
            .unwrap_or_else(|| "peer rejected handshake".to_string());
        return Err(ClientError::HandshakeFailed(reason));
    }

    let transport = ack.transport_kind().ok_or_else(|| {
        ClientError::HandshakeFailed(format!(
            "unknown transport: {}",
            ack.selected_transport.as_deref().unwrap_or("<none>")
        ))
    })?;

    debug!(%transport, server_version = ?ack.server_version, "handshake accepted");
    Ok(HandshakeResult {
        transport,
        server_version: ack.server_version.clone(),
        pending,
    })
}

/// Consumer side: wait for `hello`, validate it, and answer with `reply`.
///
/// A `hello` with the wrong magic or protocol version is answered with a
/// rejecting `hello_ack` regardless of `reply`.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    reply: &ControlMessage,
    timeout: Duration,
) -> Result<(Hello, Vec<Bytes>)> {
    let deadline = Instant::now() + timeout;
    let (first, pending) = recv_first_frame(reader, deadline, timeout, None)?;

    let hello = match decode_control_message(&first)? {
        ControlMessage::Hello(hello) => hello,
        other => {
            return Err(ClientError::HandshakeFailed(format!(
                "expected hello, got {}",
                other.message_type()
            )))
        }
    };

    if hello.magic != PROTOCOL_MAGIC || hello.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "unsupported protocol {} v{} (expected {PROTOCOL_MAGIC} v{PROTOCOL_VERSION})",
            hello.magic, hello.protocol_version
        );
        send_control(writer, &build::hello_ack(false, None, None, Some(&reason)))?;
        return Err(ClientError::HandshakeFailed(reason));
    }

    send_control(writer, reply)?;
    debug!(client = %hello.client_name, version = %hello.client_version, "answered hello");
    Ok((hello, pending))
}

pub(crate) fn send_control<W: Write>(
    writer: &mut FrameWriter<W>,
    message: &ControlMessage,
) -> Result<()> {
    let payload = encode_control_message(message)?;
    writer.send(&payload)?;
    Ok(())
}

fn recv_first_frame<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
    stop: Option<&AtomicBool>,
) -> Result<(Bytes, Vec<Bytes>)> {
    loop {
        if stop.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(ClientError::StopRequested);
        }
        if Instant::now() >= deadline {
            return Err(ClientError::HandshakeFailed(format!(
                "no hello_ack within {timeout:?}"
            )));
        }

        let mut frames = reader.poll()?.into_iter();
        if let Some(first) = frames.next() {
            return Ok((first, frames.collect()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use framebridge_frame::{FrameConfig, FrameError};
    use framebridge_protocol::{ErrorCode, TRANSPORT_SHM, TRANSPORT_TCP_LZ4};

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn endpoints(stream: TcpStream) -> (FrameReader<TcpStream>, FrameWriter<TcpStream>) {
        let config = FrameConfig {
            read_timeout: Some(Duration::from_millis(20)),
            write_timeout: Some(Duration::from_millis(200)),
            ..FrameConfig::default()
        };
        let reader = FrameReader::with_config_tcp(stream.try_clone().unwrap(), config.clone()).unwrap();
        let writer = FrameWriter::with_config_tcp(stream, config).unwrap();
        (reader, writer)
    }

    fn quick() -> HandshakeConfig {
        HandshakeConfig {
            timeout: Duration::from_millis(500),
            ..HandshakeConfig::default()
        }
    }

    fn run_client(stream: TcpStream, config: HandshakeConfig) -> Result<HandshakeResult> {
        let (mut reader, mut writer) = endpoints(stream);
        let stop = AtomicBool::new(false);
        handshake_client(&mut reader, &mut writer, &config, &stop)
    }

    #[test]
    fn accepted_handshake_selects_transport() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            let reply = build::hello_ack(true, Some("1.0"), Some(TRANSPORT_TCP_LZ4), None);
            handshake_server(&mut reader, &mut writer, &reply, Duration::from_secs(1)).unwrap()
        });

        let result = run_client(client, quick()).unwrap();
        assert_eq!(result.transport, TransportKind::TcpLz4);
        assert_eq!(result.server_version.as_deref(), Some("1.0"));

        let (hello, _) = server.join().unwrap();
        assert_eq!(hello.magic, PROTOCOL_MAGIC);
        assert_eq!(hello.client_name, "framebridge");
        assert_eq!(hello.capabilities.len(), DEFAULT_CAPABILITIES.len());
    }

    #[test]
    fn transport_aliases_are_accepted() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            let reply = build::hello_ack(true, None, Some("shared-memory"), None);
            handshake_server(&mut reader, &mut writer, &reply, Duration::from_secs(1)).unwrap();
        });

        let result = run_client(client, quick()).unwrap();
        assert_eq!(result.transport, TransportKind::Shm);
        server.join().unwrap();
    }

    #[test]
    fn rejection_is_a_protocol_mismatch() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            let reply = build::hello_ack(false, None, None, Some("busy"));
            handshake_server(&mut reader, &mut writer, &reply, Duration::from_secs(1)).unwrap();
        });

        let err = run_client(client, quick()).unwrap_err();
        assert!(matches!(&err, ClientError::HandshakeFailed(reason) if reason == "busy"));
        assert_eq!(err.code(), ErrorCode::ProtocolMismatch);
        server.join().unwrap();
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            let reply = build::hello_ack(true, None, Some("carrier_pigeon"), None);
            handshake_server(&mut reader, &mut writer, &reply, Duration::from_secs(1)).unwrap();
        });

        let err = run_client(client, quick()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolMismatch);
        server.join().unwrap();
    }

    #[test]
    fn wrong_first_message_fails() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            reader.read_frame().unwrap();
            send_control(&mut writer, &build::heartbeat(1)).unwrap();
        });

        let err = run_client(client, quick()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolMismatch);
        server.join().unwrap();
    }

    #[test]
    fn silent_peer_times_out() {
        let (client, server) = pair();
        let err = run_client(
            client,
            HandshakeConfig {
                timeout: Duration::from_millis(100),
                ..HandshakeConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::HandshakeFailed(_)));
        drop(server);
    }

    #[test]
    fn closed_peer_is_a_socket_error() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, _writer) = endpoints(server);
            reader.read_frame().unwrap();
        });
        server.join().unwrap();

        let err = run_client(client, quick()).unwrap_err();
        assert!(matches!(err, ClientError::Frame(FrameError::ConnectionClosed)) || err.is_peer_close());
        assert_eq!(err.code(), ErrorCode::SocketIo);
    }

    #[test]
    fn stop_flag_interrupts_wait() {
        let (client, _server) = pair();
        let (mut reader, mut writer) = endpoints(client);
        let stop = AtomicBool::new(true);
        let err = handshake_client(&mut reader, &mut writer, &quick(), &stop).unwrap_err();
        assert!(matches!(err, ClientError::StopRequested));
    }

    #[test]
    fn server_rejects_foreign_magic() {
        let (client, server) = pair();
        let server = thread::spawn(move || {
            let (mut reader, mut writer) = endpoints(server);
            let reply = build::hello_ack(true, None, Some(TRANSPORT_SHM), None);
            handshake_server(&mut reader, &mut writer, &reply, Duration::from_secs(1))
        });

        let (mut reader, mut writer) = endpoints(client);
        let mut hello = build::hello("x", "1", None);
        if let ControlMessage::Hello(inner) = &mut hello {
            inner.magic = "OTHER".into();
        }
        send_control(&mut writer, &hello).unwrap();
        let reply = decode_control_message(&reader.read_frame().unwrap()).unwrap();
        assert!(matches!(reply, ControlMessage::HelloAck(ack) if !ack.accepted));
        assert!(server.join().unwrap().is_err());
    }
}
