use std::time::Duration;

use framebridge_frame::FrameError;
use framebridge_protocol::{ErrorCode, ProtocolError};
use framebridge_transport::TransportError;

/// Errors that can occur in bridge client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Port outside the allowed range.
    #[error("port must be within 1024-65535, got {0}")]
    PortInvalid(u32),

    /// Frame-level error on the control socket.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Control message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket or shared-memory transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer rejected or botched the handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer sent an `error` message.
    #[error("peer error {code}: {message}")]
    Peer { code: String, message: String },

    /// No heartbeat arrived from the peer in time.
    #[error("no heartbeat from peer for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The worker thread could not be started.
    #[error("failed to launch bridge worker: {0}")]
    Launch(std::io::Error),

    /// Caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session was ended by a stop request.
    #[error("stop requested")]
    StopRequested,
}

impl ClientError {
    /// Status-surface code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::PortInvalid(_) => ErrorCode::PortInvalid,
            ClientError::Frame(FrameError::MessageTooLarge { .. }) => ErrorCode::MessageTooLarge,
            ClientError::Frame(_) => ErrorCode::SocketIo,
            ClientError::Protocol(err) => err.code(),
            ClientError::Transport(err) if err.is_addr_in_use() => ErrorCode::PortInUse,
            ClientError::Transport(err) if err.is_shm() => ErrorCode::ShmAttachFailed,
            ClientError::Transport(_) => ErrorCode::SocketIo,
            ClientError::HandshakeFailed(_) => ErrorCode::ProtocolMismatch,
            ClientError::Peer { code, .. } => code.parse().unwrap_or(ErrorCode::ProtocolMismatch),
            ClientError::HeartbeatTimeout(_) => ErrorCode::HeartbeatTimeout,
            ClientError::Launch(_) => ErrorCode::LaunchFailed,
            ClientError::InvalidArgument(_) => ErrorCode::ProtocolMismatch,
            ClientError::StopRequested => ErrorCode::StopRequested,
        }
    }

    /// Code string as recorded in status snapshots. Peer errors keep the
    /// peer's own code even when it is not one of ours.
    pub fn code_str(&self) -> String {
        match self {
            ClientError::Peer { code, .. } if !code.trim().is_empty() => code.clone(),
            other => other.code().as_str().to_string(),
        }
    }

    /// True when the peer simply went away (EOF, reset, abort).
    pub fn is_peer_close(&self) -> bool {
        match self {
            ClientError::Frame(err) => err.is_peer_close(),
            ClientError::Transport(TransportError::Io(err)) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(TransportError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn codes_follow_error_source() {
        assert_eq!(ClientError::PortInvalid(80).code(), ErrorCode::PortInvalid);
        assert_eq!(
            ClientError::Frame(FrameError::MessageTooLarge { size: 2, max: 1 }).code(),
            ErrorCode::MessageTooLarge
        );
        assert_eq!(
            ClientError::Frame(FrameError::ConnectionClosed).code(),
            ErrorCode::SocketIo
        );
        assert_eq!(
            ClientError::Protocol(ProtocolError::mismatch("x")).code(),
            ErrorCode::ProtocolMismatch
        );
        assert_eq!(
            ClientError::Transport(TransportError::ShmAttach {
                name: "r".into(),
                reason: "small".into()
            })
            .code(),
            ErrorCode::ShmAttachFailed
        );
        assert_eq!(
            ClientError::HeartbeatTimeout(Duration::from_secs(5)).code(),
            ErrorCode::HeartbeatTimeout
        );
    }

    #[test]
    fn peer_codes_are_kept_verbatim() {
        let known = ClientError::Peer {
            code: "E_SOCKET_IO".into(),
            message: "m".into(),
        };
        assert_eq!(known.code(), ErrorCode::SocketIo);
        assert_eq!(known.code_str(), "E_SOCKET_IO");

        let custom = ClientError::Peer {
            code: "E_CUSTOM".into(),
            message: "m".into(),
        };
        assert_eq!(custom.code(), ErrorCode::ProtocolMismatch);
        assert_eq!(custom.code_str(), "E_CUSTOM");

        let empty = ClientError::Peer {
            code: String::new(),
            message: "m".into(),
        };
        assert_eq!(empty.code_str(), "E_PROTO_MISMATCH");
    }

    #[test]
    fn peer_close_detection() {
        assert!(ClientError::Frame(FrameError::ConnectionClosed).is_peer_close());
        assert!(ClientError::Frame(FrameError::Io(io::Error::from(
            io::ErrorKind::ConnectionReset
        )))
        .is_peer_close());
        assert!(ClientError::from(io::Error::from(io::ErrorKind::ConnectionAborted)).is_peer_close());
        assert!(!ClientError::Frame(FrameError::Io(io::Error::from(io::ErrorKind::TimedOut)))
            .is_peer_close());
        assert!(!ClientError::HeartbeatTimeout(Duration::from_secs(1)).is_peer_close());
    }
}
