use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced in status snapshots and `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_PORT_INVALID")]
    PortInvalid,
    #[serde(rename = "E_PORT_IN_USE")]
    PortInUse,
    #[serde(rename = "E_PROTO_MISMATCH")]
    ProtocolMismatch,
    #[serde(rename = "E_MSG_TOO_LARGE")]
    MessageTooLarge,
    #[serde(rename = "E_SHM_ATTACH_FAIL")]
    ShmAttachFailed,
    #[serde(rename = "E_LAUNCH_FAILED")]
    LaunchFailed,
    #[serde(rename = "E_SOCKET_IO")]
    SocketIo,
    #[serde(rename = "E_HEARTBEAT_TIMEOUT")]
    HeartbeatTimeout,
    #[serde(rename = "E_STOP_REQUESTED")]
    StopRequested,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::PortInvalid,
        ErrorCode::PortInUse,
        ErrorCode::ProtocolMismatch,
        ErrorCode::MessageTooLarge,
        ErrorCode::ShmAttachFailed,
        ErrorCode::LaunchFailed,
        ErrorCode::SocketIo,
        ErrorCode::HeartbeatTimeout,
        ErrorCode::StopRequested,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PortInvalid => "E_PORT_INVALID",
            ErrorCode::PortInUse => "E_PORT_IN_USE",
            ErrorCode::ProtocolMismatch => "E_PROTO_MISMATCH",
            ErrorCode::MessageTooLarge => "E_MSG_TOO_LARGE",
            ErrorCode::ShmAttachFailed => "E_SHM_ATTACH_FAIL",
            ErrorCode::LaunchFailed => "E_LAUNCH_FAILED",
            ErrorCode::SocketIo => "E_SOCKET_IO",
            ErrorCode::HeartbeatTimeout => "E_HEARTBEAT_TIMEOUT",
            ErrorCode::StopRequested => "E_STOP_REQUESTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}
