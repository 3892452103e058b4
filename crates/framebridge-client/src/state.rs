use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection lifecycle of a [`BridgeClient`](crate::BridgeClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disabled,
    Listening,
    Handshaking,
    Streaming,
    Recovering,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disabled => "disabled",
            ConnectionState::Listening => "listening",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent user-facing error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
}

impl LastError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::error::ClientError> for LastError {
    fn from(err: &crate::error::ClientError) -> Self {
        let message = match err {
            crate::error::ClientError::Peer { message, .. } if !message.is_empty() => {
                message.clone()
            }
            other => other.to_string(),
        };
        LastError::new(err.code_str(), message)
    }
}

/// Stream size requested by the consumer through heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TargetSize {
    /// Keep only positive dimensions that fit a frame size.
    pub fn from_hint(width: Option<i64>, height: Option<i64>) -> Self {
        Self {
            width: positive(width),
            height: positive(height),
        }
    }

    pub fn is_set(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

fn positive(value: Option<i64>) -> Option<u32> {
    value
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
}

/// Point-in-time snapshot of the client, suitable for status panels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    pub enabled: bool,
    pub port: u16,
    pub transport: Option<String>,
    pub degraded: bool,
    pub session_id: Option<u64>,
    pub inflight_frames: usize,
    pub max_inflight_frames: usize,
    pub target_stream_width: Option<u32>,
    pub target_stream_height: Option<u32>,
    pub last_error: Option<LastError>,
}
