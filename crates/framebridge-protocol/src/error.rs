use crate::code::ErrorCode;

/// Errors raised while encoding, decoding, or validating control messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Structurally invalid, unknown type, or wrong message for the phase.
    #[error("protocol mismatch: {0}")]
    Mismatch(String),

    /// Encoded control message exceeds the control frame limit.
    #[error("control message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The MessagePack payload could not be encoded or decoded.
    #[error("msgpack codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    pub fn mismatch(message: impl Into<String>) -> Self {
        ProtocolError::Mismatch(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            ProtocolError::Mismatch(_) | ProtocolError::Codec(_) => ErrorCode::ProtocolMismatch,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
