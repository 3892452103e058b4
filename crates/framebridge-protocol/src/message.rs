use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::trace;

use crate::codec::{default_codec, ValueCodec};
use crate::constants::{
    DEFAULT_CAPABILITIES, MAX_CONTROL_MESSAGE_BYTES, PIXEL_FORMAT_RGBA8, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, TRANSPORT_SHM, TRANSPORT_TCP_LZ4,
};
use crate::error::{ProtocolError, Result};
use crate::value::Value;

/// Control message types, in wire index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    HelloAck,
    StartStream,
    StopStream,
    FrameMeta,
    Ack,
    Error,
    Heartbeat,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Hello,
        MessageType::HelloAck,
        MessageType::StartStream,
        MessageType::StopStream,
        MessageType::FrameMeta,
        MessageType::Ack,
        MessageType::Error,
        MessageType::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::HelloAck => "hello_ack",
            MessageType::StartStream => "start_stream",
            MessageType::StopStream => "stop_stream",
            MessageType::FrameMeta => "frame_meta",
            MessageType::Ack => "ack",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Parse a type name (trimmed, case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|ty| ty.as_str() == name)
    }

    /// Resolve a wire token: a type name or a numeric index.
    pub fn from_token(token: &Value) -> Option<Self> {
        match token {
            Value::Str(name) => Self::from_name(name),
            other => other.as_i64().and_then(Self::from_index),
        }
    }

    /// Positional field order for list-form payloads.
    pub fn field_names(self) -> &'static [&'static str] {
        match self {
            MessageType::Hello => &[
                "magic",
                "protocolVersion",
                "capabilities",
                "clientName",
                "clientVersion",
            ],
            MessageType::HelloAck => &["accepted", "serverVersion", "selectedTransport", "reason"],
            MessageType::StartStream => &["streamId"],
            MessageType::StopStream => &["reason"],
            MessageType::FrameMeta => &[
                "frameId",
                "width",
                "height",
                "stride",
                "pixelFormat",
                "transport",
                "shmSlot",
                "chunkSize",
                "timestampMs",
            ],
            MessageType::Ack => &["frameId"],
            MessageType::Error => &["code", "message"],
            MessageType::Heartbeat => &["timestampMs"],
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiated frame transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Shm,
    TcpLz4,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Shm => TRANSPORT_SHM,
            TransportKind::TcpLz4 => TRANSPORT_TCP_LZ4,
        }
    }

    /// Accepts canonical names and their aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shm" | "shared_memory" | "shared-memory" => Some(TransportKind::Shm),
            "tcp_lz4" | "tcp-lz4" | "tcplz4" => Some(TransportKind::TcpLz4),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a transport field: known aliases and the indices 0/1 become the
/// canonical names; any other value passes through unchanged.
pub fn normalize_transport(value: &Value) -> Value {
    match value {
        Value::Str(s) => match TransportKind::parse(s) {
            Some(kind) => Value::str(kind.as_str()),
            None => value.clone(),
        },
        other => match other.as_i64() {
            Some(0) => Value::str(TRANSPORT_SHM),
            Some(1) => Value::str(TRANSPORT_TCP_LZ4),
            _ => value.clone(),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub magic: String,
    pub protocol_version: i64,
    pub capabilities: Vec<String>,
    pub client_name: String,
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelloAck {
    pub accepted: bool,
    pub server_version: Option<String>,
    /// Normalized transport name; `None` when absent or not a string.
    pub selected_transport: Option<String>,
    pub reason: Option<String>,
}

impl HelloAck {
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self.selected_transport.as_deref() {
            Some(TRANSPORT_SHM) => Some(TransportKind::Shm),
            Some(TRANSPORT_TCP_LZ4) => Some(TransportKind::TcpLz4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartStream {
    pub stream_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopStream {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: String,
    pub transport: String,
    pub shm_slot: Option<u32>,
    pub chunk_size: Option<u64>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// Zero when missing or malformed.
    pub frame_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub timestamp_ms: i64,
    /// Consumer-requested stream size, sent by the peer.
    pub target_width: Option<i64>,
    pub target_height: Option<i64>,
}

/// A decoded or to-be-encoded control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Hello(Hello),
    HelloAck(HelloAck),
    StartStream(StartStream),
    StopStream(StopStream),
    FrameMeta(FrameMeta),
    Ack(Ack),
    Error(ErrorMessage),
    Heartbeat(Heartbeat),
}

/// Which of the accepted wire layouts an encoder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireShape {
    /// `{"type": name, "payload": {field: value}}`
    #[default]
    Canonical,
    /// `{name: {field: value}}`
    SingleKey,
    /// `[typeIndex, [values in field order]]`
    Positional,
}

impl WireShape {
    pub const ALL: [WireShape; 3] = [WireShape::Canonical, WireShape::SingleKey, WireShape::Positional];
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::Hello(_) => MessageType::Hello,
            ControlMessage::HelloAck(_) => MessageType::HelloAck,
            ControlMessage::StartStream(_) => MessageType::StartStream,
            ControlMessage::StopStream(_) => MessageType::StopStream,
            ControlMessage::FrameMeta(_) => MessageType::FrameMeta,
            ControlMessage::Ack(_) => MessageType::Ack,
            ControlMessage::Error(_) => MessageType::Error,
            ControlMessage::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Payload fields in table order, followed by any optional extras.
    fn fields(&self) -> Vec<(&'static str, Value)> {
        match self {
            ControlMessage::Hello(m) => vec![
                ("magic", Value::str(&m.magic)),
                ("protocolVersion", Value::Int(m.protocol_version)),
                (
                    "capabilities",
                    Value::Array(m.capabilities.iter().map(Value::str).collect()),
                ),
                ("clientName", Value::str(&m.client_name)),
                ("clientVersion", Value::str(&m.client_version)),
            ],
            ControlMessage::HelloAck(m) => vec![
                ("accepted", Value::Bool(m.accepted)),
                ("serverVersion", Value::from(m.server_version.clone())),
                ("selectedTransport", Value::from(m.selected_transport.clone())),
                ("reason", Value::from(m.reason.clone())),
            ],
            ControlMessage::StartStream(m) => vec![("streamId", Value::from(m.stream_id.clone()))],
            ControlMessage::StopStream(m) => vec![("reason", Value::from(m.reason.clone()))],
            ControlMessage::FrameMeta(m) => vec![
                ("frameId", Value::from(m.frame_id)),
                ("width", Value::from(m.width)),
                ("height", Value::from(m.height)),
                ("stride", Value::from(m.stride)),
                ("pixelFormat", Value::str(&m.pixel_format)),
                ("transport", Value::str(&m.transport)),
                ("shmSlot", Value::from(m.shm_slot)),
                ("chunkSize", Value::from(m.chunk_size)),
                ("timestampMs", Value::from(m.timestamp_ms)),
            ],
            ControlMessage::Ack(m) => vec![("frameId", Value::Int(m.frame_id))],
            ControlMessage::Error(m) => vec![
                ("code", Value::str(&m.code)),
                ("message", Value::str(&m.message)),
            ],
            ControlMessage::Heartbeat(m) => {
                let mut fields = vec![("timestampMs", Value::Int(m.timestamp_ms))];
                if let Some(w) = m.target_width {
                    fields.push(("targetWidth", Value::Int(w)));
                }
                if let Some(h) = m.target_height {
                    fields.push(("targetHeight", Value::Int(h)));
                }
                fields
            }
        }
    }

    /// Build the dynamic wire value in the requested shape.
    ///
    /// The positional shape carries only the table fields, so heartbeat
    /// target sizes are dropped in that form.
    pub fn to_value(&self, shape: WireShape) -> Value {
        let ty = self.message_type();
        let fields = self.fields();
        match shape {
            WireShape::Canonical => Value::Map(vec![
                (Value::str("type"), Value::str(ty.as_str())),
                (Value::str("payload"), fields_to_map(fields)),
            ]),
            WireShape::SingleKey => {
                Value::Map(vec![(Value::str(ty.as_str()), fields_to_map(fields))])
            }
            WireShape::Positional => {
                let names = ty.field_names();
                let values = fields
                    .into_iter()
                    .filter(|(name, _)| names.contains(name))
                    .map(|(_, value)| value)
                    .collect();
                Value::Array(vec![Value::Int(i64::from(ty.index())), Value::Array(values)])
            }
        }
    }

    /// Interpret a decoded wire value, trying the canonical, single-key,
    /// and positional layouts in that order.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(result) = accept_canonical(value) {
            return result;
        }
        if let Some(result) = accept_single_key(value) {
            return result;
        }
        if let Some(result) = accept_positional(value) {
            return result;
        }
        Err(ProtocolError::mismatch("invalid control message structure"))
    }

    fn from_payload(ty: MessageType, payload: &Payload) -> Self {
        match ty {
            MessageType::Hello => ControlMessage::Hello(Hello {
                magic: payload.string("magic").unwrap_or_default(),
                protocol_version: payload.int("protocolVersion").unwrap_or_default(),
                capabilities: payload
                    .get("capabilities")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                client_name: payload.string("clientName").unwrap_or_default(),
                client_version: payload.string("clientVersion").unwrap_or_default(),
            }),
            MessageType::HelloAck => ControlMessage::HelloAck(HelloAck {
                accepted: payload
                    .get("accepted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                server_version: payload.string("serverVersion"),
                selected_transport: payload.string("selectedTransport"),
                reason: payload.string("reason"),
            }),
            MessageType::StartStream => ControlMessage::StartStream(StartStream {
                stream_id: payload.string("streamId"),
            }),
            MessageType::StopStream => ControlMessage::StopStream(StopStream {
                reason: payload.string("reason"),
            }),
            MessageType::FrameMeta => ControlMessage::FrameMeta(FrameMeta {
                frame_id: payload.uint("frameId").unwrap_or_default(),
                width: payload.u32("width").unwrap_or_default(),
                height: payload.u32("height").unwrap_or_default(),
                stride: payload.u32("stride").unwrap_or_default(),
                pixel_format: payload
                    .string("pixelFormat")
                    .unwrap_or_else(|| PIXEL_FORMAT_RGBA8.to_string()),
                transport: payload.string("transport").unwrap_or_default(),
                shm_slot: payload.u32("shmSlot"),
                chunk_size: payload.uint("chunkSize"),
                timestamp_ms: payload.uint("timestampMs").unwrap_or_default(),
            }),
            MessageType::Ack => ControlMessage::Ack(Ack {
                frame_id: payload.int_lossy("frameId").unwrap_or_default(),
            }),
            MessageType::Error => ControlMessage::Error(ErrorMessage {
                code: payload.string("code").unwrap_or_default(),
                message: payload.string("message").unwrap_or_default(),
            }),
            MessageType::Heartbeat => ControlMessage::Heartbeat(Heartbeat {
                timestamp_ms: payload.int_lossy("timestampMs").unwrap_or_default(),
                target_width: payload.int_lossy("targetWidth"),
                target_height: payload.int_lossy("targetHeight"),
            }),
        }
    }
}

fn fields_to_map(fields: Vec<(&'static str, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(name, value)| (Value::str(name), value))
            .collect(),
    )
}

/// Payload fields keyed by name, after positional expansion and transport
/// normalization.
struct Payload(Vec<(String, Value)>);

impl Payload {
    fn normalize(ty: MessageType, raw: &Value) -> Result<Self> {
        let mut fields: Vec<(String, Value)> = match raw {
            Value::Nil => Vec::new(),
            Value::Map(entries) => entries
                .iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect(),
            Value::Array(items) => ty
                .field_names()
                .iter()
                .zip(items)
                .map(|(name, v)| (name.to_string(), v.clone()))
                .collect(),
            _ => return Err(ProtocolError::mismatch("message payload is not a map")),
        };

        let transport_field = match ty {
            MessageType::HelloAck => Some("selectedTransport"),
            MessageType::FrameMeta => Some("transport"),
            _ => None,
        };
        if let Some(field) = transport_field {
            for (name, value) in fields.iter_mut() {
                if name == field {
                    *value = normalize_transport(value);
                }
            }
        }
        Ok(Payload(fields))
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .filter(|v| !v.is_nil())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn int_lossy(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64_lossy)
    }

    fn uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.uint(key).and_then(|v| u32::try_from(v).ok())
    }
}

fn typed(ty: MessageType, payload: &Value) -> Result<ControlMessage> {
    let payload = Payload::normalize(ty, payload)?;
    Ok(ControlMessage::from_payload(ty, &payload))
}

/// `{"type": t, "payload": p}`. A present but unknown `type` is rejected
/// outright rather than falling through to the other layouts.
fn accept_canonical(value: &Value) -> Option<Result<ControlMessage>> {
    let type_token = value.get("type")?;
    let result = match MessageType::from_token(type_token) {
        Some(ty) => typed(ty, value.get("payload").unwrap_or(&Value::Nil)),
        None => Err(ProtocolError::mismatch("unsupported message type")),
    };
    Some(result)
}

/// `{t: p}` with exactly one entry whose key names a type.
fn accept_single_key(value: &Value) -> Option<Result<ControlMessage>> {
    let [(key, payload)] = value.as_map()? else {
        return None;
    };
    let ty = MessageType::from_token(key)?;
    trace!(message_type = %ty, "decoded single-key control message");
    Some(typed(ty, payload))
}

/// `[t, p]` where `t` is a type name or index.
fn accept_positional(value: &Value) -> Option<Result<ControlMessage>> {
    let [token, payload] = value.as_array()? else {
        return None;
    };
    let ty = MessageType::from_token(token)?;
    trace!(message_type = %ty, "decoded positional control message");
    Some(typed(ty, payload))
}

/// Encode with the default codec in the canonical shape.
pub fn encode_control_message(message: &ControlMessage) -> Result<Vec<u8>> {
    encode_shaped(message, WireShape::Canonical, default_codec())
}

/// Encode in a specific shape with a specific codec.
pub fn encode_shaped(
    message: &ControlMessage,
    shape: WireShape,
    codec: &dyn ValueCodec,
) -> Result<Vec<u8>> {
    let bytes = codec.encode(&message.to_value(shape))?;
    if bytes.len() > MAX_CONTROL_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_CONTROL_MESSAGE_BYTES,
        });
    }
    Ok(bytes)
}

/// Encode and length-prefix a control message, ready for the socket.
pub fn encode_control_frame(message: &ControlMessage) -> Result<Bytes> {
    let payload = encode_control_message(message)?;
    framebridge_frame::encode_frame(&payload, MAX_CONTROL_MESSAGE_BYTES).map_err(|_| {
        ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_CONTROL_MESSAGE_BYTES,
        }
    })
}

/// Decode with the default codec.
pub fn decode_control_message(bytes: &[u8]) -> Result<ControlMessage> {
    decode_with(bytes, default_codec())
}

pub fn decode_with(bytes: &[u8], codec: &dyn ValueCodec) -> Result<ControlMessage> {
    let value = codec
        .decode(bytes)
        .map_err(|err| ProtocolError::mismatch(format!("control message decode failed: {err}")))?;
    ControlMessage::from_value(&value)
}

/// Validate a handshake reply.
///
/// An accepted reply must name a transport this side understands.
pub fn parse_hello_ack(message: &ControlMessage) -> Result<&HelloAck> {
    let ControlMessage::HelloAck(ack) = message else {
        return Err(ProtocolError::mismatch(format!(
            "expected hello_ack, got {}",
            message.message_type()
        )));
    };
    if ack.accepted && ack.transport_kind().is_none() {
        return Err(ProtocolError::mismatch(format!(
            "server selected unknown transport: {}",
            ack.selected_transport.as_deref().unwrap_or("<none>")
        )));
    }
    Ok(ack)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn hello(client_name: &str, client_version: &str, capabilities: Option<&[&str]>) -> ControlMessage {
    ControlMessage::Hello(Hello {
        magic: PROTOCOL_MAGIC.to_string(),
        protocol_version: PROTOCOL_VERSION,
        capabilities: capabilities
            .unwrap_or(&DEFAULT_CAPABILITIES)
            .iter()
            .map(|c| c.to_string())
            .collect(),
        client_name: client_name.to_string(),
        client_version: client_version.to_string(),
    })
}

pub fn hello_ack(
    accepted: bool,
    server_version: Option<&str>,
    selected_transport: Option<&str>,
    reason: Option<&str>,
) -> ControlMessage {
    ControlMessage::HelloAck(HelloAck {
        accepted,
        server_version: server_version.map(str::to_string),
        selected_transport: selected_transport.map(str::to_string),
        reason: reason.map(str::to_string),
    })
}

pub fn start_stream(stream_id: Option<&str>) -> ControlMessage {
    ControlMessage::StartStream(StartStream {
        stream_id: stream_id.map(str::to_string),
    })
}

pub fn stop_stream(reason: Option<&str>) -> ControlMessage {
    ControlMessage::StopStream(StopStream {
        reason: reason.map(str::to_string),
    })
}

/// Describe one outgoing frame. Exactly one of `shm_slot` / `chunk_size`
/// is normally set, matching `transport`.
#[allow(clippy::too_many_arguments)]
pub fn frame_meta(
    frame_id: u64,
    width: u32,
    height: u32,
    stride: u32,
    transport: TransportKind,
    timestamp_ms: u64,
    shm_slot: Option<u32>,
    chunk_size: Option<u64>,
) -> ControlMessage {
    ControlMessage::FrameMeta(FrameMeta {
        frame_id,
        width,
        height,
        stride,
        pixel_format: PIXEL_FORMAT_RGBA8.to_string(),
        transport: transport.as_str().to_string(),
        shm_slot,
        chunk_size,
        timestamp_ms,
    })
}

pub fn ack(frame_id: i64) -> ControlMessage {
    ControlMessage::Ack(Ack { frame_id })
}

pub fn error(code: &str, message: &str) -> ControlMessage {
    ControlMessage::Error(ErrorMessage {
        code: code.to_string(),
        message: message.to_string(),
    })
}

pub fn heartbeat(timestamp_ms: i64) -> ControlMessage {
    ControlMessage::Heartbeat(Heartbeat {
        timestamp_ms,
        target_width: None,
        target_height: None,
    })
}

/// Peer heartbeat carrying a requested stream size.
pub fn heartbeat_with_target(timestamp_ms: i64, width: i64, height: i64) -> ControlMessage {
    ControlMessage::Heartbeat(Heartbeat {
        timestamp_ms,
        target_width: Some(width),
        target_height: Some(height),
    })
}
