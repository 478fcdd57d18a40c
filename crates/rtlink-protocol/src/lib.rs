// rtlink-protocol: Realtime wire protocol types and serialization.
//
// Every frame on the wire is a single `ProtocolMessage` encoded in the
// negotiated format (JSON text frames or MessagePack binary frames).  The
// `action` field discriminates frame semantics; all other fields are
// optional and action-dependent.  Decoders must accept unknown fields and
// unknown actions (forward compatibility).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Frame action tags.
///
/// Actions in the ack-required set ([`Action::ack_required`]) are assigned a
/// `msg_serial` by the sender and must be answered by the peer with an `Ack`
/// or `Nack` covering that serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Connected,
    Disconnected,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Message,
    Presence,
    Ack,
    Nack,
    Heartbeat,
    Sync,
    Close,
    /// Any action tag this client version does not know.  Dispatch ignores
    /// these frames with a warning.
    #[serde(other)]
    Unknown,
}

impl Action {
    /// Whether frames with this action require a server `Ack`/`Nack`.
    ///
    /// Pure function of the action; the ack-required set is frozen.
    pub fn ack_required(self) -> bool {
        matches!(
            self,
            Action::Message | Action::Presence | Action::Close | Action::Attach | Action::Detach
        )
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Heartbeat
    }
}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Frozen error codes carried in [`ErrorInfo::code`].
pub mod error_codes {
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const CONNECTION_RESET: &str = "CONNECTION_RESET";
    pub const CONNECTION_SUSPENDED: &str = "CONNECTION_SUSPENDED";
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const MESSAGE_NACKED: &str = "MESSAGE_NACKED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Wire error record, attached to `Error`, `Disconnected`, `Closed` and
/// `Nack` frames.
///
/// | Code                 | Retryable |
/// |----------------------|-----------|
/// | TOKEN_INVALID        | false     |
/// | CONNECTION_FAILED    | true      |
/// | CONNECTION_RESET     | true      |
/// | CONNECTION_SUSPENDED | true      |
/// | CONNECTION_CLOSED    | false     |
/// | PROTOCOL_ERROR       | false     |
/// | MESSAGE_NACKED       | false     |
/// | TIMEOUT              | true      |
/// | INTERNAL_ERROR       | true      |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// One of the frozen error codes.
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        ErrorInfo {
            code: code.to_owned(),
            message: message.into(),
            retryable,
        }
    }

    /// Auth rejections are terminal: no reconnect, no fallback hosts.
    pub fn is_auth_failure(&self) -> bool {
        self.code == error_codes::TOKEN_INVALID
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// ConnectionDetails
// ---------------------------------------------------------------------------

/// Connection metadata delivered on a `Connected` frame.
///
/// When present, `connection_key` replaces the key captured from the frame
/// envelope, and the two durations reconfigure the client's suspend budget
/// and idle watchdog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// How long the server keeps the connection state after a disconnect, ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Longest the server will go without sending a frame, ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
}

// ---------------------------------------------------------------------------
// ChannelMessage
// ---------------------------------------------------------------------------

/// One payload entry inside a `Message` or `Presence` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

// ---------------------------------------------------------------------------
// ProtocolMessage
// ---------------------------------------------------------------------------

/// A single protocol frame.
///
/// `msg_serial` is assigned by the sender, monotonically increasing per
/// connection among ack-required frames, starting at 0.  `connection_serial`
/// is assigned by the server and present on every server frame; the client
/// records the latest value as its resume position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    /// On `Ack`/`Nack`: how many consecutive serials this frame covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChannelMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        ProtocolMessage {
            action,
            ..ProtocolMessage::default()
        }
    }

    /// A `Message` frame carrying a single payload on `channel`.
    pub fn message(channel: &str, payload: ChannelMessage) -> Self {
        ProtocolMessage {
            action: Action::Message,
            channel: Some(channel.to_owned()),
            messages: Some(vec![payload]),
            ..ProtocolMessage::default()
        }
    }

    pub fn heartbeat() -> Self {
        ProtocolMessage::new(Action::Heartbeat)
    }

    pub fn close() -> Self {
        ProtocolMessage::new(Action::Close)
    }

    pub fn ack(msg_serial: i64, count: u32) -> Self {
        ProtocolMessage {
            action: Action::Ack,
            msg_serial: Some(msg_serial),
            count: Some(count),
            ..ProtocolMessage::default()
        }
    }

    pub fn nack(msg_serial: i64, count: u32, error: ErrorInfo) -> Self {
        ProtocolMessage {
            action: Action::Nack,
            msg_serial: Some(msg_serial),
            count: Some(count),
            error: Some(error),
            ..ProtocolMessage::default()
        }
    }

    /// Whether this frame must be acked by the peer.
    pub fn ack_required(&self) -> bool {
        self.action.ack_required()
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Negotiated wire format.  JSON frames travel as WebSocket text, MessagePack
/// frames as binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Json,
    MsgPack,
}

impl Format {
    /// Value of the `format` handshake query parameter.
    pub fn as_param(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::MsgPack => "msgpack",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(String),
    #[error("msgpack: {0}")]
    MsgPack(String),
}

/// Encode a frame in the given format.
pub fn encode(msg: &ProtocolMessage, format: Format) -> Result<Vec<u8>, CodecError> {
    match format {
        Format::Json => serde_json::to_vec(msg).map_err(|e| CodecError::Json(e.to_string())),
        Format::MsgPack => {
            rmp_serde::to_vec_named(msg).map_err(|e| CodecError::MsgPack(e.to_string()))
        }
    }
}

/// Decode a frame in the given format.
///
/// Unknown fields are dropped; an unknown action tag decodes to
/// [`Action::Unknown`].
pub fn decode(bytes: &[u8], format: Format) -> Result<ProtocolMessage, CodecError> {
    match format {
        Format::Json => serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string())),
        Format::MsgPack => {
            rmp_serde::from_slice(bytes).map_err(|e| CodecError::MsgPack(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
