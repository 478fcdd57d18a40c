//! Client error taxonomy.
//!
//! Transport and server failures are translated into state transitions by
//! the connection manager; the variants here are what awaiting callers see.

use crate::state::ConnectionState;
use rtlink_protocol::{CodecError, ErrorInfo, error_codes};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bad option, bad bus event name, wildcard client id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A state move not present in the transition table was requested.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Transport-level failure (DNS, TCP, TLS, WebSocket). Retryable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rejected credentials. Terminal; no fallback retries.
    #[error("authentication failed: {0}")]
    Auth(ErrorInfo),

    /// Server-reported failure (error frame, nack). Retryable unless the
    /// attached info says otherwise.
    #[error("server error: {0}")]
    Server(ErrorInfo),

    /// Malformed frame, non-contiguous ack serial, unexpected resume result.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Pending frames rejected because the connection generation changed.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Deadline exceeded (close handshake, open attempt, retry budget).
    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl Error {
    /// Map a wire [`ErrorInfo`] onto the taxonomy.
    pub(crate) fn from_error_info(info: ErrorInfo) -> Self {
        if info.is_auth_failure() {
            Error::Auth(info)
        } else if info.code == error_codes::PROTOCOL_ERROR {
            Error::ProtocolViolation(info.message)
        } else if info.code == error_codes::CONNECTION_RESET {
            Error::ConnectionReset(info.message)
        } else {
            Error::Server(info)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
