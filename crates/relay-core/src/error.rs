//! The five error kinds of the runtime, unified behind [`RelayError`].
//!
//! Transport errors come from the reactor, protocol errors come from the
//! codec or an unknown message type, service errors come from the locator,
//! response errors are the structured `(id, reason, category?)` tuples a
//! peer can send through a channel's `error` variant, and worker errors
//! come from the worker session's handshake/heartbeat/dispatch lifecycle.
//! A single `Result<T, RelayError>` flows from the codec up through the
//! session and into the typed channel layer so callers never have to match
//! on more than one error type at the top of an `invoke(...).await?`.

use relay_transport_tcp::TcpTransportError;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Transport errors: classic I/O failures from the reactor, or a session
/// reused in a way its state machine forbids.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("connect is already in progress on this session")]
    AlreadyStarted,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Io(#[from] TcpTransportError),
    /// An I/O failure on an already-established stream (read or write),
    /// as opposed to [`TransportError::Io`] which is specific to the
    /// candidate-list dial step.
    #[error("I/O error on an active session: {0}")]
    StreamIo(#[from] std::io::Error),
    #[error("the session was cancelled or a peer I/O error propagated to this operation")]
    OperationAborted,
}

/// Protocol errors: malformed frames, parse failures, or a message type the
/// current protocol node does not recognize. Frame/parse errors are fatal
/// for the whole session; an unknown message type is fatal only for the
/// channel that received it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a valid [span, type, args] tuple: {0}")]
    FrameFormat(String),
    #[error("failed to parse a MessagePack value from the stream: {0}")]
    Parse(String),
    #[error("failed to encode message of type {message_type}: {source}")]
    Encode {
        message_type: u64,
        #[source]
        source: rmp_serde::encode::Error,
    },
    #[error("message type {0} is not valid for the current protocol state")]
    InvalidMessageType(u64),
    #[error("failed to decode payload for message type {message_type}: {reason}")]
    PayloadDecode { message_type: u64, reason: String },
}

/// Service-level errors: the locator has no such name, or it resolved to a
/// peer speaking a different protocol version than the caller requires.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service '{0}' was not found by the locator")]
    ServiceNotFound(String),
    #[error("protocol version mismatch for '{service}': expected {expected}, got {actual}")]
    VersionMismatch {
        service: String,
        expected: u32,
        actual: u32,
    },
}

/// A structured `(id, reason, category?)` triple delivered through a
/// protocol's `error` variant, surfaced as a single exception type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("response error {id}: {reason}")]
pub struct ResponseError {
    pub id: i64,
    pub reason: String,
    pub category: Option<u8>,
}

impl ResponseError {
    pub fn new(id: i64, reason: impl Into<String>, category: Option<u8>) -> Self {
        Self {
            id,
            reason: reason.into(),
            category,
        }
    }
}

/// Errors specific to the worker session's lifecycle, grounded directly on
/// the original framework's `worker::error::worker_errors` enum.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// No heartbeat was heard from the runtime for the disown timeout.
    #[error("disowned: no heartbeat for {timeout_secs}s")]
    Disowned { timeout_secs: u64 },
    /// The runtime explicitly terminated this worker.
    #[error("terminated by runtime (code {code}): {reason}")]
    Terminated { code: u8, reason: String },
    /// A channel-1 frame of an unrecognized type arrived.
    #[error("invalid protocol type on control channel: {0}")]
    InvalidProtocolType(u64),
    /// The runtime closed the control channel without sending `terminate`.
    #[error("unexpected end of stream on control channel")]
    UnexpectedEof,
}
