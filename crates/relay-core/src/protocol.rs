//! The typed channel layer: three concrete protocol shapes realized as
//! generic Rust types instead of one fully generic state-graph walker.
//!
//! This runtime only ever instantiates three shapes over the life of a
//! channel — an infinite stream of chunks terminated by choke or error, the
//! sending half of that same shape, and a single value-or-error result used
//! by `resolve` — so each gets its own small type. The state transition is
//! encoded by which method consumes `self` and what it returns: a
//! `PrimitiveReceiver::recv` takes `self` and there is no way to call it
//! again, which is the whole of the "primitive channel self-closes after
//! one value" invariant, enforced by the type system rather than a runtime
//! assertion.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::channel_state::SharedState;
use crate::codec;
use crate::error::{ProtocolError, RelayError, ResponseError};
use crate::session::BasicSession;

/// Message-type IDs for the streaming shape.
pub const STREAM_CHUNK: u64 = 0;
pub const STREAM_CHOKE: u64 = 1;
pub const STREAM_ERROR: u64 = 2;

/// Message-type IDs for the primitive (single value-or-error) shape.
pub const PRIMITIVE_VALUE: u64 = 0;
pub const PRIMITIVE_ERROR: u64 = 1;

/// An outgoing raw-frame queue handle, shared by every sender type in this
/// module. Writing here never blocks the caller on the socket itself — it
/// only enqueues onto the session's writer task.
#[derive(Clone)]
pub(crate) struct OutboundHandle {
    span: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl OutboundHandle {
    pub(crate) fn new(span: u64, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { span, tx }
    }

    pub(crate) fn span(&self) -> u64 {
        self.span
    }

    fn send_encoded(&self, message_type: u64, args: &impl Serialize) -> Result<(), RelayError> {
        let frame = codec::encode(self.span, message_type, args)?;
        self.tx
            .send(frame)
            .map_err(|_| RelayError::from(crate::error::TransportError::NotConnected))
    }
}

/// The sending half of the streaming shape: `write` any number of times,
/// then exactly one of `close` or `error`. Used both as the client's
/// request-streaming sender and as the worker's response sender, since both
/// sides write the same three message types onto the same span.
pub struct ChunkSender<T> {
    outbound: OutboundHandle,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> ChunkSender<T> {
    pub(crate) fn new(outbound: OutboundHandle) -> Self {
        Self {
            outbound,
            _marker: PhantomData,
        }
    }

    pub fn write(&self, chunk: &T) -> Result<(), RelayError> {
        self.outbound.send_encoded(STREAM_CHUNK, &(chunk,))
    }

    pub fn close(&self) -> Result<(), RelayError> {
        self.outbound.send_encoded(STREAM_CHOKE, &())
    }

    pub fn error(&self, id: i64, reason: impl Into<String>, category: Option<u8>) -> Result<(), RelayError> {
        let reason = reason.into();
        match category {
            Some(category) => self.outbound.send_encoded(STREAM_ERROR, &(id, reason, category)),
            None => self.outbound.send_encoded(STREAM_ERROR, &(id, reason)),
        }
    }
}

/// Choking a sender on drop without an explicit `close()` call would hide
/// logic errors, so this runtime requires an explicit `close()`/`error()`
/// call; Drop intentionally does nothing here. The worker's response sender
/// wants an implicit choke on drop instead, which it gets by composing a
/// `ChunkSender` with its own `Drop` impl rather than putting that behavior
/// in the shared primitive — see `worker::WorkerSender`.
impl<T> Drop for ChunkSender<T> {
    fn drop(&mut self) {}
}

/// The receiving half of the streaming shape.
///
/// Carries a strong handle back to the owning session so that dropping the
/// receiver revokes its span in the owning session, without the session
/// having to track receiver liveness itself.
pub struct StreamReceiver<T> {
    state: Arc<SharedState>,
    session: Arc<BasicSession>,
    span: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamReceiver<T> {
    pub(crate) fn new(state: Arc<SharedState>, session: Arc<BasicSession>, span: u64) -> Self {
        Self {
            state,
            session,
            span,
            _marker: PhantomData,
        }
    }

    pub fn span(&self) -> u64 {
        self.span
    }

    /// Awaits the next chunk. Returns `Ok(None)` once the peer choked the
    /// channel cleanly; an `error` frame or a session-level failure both
    /// surface as `Err`.
    pub async fn recv(&mut self) -> Result<Option<T>, RelayError> {
        loop {
            let message = match self.state.recv().await? {
                Some(message) => message,
                None => return Ok(None),
            };
            match message.message_type() {
                STREAM_CHUNK => {
                    let chunk: T = message.arg(0)?;
                    return Ok(Some(chunk));
                }
                STREAM_CHOKE => return Ok(None),
                STREAM_ERROR => return Err(decode_response_error(&message)?.into()),
                other => {
                    return Err(ProtocolError::InvalidMessageType(other).into());
                }
            }
        }
    }
}

/// The receiving half of the single value-or-error shape, used for
/// `resolve` and any other unary RPC. `recv` consumes `self` — there is no
/// second call to make, which is the type-level encoding of "the channel
/// closes after exactly one message".
pub struct PrimitiveReceiver<T> {
    state: Arc<SharedState>,
    session: Arc<BasicSession>,
    span: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PrimitiveReceiver<T> {
    pub(crate) fn new(state: Arc<SharedState>, session: Arc<BasicSession>, span: u64) -> Self {
        Self {
            state,
            session,
            span,
            _marker: PhantomData,
        }
    }

    pub async fn recv(self) -> Result<T, RelayError> {
        let message = self
            .state
            .recv()
            .await?
            .ok_or(RelayError::from(crate::error::TransportError::OperationAborted))?;
        match message.message_type() {
            PRIMITIVE_VALUE => Ok(message.arg(0)?),
            PRIMITIVE_ERROR => Err(decode_response_error(&message)?.into()),
            other => Err(ProtocolError::InvalidMessageType(other).into()),
        }
    }
}

impl<T> Drop for StreamReceiver<T> {
    fn drop(&mut self) {
        self.session.revoke(self.span);
    }
}

impl<T> Drop for PrimitiveReceiver<T> {
    fn drop(&mut self) {
        self.session.revoke(self.span);
    }
}

fn decode_response_error(message: &codec::DecodedMessage) -> Result<ResponseError, ProtocolError> {
    let id: i64 = message.arg(0)?;
    let reason: String = message.arg(1)?;
    let category: Option<u8> = message.arg(2).ok();
    Ok(ResponseError::new(id, reason, category))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_receiver_yields_chunks_then_none_on_choke() {
        let session = BasicSession::new();
        let state = Arc::new(SharedState::new());
        push_frame(&state, STREAM_CHUNK, &("a",));
        push_frame(&state, STREAM_CHUNK, &("b",));
        push_frame(&state, STREAM_CHOKE, &());
        let mut receiver: StreamReceiver<String> = StreamReceiver::new(state, session, 1);
        assert_eq!(receiver.recv().await.unwrap(), Some("a".to_string()));
        assert_eq!(receiver.recv().await.unwrap(), Some("b".to_string()));
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_receiver_surfaces_response_error() {
        let session = BasicSession::new();
        let state = Arc::new(SharedState::new());
        push_frame(&state, STREAM_ERROR, &(1i64, "boom"));
        let mut receiver: StreamReceiver<String> = StreamReceiver::new(state, session, 1);
        let err = receiver.recv().await.unwrap_err();
        assert!(matches!(err, RelayError::Response(ResponseError { id: 1, .. })));
    }

    #[tokio::test]
    async fn primitive_receiver_consumes_self_for_a_single_value() {
        let session = BasicSession::new();
        let state = Arc::new(SharedState::new());
        push_frame(&state, PRIMITIVE_VALUE, &(vec!["echo", "http"],));
        let receiver: PrimitiveReceiver<Vec<String>> = PrimitiveReceiver::new(state, session, 1);
        let value = receiver.recv().await.unwrap();
        assert_eq!(value, vec!["echo".to_string(), "http".to_string()]);
    }

    #[tokio::test]
    async fn dropping_a_receiver_revokes_its_span() {
        let session = BasicSession::new();
        let (local, remote) = tokio::io::duplex(4096);
        session.attach(local);
        drop(remote);
        let (span, recv): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        assert!(session.has_channel(span));
        drop(recv);
        assert!(!session.has_channel(span));
    }

    fn push_frame<A: Serialize>(state: &Arc<SharedState>, message_type: u64, args: &A) {
        let bytes = codec::encode(1, message_type, args).unwrap();
        let mut decoder = codec::Decoder::new();
        decoder.feed(&bytes);
        state.push(decoder.decode_next().unwrap().unwrap());
    }
}
