//! Per-span shared state: a single-waiter FIFO of decoded frames plus a
//! terminal-error broadcast.
//!
//! Each open channel (keyed by span) has exactly one reader at a time —
//! the typed receiver owns it exclusively — so the FIFO only ever needs to wake one
//! waiter, not a full broadcast list. A terminal error (protocol error or
//! peer disconnect) is different: it must reach both a waiter blocked in
//! `recv` *and* any later call that arrives after the channel already
//! failed, so it is latched rather than delivered once.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::DecodedMessage;
use crate::error::RelayError;

#[derive(Debug)]
enum Outcome {
    Pending,
    Closed,
    Failed(Arc<RelayError>),
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<DecodedMessage>,
    outcome: Outcome,
}

/// Shared state for one multiplexed channel, addressed by span.
///
/// Cloning is cheap (an `Arc` underneath); the session registry holds one
/// clone keyed by span, and the typed receiver holds the other.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                outcome: Outcome::Pending,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Called from the session's read loop when a frame for this span
    /// arrives. Never blocks.
    pub fn push(&self, message: DecodedMessage) {
        let mut inner = self.inner.lock();
        if matches!(inner.outcome, Outcome::Pending) {
            inner.queue.push_back(message);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Latches a terminal error. Any frame already queued remains
    /// deliverable — the error only takes effect once the queue drains, so a
    /// late error never erases already buffered chunks.
    pub fn fail(&self, error: RelayError) {
        let mut inner = self.inner.lock();
        if matches!(inner.outcome, Outcome::Pending) {
            inner.outcome = Outcome::Failed(Arc::new(error));
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Marks the channel closed without error (a normal choke/revoke).
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.outcome, Outcome::Pending) {
            inner.outcome = Outcome::Closed;
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Waits for and returns the next queued frame, or the terminal
    /// outcome once the queue is empty and the channel has closed/failed.
    pub async fn recv(&self) -> Result<Option<DecodedMessage>, RelayError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.queue.pop_front() {
                    return Ok(Some(message));
                }
                match &inner.outcome {
                    Outcome::Pending => {}
                    Outcome::Closed => return Ok(None),
                    Outcome::Failed(error) => return Err(clone_relay_error(error.as_ref())),
                }
            }
            self.notify.notified().await;
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// `RelayError` does not derive `Clone` (some variants wrap non-`Clone`
/// upstream error types), but a latched session/channel error must be
/// replayable to every caller that observes it. This rebuilds an
/// equivalent value from the data each variant actually carries, dropping
/// only the non-`Clone` `source` of `ProtocolError::Encode` — which never
/// reaches `fail()` from a decode path anyway.
pub(crate) fn clone_relay_error(error: &RelayError) -> RelayError {
    use crate::error::{ProtocolError, ResponseError, ServiceError, TransportError, WorkerError};
    match error {
        RelayError::Transport(TransportError::NotConnected) => TransportError::NotConnected.into(),
        RelayError::Transport(TransportError::AlreadyStarted) => TransportError::AlreadyStarted.into(),
        RelayError::Transport(TransportError::AlreadyConnected) => TransportError::AlreadyConnected.into(),
        RelayError::Transport(TransportError::OperationAborted)
        | RelayError::Transport(TransportError::Io(_))
        | RelayError::Transport(TransportError::StreamIo(_)) => TransportError::OperationAborted.into(),
        RelayError::Protocol(ProtocolError::FrameFormat(msg)) => ProtocolError::FrameFormat(msg.clone()).into(),
        RelayError::Protocol(ProtocolError::Parse(msg)) => ProtocolError::Parse(msg.clone()).into(),
        RelayError::Protocol(ProtocolError::InvalidMessageType(ty)) => ProtocolError::InvalidMessageType(*ty).into(),
        RelayError::Protocol(ProtocolError::PayloadDecode { message_type, reason }) => ProtocolError::PayloadDecode {
            message_type: *message_type,
            reason: reason.clone(),
        }
        .into(),
        RelayError::Protocol(ProtocolError::Encode { message_type, .. }) => ProtocolError::PayloadDecode {
            message_type: *message_type,
            reason: "encode failure while propagating a latched session error".to_string(),
        }
        .into(),
        RelayError::Service(ServiceError::ServiceNotFound(name)) => ServiceError::ServiceNotFound(name.clone()).into(),
        RelayError::Service(ServiceError::VersionMismatch { service, expected, actual }) => {
            ServiceError::VersionMismatch {
                service: service.clone(),
                expected: *expected,
                actual: *actual,
            }
            .into()
        }
        RelayError::Response(response) => response.clone().into(),
        RelayError::Worker(WorkerError::Disowned { timeout_secs }) => WorkerError::Disowned {
            timeout_secs: *timeout_secs,
        }
        .into(),
        RelayError::Worker(WorkerError::Terminated { code, reason }) => WorkerError::Terminated {
            code: *code,
            reason: reason.clone(),
        }
        .into(),
        RelayError::Worker(WorkerError::InvalidProtocolType(ty)) => WorkerError::InvalidProtocolType(*ty).into(),
        RelayError::Worker(WorkerError::UnexpectedEof) => WorkerError::UnexpectedEof.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;

    #[tokio::test]
    async fn pushed_frames_are_delivered_in_order() {
        let state = SharedState::new();
        state.push(fake_message(1));
        state.push(fake_message(2));
        assert_eq!(state.recv().await.unwrap().unwrap().span(), 1);
        assert_eq!(state.recv().await.unwrap().unwrap().span(), 2);
    }

    #[tokio::test]
    async fn queued_frames_are_drained_before_a_latched_error_surfaces() {
        let state = SharedState::new();
        state.push(fake_message(1));
        state.fail(ServiceError::ServiceNotFound("node".to_string()).into());
        assert_eq!(state.recv().await.unwrap().unwrap().span(), 1);
        assert!(state.recv().await.is_err());
    }

    #[tokio::test]
    async fn close_without_error_yields_none() {
        let state = SharedState::new();
        state.close();
        assert!(state.recv().await.unwrap().is_none());
    }

    fn fake_message(span: u64) -> DecodedMessage {
        let bytes = crate::codec::encode(span, 0, &("x",)).unwrap();
        let mut decoder = crate::codec::Decoder::new();
        decoder.feed(&bytes);
        decoder.decode_next().unwrap().unwrap()
    }
}
