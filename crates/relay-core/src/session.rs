//! The multiplexed session: one connection, any number of concurrently
//! open channels.
//!
//! `BasicSession` is deliberately generic over the underlying stream
//! (`AsyncRead + AsyncWrite`) rather than hard-wired to TCP, since the same
//! state machine — connect once, fan a single byte stream out into many
//! spans, tear every open channel down together on the first fatal error —
//! serves both the client's TCP connection to a service and the worker's
//! AF_UNIX connection to the runtime (see `worker::WorkerSession`, which
//! wraps this type over a `UnixStream`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use relay_transport_tcp::{TcpSocketConfig, connect_first_reachable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::channel_state::{SharedState, clone_relay_error};
use crate::codec::{self, Decoder};
use crate::error::{RelayError, TransportError};
use crate::protocol::{ChunkSender, OutboundHandle, PrimitiveReceiver, StreamReceiver};

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// A single multiplexed connection plus its live channel registry.
///
/// Holds no generic parameter: once [`BasicSession::attach`] has spawned
/// the reader/writer tasks, the session's public surface (`invoke`, `push`,
/// `revoke`, `cancel`) only ever talks to those tasks through the
/// registry and the outbound queue, never to the stream directly.
type OrphanHook = Box<dyn Fn(codec::DecodedMessage) + Send + Sync>;

/// Span 0 is reserved and every frame addressed to it is dropped.
const RESERVED_SPAN: u64 = 0;

pub struct BasicSession {
    state: AtomicU8,
    channels: DashMap<u64, Arc<SharedState>>,
    next_span: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    send_guard: Mutex<()>,
    /// Invoked by the read loop for a frame whose span has no registered
    /// channel. A plain client session leaves this unset and silently drops
    /// orphan frames; `worker::WorkerSession` installs a hook here so
    /// it can observe the first `invoke(event_name)` frame of a new
    /// invocation, which by construction arrives on a span nobody has
    /// registered yet.
    orphan_hook: Mutex<Option<OrphanHook>>,
    /// Set by [`BasicSession::cancel`] (§4.C "Cancel"). Once set, the
    /// transport is torn down the moment the channel registry becomes
    /// empty — either immediately, if cancel is called while idle, or
    /// later, from `revoke`, once every channel open at cancel time has
    /// been naturally revoked.
    closed: AtomicBool,
    /// Abort handles for the reader/writer tasks spawned by `attach`. The
    /// only way to force-close a live socket other than an I/O failure:
    /// aborting both tasks drops their owned stream halves, which is what
    /// actually releases the underlying file descriptor (dropping just the
    /// writer's `mpsc::Sender` ends the writer loop but leaves the reader
    /// half, and therefore the socket, open).
    tasks: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl BasicSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(DISCONNECTED),
            channels: DashMap::new(),
            next_span: AtomicU64::new(1),
            outbound: Mutex::new(None),
            send_guard: Mutex::new(()),
            orphan_hook: Mutex::new(None),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Installs the callback the read loop hands unregistered-span frames
    /// to. See [`BasicSession::orphan_hook`] field docs.
    pub fn set_orphan_hook(&self, hook: impl Fn(codec::DecodedMessage) + Send + Sync + 'static) {
        *self.orphan_hook.lock() = Some(Box::new(hook));
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Dials the given candidates in order and attaches the first reachable
    /// one. Fails with [`TransportError::AlreadyStarted`] or
    /// [`TransportError::AlreadyConnected`] if called more than once on the
    /// same session.
    pub async fn connect_tcp(
        self: &Arc<Self>,
        candidates: &[SocketAddr],
        config: TcpSocketConfig,
    ) -> Result<(), RelayError> {
        self.state
            .compare_exchange(DISCONNECTED, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|current| -> RelayError {
                if current == CONNECTING {
                    TransportError::AlreadyStarted.into()
                } else {
                    TransportError::AlreadyConnected.into()
                }
            })?;
        match connect_first_reachable(candidates, config).await {
            Ok(stream) => {
                self.attach(stream);
                Ok(())
            }
            Err(source) => {
                self.state.store(DISCONNECTED, Ordering::Release);
                Err(TransportError::Io(source).into())
            }
        }
    }

    /// Wires an already-established stream into this session and spawns
    /// its reader and writer tasks. Used directly by the worker session,
    /// which dials its local socket itself rather than going through
    /// [`BasicSession::connect_tcp`].
    pub fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        self.state.store(CONNECTED, Ordering::Release);
        let writer = tokio::spawn(
            writer_loop(Arc::clone(self), write_half, rx).instrument(info_span!("relay_writer")),
        );
        let reader =
            tokio::spawn(reader_loop(Arc::clone(self), read_half).instrument(info_span!("relay_reader")));
        *self.tasks.lock() = vec![writer.abort_handle(), reader.abort_handle()];
    }

    /// Allocates a new span, registers its channel state, and sends the
    /// opening frame — the allocation and the first enqueue happen under
    /// one lock so two concurrent `invoke` calls can never interleave
    /// their opening frames out of span order.
    pub fn invoke<Out: DeserializeOwned>(
        self: &Arc<Self>,
        message_type: u64,
        args: &impl Serialize,
    ) -> Result<(u64, StreamReceiver<Out>), RelayError> {
        let _guard = self.send_guard.lock();
        let tx = self.sender_handle()?;
        let span = self.next_span.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SharedState::new());
        self.channels.insert(span, Arc::clone(&state));
        let frame = codec::encode(span, message_type, args)?;
        if tx.send(frame).is_err() {
            self.channels.remove(&span);
            return Err(TransportError::NotConnected.into());
        }
        Ok((span, StreamReceiver::new(state, Arc::clone(self), span)))
    }

    /// Same allocation discipline as [`BasicSession::invoke`], for the
    /// single value-or-error shape used by `resolve` and other unary
    /// calls: the channel closes itself after one message, so the caller
    /// gets a [`PrimitiveReceiver`] rather than a [`StreamReceiver`].
    pub fn invoke_primitive<Out: DeserializeOwned>(
        self: &Arc<Self>,
        message_type: u64,
        args: &impl Serialize,
    ) -> Result<(u64, PrimitiveReceiver<Out>), RelayError> {
        let _guard = self.send_guard.lock();
        let tx = self.sender_handle()?;
        let span = self.next_span.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SharedState::new());
        self.channels.insert(span, Arc::clone(&state));
        let frame = codec::encode(span, message_type, args)?;
        if tx.send(frame).is_err() {
            self.channels.remove(&span);
            return Err(TransportError::NotConnected.into());
        }
        Ok((span, PrimitiveReceiver::new(state, Arc::clone(self), span)))
    }

    /// Builds a sender for an already-open span, used by `invoke` callers
    /// that need to both push follow-up chunks and receive a reply on the
    /// same channel (client streaming requests, and the worker's reply
    /// sender which reuses the span the invocation arrived on).
    pub fn sender_for<T: Serialize>(self: &Arc<Self>, span: u64) -> Result<ChunkSender<T>, RelayError> {
        let tx = self.sender_handle()?;
        Ok(ChunkSender::new(OutboundHandle::new(span, tx)))
    }

    /// Registers a receiver for an inbound span this session did not open
    /// itself — the worker side of an invocation, where the peer chose the
    /// span.
    pub fn register_inbound<Out: DeserializeOwned>(self: &Arc<Self>, span: u64) -> StreamReceiver<Out> {
        let state = Arc::new(SharedState::new());
        self.channels.insert(span, Arc::clone(&state));
        StreamReceiver::new(state, Arc::clone(self), span)
    }

    /// Like [`BasicSession::register_inbound`] but hands back the raw
    /// per-span state instead of a typed `StreamReceiver`. Used for the
    /// worker's control channel (span 1), whose message-type numbering
    /// (`handshake`/`heartbeat`/`terminate`) is unrelated to the generic
    /// streaming shape's `chunk`/`choke`/`error` numbering that
    /// `StreamReceiver::recv` assumes.
    pub(crate) fn register_inbound_raw(&self, span: u64) -> Arc<SharedState> {
        let state = Arc::new(SharedState::new());
        self.channels.insert(span, Arc::clone(&state));
        state
    }

    /// Sends a raw, already-framed message on an existing span without
    /// going through the typed sender — used by the control channel (the
    /// worker's handshake/heartbeat) where there is no typed receiver on
    /// the other end of this process to construct a `ChunkSender` for.
    pub fn push(&self, span: u64, message_type: u64, args: &impl Serialize) -> Result<(), RelayError> {
        let tx = self.sender_handle()?;
        let frame = codec::encode(span, message_type, args)?;
        tx.send(frame).map_err(|_| TransportError::NotConnected.into())
    }

    /// Drops interest in a channel once its receiver has observed a
    /// terminal outcome. The registry entry is removed so a stale span
    /// number can be reused by later frames without holding memory for a
    /// channel nobody reads anymore; it does not write anything to the
    /// wire (the peer already knows the channel ended, since a terminal
    /// outcome is what triggers the revoke in the first place).
    ///
    /// If [`BasicSession::cancel`] was already called and this was the last
    /// registered channel, the transport is torn down here — this is the
    /// "waits for their natural revocation" half of §4.C "Cancel".
    pub fn revoke(&self, span: u64) {
        self.channels.remove(&span);
        if self.closed.load(Ordering::Acquire) && self.channels.is_empty() {
            self.shutdown_transport();
        }
    }

    /// Whether `span` currently has a registered channel. Exposed for tests
    /// and for the worker's dispatcher, which needs to tell an active
    /// invocation apart from one the client has already abandoned.
    pub fn has_channel(&self, span: u64) -> bool {
        self.channels.contains_key(&span)
    }

    /// Session-level cancellation (§4.C "Cancel"). Sets `closed`; if no
    /// channels are currently registered the transport is dropped
    /// immediately, otherwise it is dropped later by `revoke` once every
    /// channel open right now has been naturally revoked. Per-operation
    /// cancellation is deliberately not exposed here — §5 is explicit that
    /// "user-level cancellation is not surfaced through the core API".
    pub fn cancel(&self) {
        self.closed.store(true, Ordering::Release);
        if self.channels.is_empty() {
            self.shutdown_transport();
        }
    }

    /// Aborts the reader/writer tasks (dropping their owned stream halves,
    /// which is what actually closes the socket) and marks the session
    /// disconnected.
    fn shutdown_transport(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.disconnect();
    }

    fn sender_handle(&self) -> Result<mpsc::UnboundedSender<Vec<u8>>, RelayError> {
        self.outbound
            .lock()
            .clone()
            .ok_or_else(|| TransportError::NotConnected.into())
    }

    fn dispatch(&self, message: codec::DecodedMessage) {
        let span = message.span();
        if span == RESERVED_SPAN {
            debug!(message_type = message.message_type(), "dropping frame on reserved span 0");
            return;
        }
        match self.channels.get(&span) {
            Some(state) => state.push(message),
            None => {
                let hook = self.orphan_hook.lock();
                match hook.as_ref() {
                    Some(hook) => hook(message),
                    None => debug!(span, message_type = message.message_type(), "dropping orphan frame"),
                }
            }
        }
    }

    /// Broadcasts a terminal error to every currently open channel and
    /// marks the session disconnected. Called once from whichever of the
    /// reader/writer tasks first observes a fatal condition.
    pub(crate) fn fail_all(&self, error: RelayError) {
        for entry in self.channels.iter() {
            entry.value().fail(clone_relay_error(&error));
        }
        self.channels.clear();
        self.disconnect();
    }

    fn disconnect(&self) {
        self.state.store(DISCONNECTED, Ordering::Release);
        *self.outbound.lock() = None;
    }
}

async fn writer_loop<W>(session: Arc<BasicSession>, mut write_half: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(source) = write_half.write_all(&frame).await {
            warn!(error = %source, "write failed, tearing down session");
            session.fail_all(TransportError::StreamIo(source).into());
            return;
        }
    }
}

async fn reader_loop<R>(session: Arc<BasicSession>, mut read_half: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!("peer closed the connection");
                session.fail_all(TransportError::OperationAborted.into());
                return;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.decode_next() {
                        Ok(Some(message)) => session.dispatch(message),
                        Ok(None) => break,
                        Err(source) => {
                            error!(error = %source, "fatal protocol error, terminating session");
                            session.fail_all(source.into());
                            return;
                        }
                    }
                }
            }
            Err(source) => {
                warn!(error = %source, "read failed, tearing down session");
                session.fail_all(TransportError::StreamIo(source).into());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn invoke_allocates_ascending_spans_and_registers_a_receiver() {
        let session = BasicSession::new();
        let (local, remote) = duplex(4096);
        session.attach(local);
        drop(remote);

        let (span1, _recv1): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        let (span2, _recv2): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        assert!(span2 > span1);
    }

    #[tokio::test]
    async fn peer_disconnect_fails_every_open_channel() {
        let session = BasicSession::new();
        let (local, remote) = duplex(4096);
        session.attach(local);
        let (_span, mut recv): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        drop(remote);
        assert!(recv.recv().await.is_err());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn revoke_removes_the_registry_entry_without_touching_the_wire() {
        let session = BasicSession::new();
        let (local, remote) = duplex(4096);
        session.attach(local);
        drop(remote);
        let (span, _recv): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        assert_eq!(session.channels.len(), 1);
        session.revoke(span);
        assert_eq!(session.channels.len(), 0);
    }

    #[tokio::test]
    async fn cancel_drops_the_transport_immediately_when_idle() {
        let session = BasicSession::new();
        let (local, remote) = duplex(4096);
        session.attach(local);
        drop(remote);
        assert!(session.is_connected());
        session.cancel();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn cancel_with_open_channels_waits_for_natural_revocation() {
        let session = BasicSession::new();
        let (local, remote) = duplex(4096);
        session.attach(local);
        drop(remote);
        let (_span, recv): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();

        session.cancel();
        // One channel is still open: the transport is not torn down yet.
        assert!(session.is_connected());

        drop(recv);
        // Dropping the receiver revokes its span, which was the last one
        // open, so cancel's deferred teardown fires here.
        assert!(!session.is_connected());
    }

    /// Two sequential invokes on the same session write exactly the
    /// concatenation of two frames, spans 1 then 2 in order.
    #[tokio::test]
    async fn two_sequential_invocations_write_frames_in_span_order() {
        let session = BasicSession::new();
        let (local, mut remote) = duplex(4096);
        session.attach(local);

        let (span1, _recv1): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();
        let (span2, _recv2): (_, StreamReceiver<String>) = session.invoke(0, &("echo",)).unwrap();
        assert_eq!((span1, span2), (1, 2));

        let expected = [
            codec::encode(span1, 0, &("node",)).unwrap(),
            codec::encode(span2, 0, &("echo",)).unwrap(),
        ]
        .concat();

        let mut got = vec![0u8; expected.len()];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    /// Connecting to a refused endpoint fails and the session remains
    /// DISCONNECTED (not stuck CONNECTING), so a caller can retry
    /// `connect_tcp` again.
    #[tokio::test]
    async fn connect_tcp_failure_leaves_the_session_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = BasicSession::new();
        let result = session.connect_tcp(&[addr], TcpSocketConfig::new()).await;
        assert!(result.is_err());
        assert!(!session.is_connected());

        // DISCONNECTED, not a leftover CONNECTING state: a retry is accepted.
        let err = session.invoke::<String>(0, &("node",)).unwrap_err();
        assert!(matches!(err, RelayError::Transport(TransportError::NotConnected)));
    }

    /// A frame for an unknown span is dropped with no effect on a
    /// legitimate frame that follows it on the wire.
    #[tokio::test]
    async fn orphan_frame_does_not_disturb_a_later_legitimate_frame() {
        let session = BasicSession::new();
        let (local, mut remote) = duplex(4096);
        session.attach(local);
        let (span, mut recv): (_, StreamReceiver<String>) = session.invoke(0, &("node",)).unwrap();

        let orphan = codec::encode(7, 0, &("nobody-is-listening",)).unwrap();
        let chunk = codec::encode(span, crate::protocol::STREAM_CHUNK, &("hello",)).unwrap();
        remote.write_all(&orphan).await.unwrap();
        remote.write_all(&chunk).await.unwrap();

        assert_eq!(recv.recv().await.unwrap(), Some("hello".to_string()));
        assert!(!session.has_channel(7));
    }
}
