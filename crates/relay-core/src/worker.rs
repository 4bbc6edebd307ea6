//! Worker session: the server-side counterpart to [`crate::client`].
//!
//! A worker dials the runtime's local-socket endpoint once, sends a
//! `handshake(uuid)` on the control channel (span 1), and then runs three
//! concurrent duties for the life of the process: answer heartbeats and
//! reset the disown timer, emit its own heartbeat every ten seconds, and
//! dispatch each inbound `invoke(event_name)` to a registered handler on a
//! dedicated executor.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_bytes::ByteBuf;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{Instrument, info, info_span};

use crate::channel_state::SharedState;
use crate::codec::DecodedMessage;
use crate::error::{RelayError, TransportError, WorkerError};
use crate::protocol::{self, ChunkSender, StreamReceiver};
use crate::session::BasicSession;

/// Control-channel (span 1) message type ids. Distinct from, and
/// independent of, the generic streaming shape's `chunk`/`choke`/`error`
/// numbering in [`crate::protocol`] — span 1 is a fixed, hand-rolled
/// protocol of its own, not an instance of the streaming shape.
const HANDSHAKE: u64 = 0;
const HEARTBEAT: u64 = 1;
const TERMINATE: u64 = 2;

/// Wire type id for the first frame of a new invocation: `invoke(event_name)`.
const INVOKE: u64 = 0;

/// Node-service `event_not_found` response id and category, used to answer
/// an `invoke` naming a handler this worker never registered. The numeric
/// id is this workspace's own concrete choice — see DESIGN.md.
const EVENT_NOT_FOUND_ID: i64 = 1;
const EVENT_NOT_FOUND_CATEGORY: u8 = 1;

const CONTROL_SPAN: u64 = 1;

/// Runtime-supplied parameters a worker process is started with (§6 "CLI").
/// The CLI itself is out of scope per `spec.md` §1; an embedding binary
/// parses `--app`/`--uuid`/`--endpoint`/`--locator` (with
/// [`parse_locator_endpoints`] covering the last one) and builds this.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub app: String,
    pub uuid: String,
    pub endpoint: PathBuf,
    pub locator_endpoints: Vec<std::net::SocketAddr>,
    pub heartbeat_interval: Duration,
    pub disown_timeout: Duration,
    pub dispatch_threads: usize,
}

impl WorkerConfig {
    pub fn new(app: impl Into<String>, uuid: impl Into<String>, endpoint: impl AsRef<Path>) -> Self {
        Self {
            app: app.into(),
            uuid: uuid.into(),
            endpoint: endpoint.as_ref().to_path_buf(),
            locator_endpoints: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            disown_timeout: Duration::from_secs(60),
            dispatch_threads: 1,
        }
    }
}

/// Parses the `--locator` option: comma-separated `host:port` entries, with
/// a bare port defaulting its host to `localhost` (§6 "CLI").
pub fn parse_locator_endpoints(spec: &str) -> Result<Vec<std::net::SocketAddr>, LocatorParseError> {
    spec.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_one_locator_endpoint)
        .collect()
}

fn parse_one_locator_endpoint(item: &str) -> Result<std::net::SocketAddr, LocatorParseError> {
    use std::net::ToSocketAddrs;
    let with_host = if item.parse::<u16>().is_ok() {
        format!("localhost:{item}")
    } else {
        item.to_string()
    };
    with_host
        .to_socket_addrs()
        .map_err(|source| LocatorParseError::Resolve {
            item: item.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| LocatorParseError::NoAddress { item: item.to_string() })
}

#[derive(Debug, thiserror::Error)]
pub enum LocatorParseError {
    #[error("could not resolve locator endpoint '{item}': {source}")]
    Resolve { item: String, source: io::Error },
    #[error("locator endpoint '{item}' resolved to no addresses")]
    NoAddress { item: String },
}

/// The receiving half of one dispatched invocation, handed to a
/// [`Handler`]. Request bodies are opaque byte chunks — the core only
/// guarantees delivery (§4.G "HTTP middleware"); any framing on top
/// (HTTP, a typed RPC payload, …) is the handler's job.
pub struct WorkerReceiver {
    inner: StreamReceiver<ByteBuf>,
}

impl WorkerReceiver {
    fn new(inner: StreamReceiver<ByteBuf>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(self.inner.recv().await?.map(ByteBuf::into_vec))
    }

    pub fn span(&self) -> u64 {
        self.inner.span()
    }
}

/// The sending half of one dispatched invocation (§4.G "Worker sender
/// contract"). `write` may be called any number of times; exactly one of
/// `close`/`error` ends the channel. Dropping a `WorkerSender` without an
/// explicit close emits an implicit `choke`, matching the contract's last
/// sentence — `ChunkSender` itself deliberately does nothing on drop (see
/// its doc comment), so that behavior lives here instead.
pub struct WorkerSender {
    inner: Option<ChunkSender<ByteBuf>>,
}

impl WorkerSender {
    fn new(inner: ChunkSender<ByteBuf>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), RelayError> {
        let inner = self.inner.as_ref().ok_or(TransportError::NotConnected)?;
        inner.write(&ByteBuf::from(bytes.into()))
    }

    pub fn close(mut self) -> Result<(), RelayError> {
        self.inner.take().ok_or(TransportError::NotConnected)?.close()
    }

    pub fn error(mut self, id: i64, reason: impl Into<String>, category: Option<u8>) -> Result<(), RelayError> {
        self.inner
            .take()
            .ok_or(TransportError::NotConnected)?
            .error(id, reason, category)
    }
}

impl Drop for WorkerSender {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.close();
        }
    }
}

/// A registered event handler. Implementors own the lifetime of one
/// invocation: read from `request` and write to `response` however many
/// times is appropriate, then consume `response` with `close`/`error` (or
/// let it drop, which implicitly chokes).
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: WorkerReceiver, response: WorkerSender);
}

/// A dedicated thread pool handler invocations are dispatched onto,
/// separate from the I/O reactor driving the control channel and read
/// loop, matching §5's "user-level handlers run on a separate executor
/// thread pool (configurable, default: one thread)".
struct HandlerExecutor {
    // `Some` until dropped. Boxed in an `Option` so `Drop` can hand the
    // runtime to `shutdown_background` instead of letting its default
    // `Drop` impl block the current thread joining worker threads — fatal
    // if this executor is itself dropped from inside another Tokio
    // runtime's async context, which is exactly what happens when a
    // `WorkerSession` goes out of scope inside a `#[tokio::test]`.
    runtime: Option<tokio::runtime::Runtime>,
}

impl HandlerExecutor {
    fn new(threads: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("relay-worker-dispatch")
            .enable_all()
            .build()?;
        Ok(Self { runtime: Some(runtime) })
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.as_ref().expect("runtime dropped").spawn(future);
    }
}

impl Drop for HandlerExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Server-side counterpart of [`crate::client::Service`]: owns the local-
/// socket connection to the runtime, the handshake/heartbeat/disown
/// timers, and the registry of event handlers.
pub struct WorkerSession {
    config: WorkerConfig,
    session: Arc<BasicSession>,
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
    fallback: Arc<Mutex<Option<Arc<dyn Handler>>>>,
    executor: Arc<HandlerExecutor>,
}

impl WorkerSession {
    pub fn new(config: WorkerConfig) -> io::Result<Self> {
        let executor = HandlerExecutor::new(config.dispatch_threads)?;
        Ok(Self {
            session: BasicSession::new(),
            handlers: Arc::new(DashMap::new()),
            fallback: Arc::new(Mutex::new(None)),
            executor: Arc::new(executor),
            config,
        })
    }

    /// Registers `handler` under `event`. Overwrites any prior registration
    /// for the same name.
    pub fn on(&self, event: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(event.into(), handler);
    }

    /// Registers the handler used for `invoke(event_name)` frames naming an
    /// event with no dedicated registration. `spec.md` §9 leaves the
    /// relationship between this and a hypothetical second
    /// "on_unregistered" hook an open question and says not to guess, so
    /// only this single fallback slot is implemented, matching the new
    /// `worker_t`'s `on` + `fallback` surface exactly.
    pub fn fallback(&self, handler: Arc<dyn Handler>) {
        *self.fallback.lock() = Some(handler);
    }

    /// Dials the runtime's local socket, sends the handshake, and runs the
    /// control loop (heartbeat emission, disown detection, invoke
    /// dispatch) until termination or a fatal error. Returns the terminal
    /// [`WorkerError`] wrapped as a [`RelayError`] — there is no "clean
    /// exit with no error" outcome, since every way this loop ends is one
    /// of terminate/disown/transport failure.
    pub async fn run(&self) -> Result<(), RelayError> {
        let stream = UnixStream::connect(&self.config.endpoint)
            .await
            .map_err(TransportError::StreamIo)?;
        self.session.attach(stream);
        self.install_invoke_hook();

        self.session.push(CONTROL_SPAN, HANDSHAKE, &(self.config.uuid.clone(),))?;
        info!(app = %self.config.app, uuid = %self.config.uuid, "handshake sent");

        let control = self.session.register_inbound_raw(CONTROL_SPAN);
        let result = control_loop(&self.session, &control, &self.config).await;
        if let Err(error) = &result {
            self.session.fail_all(clone_worker_failure(error));
        }
        result
    }

    /// Wires the session's orphan-frame hook to treat the first frame of
    /// any never-before-seen span as `invoke(event_name)`: looks up (or
    /// falls back for) a handler, registers the span's channel, and
    /// dispatches onto the handler executor (§4.G "Invoke dispatch").
    fn install_invoke_hook(&self) {
        let session = Arc::clone(&self.session);
        let handlers = Arc::clone(&self.handlers);
        let fallback = Arc::clone(&self.fallback);
        let executor = Arc::clone(&self.executor);
        self.session.set_orphan_hook(move |message: DecodedMessage| {
            dispatch_invoke(&session, &handlers, &fallback, &executor, message);
        });
    }
}

fn dispatch_invoke(
    session: &Arc<BasicSession>,
    handlers: &DashMap<String, Arc<dyn Handler>>,
    fallback: &Mutex<Option<Arc<dyn Handler>>>,
    executor: &HandlerExecutor,
    message: DecodedMessage,
) {
    if message.message_type() != INVOKE {
        // A frame for a span this worker no longer tracks (already
        // revoked) that happens to arrive after revocation. Not a new
        // invocation — drop it, per the orphan-frame policy.
        return;
    }
    let span = message.span();
    let event_name: String = match message.arg(0) {
        Ok(name) => name,
        Err(_) => return,
    };

    let handler = handlers
        .get(&event_name)
        .map(|entry| Arc::clone(entry.value()))
        .or_else(|| fallback.lock().clone());

    let Some(handler) = handler else {
        let reason = format!("event '{event_name}' not found");
        let _ = session.push(
            span,
            protocol::STREAM_ERROR,
            &(EVENT_NOT_FOUND_ID, reason, EVENT_NOT_FOUND_CATEGORY),
        );
        let _ = session.push(span, protocol::STREAM_CHOKE, &());
        return;
    };

    let request = WorkerReceiver::new(session.register_inbound(span));
    let response = match session.sender_for(span) {
        Ok(sender) => WorkerSender::new(sender),
        Err(_) => return,
    };
    executor.spawn(async move { handler.handle(request, response).await }.instrument(info_span!("relay_invoke", %event_name, span)));
}

async fn control_loop(
    session: &Arc<BasicSession>,
    control: &Arc<SharedState>,
    config: &WorkerConfig,
) -> Result<(), RelayError> {
    let mut heartbeat_timer = tokio::time::interval(config.heartbeat_interval);
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let disown_deadline = tokio::time::sleep(config.disown_timeout);
    tokio::pin!(disown_deadline);

    loop {
        tokio::select! {
            _ = heartbeat_timer.tick() => {
                session.push(CONTROL_SPAN, HEARTBEAT, &())?;
            }
            _ = &mut disown_deadline => {
                return Err(WorkerError::Disowned { timeout_secs: config.disown_timeout.as_secs() }.into());
            }
            frame = control.recv() => {
                match frame? {
                    None => return Err(WorkerError::UnexpectedEof.into()),
                    Some(message) => match message.message_type() {
                        HEARTBEAT => {
                            disown_deadline.as_mut().reset(Instant::now() + config.disown_timeout);
                        }
                        TERMINATE => {
                            let code: u8 = message.arg(0)?;
                            let reason: String = message.arg(1)?;
                            let _ = session.push(CONTROL_SPAN, TERMINATE, &(code, reason.clone()));
                            return Err(WorkerError::Terminated { code, reason }.into());
                        }
                        other => return Err(WorkerError::InvalidProtocolType(other).into()),
                    },
                }
            }
        }
    }
}

fn clone_worker_failure(error: &RelayError) -> RelayError {
    match error {
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
        _ => TransportError::OperationAborted.into(),
    }
}
