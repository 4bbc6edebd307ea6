//! Client locator flow: resolve a service name, connect, invoke — and the
//! manager that owns the pool of event-loop threads services are handed
//! out from.
//!
//! A `Service<Tag>` reconnects implicitly: every `invoke` first calls
//! `connect`, which is a no-op once the underlying `BasicSession` is
//! already connected, so a caller never has to notice that the very first
//! call to a freshly created `Service` pays for a resolve + dial while
//! later calls do not.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use relay_transport_tcp::TcpSocketConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::lookup_host;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{instrument, warn};

use crate::error::{RelayError, ServiceError, TransportError};
use crate::protocol::{ChunkSender, StreamReceiver};
use crate::resolver::{CoalescedResolver, Resolver};
use crate::session::BasicSession;

/// Per-client configuration: where the locator lives and how the sockets
/// this client dials are tuned. Mirrors `spark-transport-tcp::TcpSocketConfig`
/// being bundled rather than passed as loose constructor arguments.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub locator_endpoints: Vec<SocketAddr>,
    pub socket_config: TcpSocketConfig,
}

impl Default for ClientConfig {
    /// `[::]:10053`, the locator's well-known default address.
    fn default() -> Self {
        Self {
            locator_endpoints: vec!["[::]:10053".parse().expect("valid default locator address")],
            socket_config: TcpSocketConfig::new().with_nodelay(true),
        }
    }
}

/// Compile-time descriptor of a remote service: its required protocol
/// version. Services in richer RPC graphs also carry a `dispatch_type`/
/// `upstream_type` pair describing the protocol state machine, but since
/// this runtime realizes every channel as one of the three concrete shapes
/// in [`crate::protocol`] rather than a generalized graph, a tag only needs
/// to carry the version the locator must agree on.
pub trait ServiceTag: Send + Sync + 'static {
    const VERSION: u32;
}

/// A single event a service exposes: the wire type id it is invoked with,
/// the argument tuple it is encoded from, and the response it decodes into.
pub trait Event: Send + Sync + 'static {
    type Args: Serialize + Send + Sync;
    type Response: DeserializeOwned + Send + Sync;
    const MESSAGE_TYPE: u64;
}

/// A named, versioned remote endpoint reachable through the locator.
///
/// Holds a service's name, its required version (carried in `Tag`), a
/// coalesced resolver, and a session. The session is created disconnected
/// and dialed lazily on first `invoke`/`connect`.
pub struct Service<Tag: ServiceTag> {
    name: String,
    config: ClientConfig,
    resolver: Arc<CoalescedResolver>,
    session: Arc<BasicSession>,
    _tag: PhantomData<fn() -> Tag>,
}

impl<Tag: ServiceTag> Service<Tag> {
    fn new(name: impl Into<String>, config: ClientConfig, resolver: Arc<CoalescedResolver>) -> Self {
        Self {
            name: name.into(),
            config,
            resolver,
            session: BasicSession::new(),
            _tag: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent; safe to call concurrently — `BasicSession::connect_tcp`'s
    /// own CAS handles the "two callers race to connect" case by returning
    /// `AlreadyStarted` to the loser, which this method treats the same as
    /// success since the winner's connect will complete the session either
    /// way.
    #[instrument(skip(self), fields(service = %self.name))]
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.session.is_connected() {
            return Ok(());
        }
        let (endpoints, version) = self.resolver.resolve(&self.name).await?;
        if version != Tag::VERSION {
            return Err(ServiceError::VersionMismatch {
                service: self.name.clone(),
                expected: Tag::VERSION,
                actual: version,
            }
            .into());
        }
        let addrs = resolve_socket_addrs(&endpoints).await?;
        match self.session.connect_tcp(&addrs, self.config.socket_config).await {
            Ok(()) => Ok(()),
            Err(RelayError::Transport(TransportError::AlreadyStarted))
            | Err(RelayError::Transport(TransportError::AlreadyConnected)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// `invoke<Event>(args)` for a streaming event: connect, open a span,
    /// hand back the raw `(sender, receiver)` pair typed to `Event`.
    pub async fn invoke<E: Event>(
        &self,
        args: &E::Args,
    ) -> Result<(ChunkSender<E::Args>, StreamReceiver<E::Response>), RelayError> {
        self.connect().await?;
        let (span, receiver) = self.session.invoke::<E::Response>(E::MESSAGE_TYPE, args)?;
        let sender = self.session.sender_for(span)?;
        Ok((sender, receiver))
    }

    /// `invoke<Event>(args)` for a unary event whose `upstream_type` is
    /// `void` and `dispatch_type` is a primitive tag: connect, invoke, and
    /// collapse the result with a single `recv()` so callers write
    /// `service.invoke_value::<Read>(&args).await? -> Value` instead of
    /// juggling sender/receiver themselves.
    pub async fn invoke_value<E: Event>(&self, args: &E::Args) -> Result<E::Response, RelayError> {
        self.connect().await?;
        let (_span, receiver) = self.session.invoke_primitive::<E::Response>(E::MESSAGE_TYPE, args)?;
        receiver.recv().await
    }
}

async fn resolve_socket_addrs(endpoints: &[String]) -> Result<Vec<SocketAddr>, RelayError> {
    let mut addrs = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        match endpoint.parse::<SocketAddr>() {
            Ok(addr) => addrs.push(addr),
            Err(_) => {
                let mut resolved = lookup_host(endpoint)
                    .await
                    .map_err(crate::error::TransportError::StreamIo)?;
                match resolved.next() {
                    Some(addr) => addrs.push(addr),
                    None => warn!(endpoint, "locator endpoint resolved to no addresses"),
                }
            }
        }
    }
    Ok(addrs)
}

/// One OS thread driving its own single-threaded reactor, the way the
/// original runtime pins one event loop per thread rather than sharing a
/// work-stealing pool across them.
struct EventLoop {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl EventLoop {
    fn spawn() -> std::io::Result<Self> {
        let runtime = Runtime::new()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = std::thread::Builder::new()
            .name("relay-client-loop".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
            })?;
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns the pool of event-loop threads and hands one out, round-robin, per
/// created service.
pub struct ServiceManager {
    config: ClientConfig,
    resolver: Arc<CoalescedResolver>,
    loops: Vec<EventLoop>,
    next_loop: AtomicUsize,
}

impl ServiceManager {
    /// `loop_count` is the size of the event-loop thread pool; at least one
    /// loop is always created even if `0` is passed.
    pub fn new(config: ClientConfig, loop_count: usize) -> std::io::Result<Self> {
        let resolver = Arc::new(CoalescedResolver::new(Resolver::new(config.locator_endpoints.clone())));
        let loops = (0..loop_count.max(1))
            .map(|_| EventLoop::spawn())
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self {
            config,
            resolver,
            loops,
            next_loop: AtomicUsize::new(0),
        })
    }

    /// The `tokio::runtime::Handle` of the next loop in round-robin order.
    /// A created `Service` does not need this handle for ordinary
    /// `connect`/`invoke` calls (those simply run on whatever runtime the
    /// caller awaits them from); it exists for callers that want to
    /// fire-and-forget an invocation onto the manager's own pool instead of
    /// the caller's task.
    pub fn next_loop_handle(&self) -> Handle {
        let index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].handle.clone()
    }

    /// Creates a new service bound to this manager's locator configuration
    /// and coalesced resolver. Lifetime is tied to the manager only in that
    /// the manager owns the shared resolver and thread pool the service
    /// uses — dropping a `Service` early is always safe.
    pub fn create_service<Tag: ServiceTag>(&self, name: impl Into<String>) -> Service<Tag> {
        Service::new(name, self.config.clone(), Arc::clone(&self.resolver))
    }

    /// Drains pending operations by dropping every owned session-affine
    /// state (none is held directly by the manager) and joins each loop's
    /// driver thread.
    pub fn shutdown(mut self) {
        for event_loop in &mut self.loops {
            event_loop.shutdown();
        }
    }
}
