//! Name resolution against the locator: a single-shot resolver that dials,
//! asks, and disconnects, and a coalesced resolver that shares one
//! in-flight resolution across every caller asking for the same name at
//! once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use relay_transport_tcp::TcpSocketConfig;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::channel_state::clone_relay_error;
use crate::error::{RelayError, ServiceError};
use crate::session::BasicSession;

/// The wire type_id for the locator's `resolve` call.
const RESOLVE: u64 = 0;

/// The locator's dedicated response-error id for "no such service",
/// per `original_source/src/resolver.cpp`'s `err.id() ==
/// cocaine::error::locator_errors::service_not_available` check — every
/// other response error id is rethrown unchanged rather than folded into
/// `ServiceNotFound`. The `locator_errors` enum that defines this id's
/// concrete numeric value lives outside this pack's retrieved
/// `original_source/` slice, so this workspace fixes it at `1` as its own
/// concrete choice (see DESIGN.md), the same kind of undocumented-numeric-id
/// decision already recorded for the worker's `event_not_found`.
const SERVICE_NOT_AVAILABLE: i64 = 1;

/// What the locator hands back for a resolved service: its candidate
/// endpoints and the protocol version its dispatch graph was generated
/// against.
pub type ResolvedService = (Vec<String>, u32);

/// Dials the locator fresh for every call. Used by [`CoalescedResolver`]
/// as the thing it coalesces, and usable directly by callers that want no
/// sharing at all.
#[derive(Clone)]
pub struct Resolver {
    locator_endpoints: Vec<SocketAddr>,
    socket_config: TcpSocketConfig,
}

impl Resolver {
    pub fn new(locator_endpoints: Vec<SocketAddr>) -> Self {
        Self {
            locator_endpoints,
            socket_config: TcpSocketConfig::new().with_nodelay(true),
        }
    }

    #[instrument(skip(self), fields(name))]
    pub async fn resolve(&self, name: &str) -> Result<ResolvedService, RelayError> {
        let session = BasicSession::new();
        session
            .connect_tcp(&self.locator_endpoints, self.socket_config)
            .await?;
        let (_span, receiver) = session.invoke_primitive::<ResolvedService>(RESOLVE, &(name,))?;
        match receiver.recv().await {
            Err(RelayError::Response(err)) if err.id == SERVICE_NOT_AVAILABLE => {
                debug!(name, "locator reported the service as unavailable");
                Err(ServiceError::ServiceNotFound(name.to_string()).into())
            }
            other => other,
        }
    }
}

/// Wraps a [`Resolver`] so that concurrent `resolve(name)` calls for the
/// same name share one network round trip: the first caller for a given
/// name performs the real resolve, and every caller that arrives before it
/// completes is queued and woken with the same result. The network call
/// itself always runs outside the lock — only the `name → waiters` map is
/// ever held across an await-free critical section.
pub struct CoalescedResolver {
    inner: Resolver,
    in_flight: SyncMutex<HashMap<String, Vec<oneshot::Sender<Result<ResolvedService, RelayError>>>>>,
}

impl CoalescedResolver {
    pub fn new(inner: Resolver) -> Self {
        Self {
            inner,
            in_flight: SyncMutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<ResolvedService, RelayError> {
        let (tx, rx) = oneshot::channel();
        let is_leader = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(name) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    in_flight.insert(name.to_string(), vec![tx]);
                    true
                }
            }
        };

        if is_leader {
            // The waiter channel carries the real `RelayError`, not a
            // downcast into `ServiceError` — a transport failure (e.g. the
            // locator connection being refused) must reach every waiter as
            // itself, not as a `ServiceNotFound` whose `name` field is
            // actually an OS error string.
            let outcome = self.inner.resolve(name).await;
            let waiters = self.in_flight.lock().remove(name).unwrap_or_default();
            for waiter in waiters {
                let cloned = match &outcome {
                    Ok(resolved) => Ok(resolved.clone()),
                    Err(error) => Err(clone_relay_error(error)),
                };
                let _ = waiter.send(cloned);
            }
            return outcome;
        }

        rx.await.map_err(|_| RelayError::from(crate::error::TransportError::OperationAborted))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use relay_transport_tcp::TcpListener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::codec;
    use crate::protocol::{PRIMITIVE_ERROR, PRIMITIVE_VALUE};

    /// Accepts every connection it gets, decodes one request frame per
    /// connection, and replies with a fixed `ResolvedService` after a short
    /// delay — long enough that several concurrent `resolve` calls reliably
    /// land while the leader's round trip is still in flight.
    async fn spawn_fake_locator(response: ResolvedService, connections: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                connections.fetch_add(1, AtomicOrdering::SeqCst);
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = match stream.read(&mut buf).await {
                        Ok(n) if n > 0 => n,
                        _ => return,
                    };
                    let mut decoder = codec::Decoder::new();
                    decoder.feed(&buf[..n]);
                    let message = match decoder.decode_next() {
                        Ok(Some(message)) => message,
                        _ => return,
                    };
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let frame = codec::encode(message.span(), PRIMITIVE_VALUE, &(response,)).unwrap();
                    let _ = stream.write_all(&frame).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn concurrent_resolves_for_the_same_name_share_one_round_trip() {
        let connections = Arc::new(AtomicUsize::new(0));
        let want: ResolvedService = (vec!["10.0.0.1:9000".to_string()], 1);
        let addr = spawn_fake_locator(want.clone(), Arc::clone(&connections)).await;
        let resolver = Arc::new(CoalescedResolver::new(Resolver::new(vec![addr])));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve("svc").await })
            })
            .collect();

        for handle in handles {
            let got = handle.await.unwrap().unwrap();
            assert_eq!(got, want);
        }
        // Every waiter shared the leader's single round trip.
        assert_eq!(connections.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_maps_a_response_error_to_service_not_found() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let mut decoder = codec::Decoder::new();
            decoder.feed(&buf[..n]);
            let message = decoder.decode_next().unwrap().unwrap();
            let frame = codec::encode(message.span(), PRIMITIVE_ERROR, &(1i64, "no such service")).unwrap();
            stream.write_all(&frame).await.unwrap();
        });

        let resolver = Resolver::new(vec![addr]);
        let err = resolver.resolve("missing").await.unwrap_err();
        assert!(matches!(err, RelayError::Service(ServiceError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn resolve_rethrows_a_response_error_that_is_not_service_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let mut decoder = codec::Decoder::new();
            decoder.feed(&buf[..n]);
            let message = decoder.decode_next().unwrap().unwrap();
            // Any id other than `SERVICE_NOT_AVAILABLE` must reach the caller
            // untouched, not get folded into `ServiceNotFound`.
            let frame = codec::encode(message.span(), PRIMITIVE_ERROR, &(42i64, "locator overloaded")).unwrap();
            stream.write_all(&frame).await.unwrap();
        });

        let resolver = Resolver::new(vec![addr]);
        let err = resolver.resolve("svc").await.unwrap_err();
        match err {
            RelayError::Response(response) => {
                assert_eq!(response.id, 42);
                assert_eq!(response.reason, "locator overloaded");
            }
            other => panic!("expected an unmapped response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn coalesced_resolve_propagates_a_transport_error_to_every_waiter() {
        // No listener bound at this address: every waiter's leader-driven
        // round trip fails with a connection error, which must reach every
        // waiter as the real `RelayError`, not a `ServiceNotFound` whose
        // `name` field holds the OS error string.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let resolver = Arc::new(CoalescedResolver::new(Resolver::new(vec![addr])));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve("svc").await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, RelayError::Transport(_)), "expected a transport error, got {err:?}");
        }
    }
}
