use std::io;
use std::net::SocketAddr;

/// Transport-level failure surfaced by [`crate::connect_first_reachable`] and
/// [`crate::TcpListener`].
///
/// This is the lowest layer of the error kinds described by the runtime's
/// error handling design (`relay_core::error::RelayError` wraps this as its
/// `Transport` variant) — classic I/O failures from the reactor, with enough
/// context to log which candidate address actually failed.
#[derive(Debug, thiserror::Error)]
pub enum TcpTransportError {
    /// None of the candidate endpoints accepted a connection.
    #[error("no candidate endpoint was reachable (last error: {last})")]
    AllCandidatesFailed {
        #[source]
        last: io::Error,
    },
    /// The candidate list was empty.
    #[error("no candidate endpoints were supplied")]
    NoCandidates,
    /// Binding a listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Accepting an inbound connection failed.
    #[error("failed to accept connection: {source}")]
    Accept {
        #[source]
        source: io::Error,
    },
    /// A socket-level configuration call (e.g. `SO_LINGER`, `TCP_NODELAY`) failed.
    #[error("failed to configure socket: {source}")]
    Configure {
        #[source]
        source: io::Error,
    },
}
