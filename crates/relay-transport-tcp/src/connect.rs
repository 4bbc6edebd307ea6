use std::net::SocketAddr;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::TcpTransportError;

/// Socket-level options applied to every channel this crate hands out.
///
/// Bundled the way `TcpSocketConfig` bundles `SO_LINGER` in the upstream
/// transport crate this one is descended from: a config layer keeps socket
/// tuning out of the connect/accept call sites.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: false,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    fn apply(&self, stream: &TcpStream) -> Result<(), TcpTransportError> {
        if self.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|source| TcpTransportError::Configure { source })?;
        }
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)
            .map_err(|source| TcpTransportError::Configure { source })
    }
}

/// Connects to the first candidate in `candidates` that accepts a TCP
/// connection, walking the list in order as specified for `basic_session_t`'s
/// connect step: multiple endpoints are tried in sequence, not in parallel,
/// so the first success wins deterministically.
///
/// Returns [`TcpTransportError::AllCandidatesFailed`] carrying the last
/// observed I/O error if every candidate was rejected, or
/// [`TcpTransportError::NoCandidates`] if the slice was empty.
pub async fn connect_first_reachable(
    candidates: &[SocketAddr],
    config: TcpSocketConfig,
) -> Result<TcpStream, TcpTransportError> {
    let mut last_error = None;
    for addr in candidates {
        debug!(%addr, "attempting connect");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                config.apply(&stream)?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => {
                warn!(%addr, error = %err, "candidate endpoint unreachable");
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(last) => Err(TcpTransportError::AllCandidatesFailed { last }),
        None => Err(TcpTransportError::NoCandidates),
    }
}
