use std::net::SocketAddr;

use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use crate::error::TcpTransportError;

/// Thin wrapper over `tokio::net::TcpListener`.
///
/// Production call sites never accept inbound TCP connections — the client
/// only dials out, and the worker dials out over a local socket — so the
/// only consumer of this type in this workspace is the integration test
/// harness standing in for a service/locator peer.
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TcpTransportError> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .map_err(|source| TcpTransportError::Bind { addr, source })?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TcpTransportError> {
        self.inner
            .local_addr()
            .map_err(|source| TcpTransportError::Accept { source })
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TcpTransportError> {
        self.inner
            .accept()
            .await
            .map_err(|source| TcpTransportError::Accept { source })
    }
}
