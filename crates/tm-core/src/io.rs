//! Duplex byte-stream aliases shared by every layer

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any owned, sendable duplex byte stream
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex byte stream
pub type BoxedIo = Box<dyn AsyncIo>;

/// Socket addresses of the physical connection under a tunnel.
///
/// Either side may be unknown, e.g. for in-memory pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    /// Local end of the physical connection
    pub local: Option<SocketAddr>,
    /// Remote end of the physical connection
    pub remote: Option<SocketAddr>,
}

impl Link {
    /// Link with both ends known
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local: Some(local),
            remote: Some(remote),
        }
    }
}

/// IP address a tunnel leaves this host from, `0.0.0.0` when unknown
pub fn outbound_ip(local: Option<SocketAddr>) -> IpAddr {
    local
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
