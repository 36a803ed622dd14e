//! The uniform session contract

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::conn::VirtualConn;
use crate::error::MuxError;
use crate::limiter::Limit;

/// Identity of the multiplexing backend behind a session, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Library {
    /// Wire protocol name
    pub name: &'static str,
    /// Implementing crate
    pub module: &'static str,
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.module)
    }
}

/// Which side of the backend handshake a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// The side that dialed the tunnel
    #[default]
    Client,
    /// The side that accepted the upgrade
    Server,
}

/// A multiplexed session: a listener and a dialer of virtual connections
/// over one physical link.
///
/// Closing the session does not close virtual connections already handed
/// out; their I/O fails once the backend is gone, and callers close them.
#[async_trait]
pub trait Muxer: Send + Sync + fmt::Debug {
    /// Open an outbound virtual connection
    async fn open(&self, cancel: &CancellationToken) -> Result<VirtualConn, MuxError>;

    /// Wait for the peer to open a virtual connection
    async fn accept(&self) -> Result<VirtualConn, MuxError>;

    /// Close the backend session
    async fn close(&self) -> Result<(), MuxError>;

    /// Resolves once the session has terminated, for any reason
    async fn closed(&self);

    /// Whether the backend session has terminated
    fn is_closed(&self) -> bool;

    /// Why the session terminated, such as a local close, the peer going
    /// away or a transport error. `None` while it is live.
    fn termination(&self) -> Option<String>;

    /// Local address of the physical link
    fn addr(&self) -> Option<SocketAddr>;

    /// Remote address of the physical link
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Current session-wide rate limit
    fn limit(&self) -> Limit;

    /// Change the rate limit, effective for open connections too
    fn set_limit(&self, limit: Limit);

    /// `(cumulative, active)` stream counts
    fn num_streams(&self) -> (u64, u64);

    /// `(rx, tx)` byte counts
    fn traffic(&self) -> (u64, u64);

    /// Backend identity
    fn library(&self) -> Library;
}
