//! Multiplexing backends
//!
//! A backend owns one multiplexed transport and knows how to open, accept
//! and close raw streams on it. Everything else a session does (counters,
//! throttling, cancellation) is shared in [`crate::session::Session`].

mod smux;
mod yamux;

pub use self::smux::SmuxBackend;
pub use self::yamux::YamuxBackend;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tm_core::BoxedIo;

use crate::error::MuxError;
use crate::muxer::Library;

/// Capability set a wire protocol implementation provides to a session
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Identity reported through [`crate::Muxer::library`]
    const LIBRARY: Library;

    /// Open a new outbound stream
    async fn open_stream(&self) -> Result<BoxedIo, MuxError>;

    /// Next inbound stream; fails with [`MuxError::SessionClosed`] once the
    /// transport is gone
    async fn accept_stream(&self) -> Result<BoxedIo, MuxError>;

    /// Tear the transport down
    async fn close(&self) -> Result<(), MuxError>;

    fn is_closed(&self) -> bool;

    /// Resolves when the transport has terminated
    async fn closed(&self);

    /// Why the transport ended; `None` while it is live
    fn termination(&self) -> Option<String>;
}

pub(crate) const CLOSED_LOCALLY: &str = "closed locally";
pub(crate) const CLOSED_BY_PEER: &str = "closed by peer";

/// Reason a transport terminated. The first recorded reason sticks.
#[derive(Clone, Default)]
pub(crate) struct Termination(Arc<Mutex<Option<String>>>);

impl Termination {
    pub(crate) fn record(&self, reason: impl Into<String>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}
