//! Session-backed network dialer
//!
//! [`MuxOpener`] names the node at the far end of a session so that
//! consumers written against [`tm_core::Dialer`] (e.g. an HTTP client whose
//! requests address `<id>.agent.ssoc.internal`) can reach it: every dial
//! opens a fresh virtual connection, whatever address is requested.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tm_core::{BoxedIo, Dialer};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::conn::VirtualConn;
use crate::error::MuxError;
use crate::muxer::Muxer;

/// A session paired with the logical host it reaches
#[derive(Clone)]
pub struct MuxOpener {
    mux: Arc<dyn Muxer>,
    host: String,
}

impl MuxOpener {
    pub fn new(mux: Arc<dyn Muxer>, host: impl Into<String>) -> Self {
        Self {
            mux,
            host: host.into(),
        }
    }

    /// Logical host name of the remote node
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The underlying session
    pub fn muxer(&self) -> &Arc<dyn Muxer> {
        &self.mux
    }

    /// Open a virtual connection to the remote node
    pub async fn open(&self, cancel: &CancellationToken) -> Result<VirtualConn, MuxError> {
        self.mux.open(cancel).await
    }
}

#[async_trait]
impl Dialer for MuxOpener {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> io::Result<BoxedIo> {
        trace!(host = %self.host, network, address, "Opening virtual connection");
        let conn = self.open(cancel).await?;
        Ok(Box::new(conn))
    }
}

impl std::fmt::Debug for MuxOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxOpener")
            .field("host", &self.host)
            .field("library", &self.mux.library())
            .finish()
    }
}
