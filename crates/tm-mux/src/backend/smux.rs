//! smux backend over `async_smux`

use std::num::{NonZeroU64, NonZeroUsize};

use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector};
use async_trait::async_trait;
use tm_core::config::SmuxConfig;
use tm_core::BoxedIo;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Backend, Termination, CLOSED_BY_PEER, CLOSED_LOCALLY};
use crate::error::MuxError;
use crate::muxer::{Library, Role};

/// An `async_smux` session and its I/O worker task
pub struct SmuxBackend {
    connector: MuxConnector<BoxedIo>,
    acceptor: Mutex<MuxAcceptor<BoxedIo>>,
    worker: JoinHandle<()>,
    done: CancellationToken,
    termination: Termination,
}

impl SmuxBackend {
    /// Run the smux handshake for `role` over `io` and spawn the worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(io: BoxedIo, config: &SmuxConfig, role: Role) -> Self {
        let mut builder = match role {
            Role::Client => MuxBuilder::client(),
            Role::Server => MuxBuilder::server(),
        };

        // zero disables the respective timer
        if let Some(interval) = NonZeroU64::new(config.keep_alive_interval.as_secs()) {
            builder.with_keep_alive_interval(interval);
        }
        if let Some(timeout) = NonZeroU64::new(config.idle_timeout.as_secs()) {
            builder.with_idle_timeout(timeout);
        }
        if let Some(queue) = NonZeroUsize::new(config.max_tx_queue) {
            builder.with_max_tx_queue(queue);
        }
        if let Some(queue) = NonZeroUsize::new(config.max_rx_queue) {
            builder.with_max_rx_queue(queue);
        }

        let (connector, acceptor, worker) = builder.with_connection(io).build();

        let done = CancellationToken::new();
        let termination = Termination::default();
        let guard = done.clone().drop_guard();
        let reason = termination.clone();
        let worker = tokio::spawn(async move {
            let _guard = guard;
            match worker.await {
                Ok(()) => {
                    reason.record(CLOSED_BY_PEER);
                    debug!("smux worker exited");
                }
                Err(e) => {
                    debug!(error = %e, "smux worker exited with error");
                    reason.record(e.to_string());
                }
            }
        });

        Self {
            connector,
            acceptor: Mutex::new(acceptor),
            worker,
            done,
            termination,
        }
    }
}

#[async_trait]
impl Backend for SmuxBackend {
    const LIBRARY: Library = Library {
        name: "smux",
        module: "async_smux",
    };

    async fn open_stream(&self) -> Result<BoxedIo, MuxError> {
        if self.done.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        let stream = self
            .connector
            .connect()
            .map_err(|e| MuxError::Open(e.to_string()))?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Result<BoxedIo, MuxError> {
        let mut acceptor = self.acceptor.lock().await;
        tokio::select! {
            _ = self.done.cancelled() => Err(MuxError::SessionClosed),
            stream = acceptor.accept() => match stream {
                Some(stream) => Ok(Box::new(stream) as BoxedIo),
                None => Err(MuxError::SessionClosed),
            },
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        if self.done.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        self.termination.record(CLOSED_LOCALLY);
        // The transport is shared by connector and acceptor; only closing
        // the connector shuts it.
        let mut connector = self.connector.clone();
        if let Err(e) = connector.close().await {
            debug!(error = %e, "smux close failed");
        }
        self.worker.abort();
        self.done.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    async fn closed(&self) {
        self.done.cancelled().await
    }

    fn termination(&self) -> Option<String> {
        self.termination.get()
    }
}

impl Drop for SmuxBackend {
    fn drop(&mut self) {
        if !self.done.is_cancelled() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let mut connector = self.connector.clone();
                runtime.spawn(async move {
                    let _ = connector.close().await;
                });
            }
        }
        self.worker.abort();
    }
}
