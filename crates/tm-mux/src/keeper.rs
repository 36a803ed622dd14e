//! Reconnecting session keeper
//!
//! Holds the current session of a client, notices when it dies and redials
//! the configured candidates with exponential backoff until a new session
//! comes up, reporting each transition through [`ClientHooks`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::ExponentialBackoff;
use crate::dialer::MuxDialer;
use crate::error::DialError;
use crate::muxer::Muxer;

/// Lifecycle callbacks of a kept tunnel. All methods default to no-ops.
pub trait ClientHooks: Send + Sync {
    /// The session died for `reason`; redialing starts
    fn disconnected(&self, _mux: &Arc<dyn Muxer>, _reason: &str) {}

    /// A new session replaced the lost one
    fn reconnected(&self, _mux: &Arc<dyn Muxer>) {}

    /// The keeper stopped for good
    fn on_exit(&self, _err: &DialError) {}
}

struct NoopHooks;

impl ClientHooks for NoopHooks {}

/// Keeps one tunnel session alive
pub struct TunnelKeeper {
    dialer: MuxDialer,
    hooks: Arc<dyn ClientHooks>,
    current: watch::Sender<Option<Arc<dyn Muxer>>>,
}

impl TunnelKeeper {
    pub fn new(dialer: MuxDialer) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            dialer,
            hooks: Arc::new(NoopHooks),
            current,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ClientHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The live session, if any
    pub fn current(&self) -> Option<Arc<dyn Muxer>> {
        self.current.borrow().clone()
    }

    /// Watch session replacements
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<dyn Muxer>>> {
        self.current.subscribe()
    }

    /// Dial the configured addresses, then keep the session alive
    pub async fn connect_and_run(&self, parent: &CancellationToken) -> DialError {
        match self.dialer.dial_configured(parent).await {
            Ok(mux) => self.run(parent, mux).await,
            Err(err) => self.exit(err),
        }
    }

    /// Keep `mux` (and its successors) alive.
    ///
    /// Returns when `parent` is cancelled, closing the live session, or when
    /// a redial fails in a way retrying cannot fix. The returned error is
    /// also passed to [`ClientHooks::on_exit`].
    pub async fn run(&self, parent: &CancellationToken, mut mux: Arc<dyn Muxer>) -> DialError {
        let mut backoff = ExponentialBackoff::from_config(&self.dialer.config().backoff);

        loop {
            self.current.send_replace(Some(Arc::clone(&mux)));

            tokio::select! {
                _ = parent.cancelled() => {
                    let _ = mux.close().await;
                    return self.exit(DialError::Cancelled);
                }
                _ = mux.closed() => {}
            }

            let reason = mux
                .termination()
                .unwrap_or_else(|| "session closed".to_string());
            warn!(library = %mux.library(), %reason, "Tunnel session lost");
            self.current.send_replace(None);
            self.hooks.disconnected(&mux, &reason);
            backoff.reset();

            mux = loop {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = parent.cancelled() => return self.exit(DialError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                match self.dialer.dial_configured(parent).await {
                    Ok(mux) => break mux,
                    Err(err @ (DialError::NoAddress | DialError::Cancelled)) => {
                        return self.exit(err)
                    }
                    Err(err) => warn!(error = %err, ?delay, "Tunnel redial failed"),
                }
            };

            info!(library = %mux.library(), "Tunnel session restored");
            self.hooks.reconnected(&mux);
        }
    }

    fn exit(&self, err: DialError) -> DialError {
        self.current.send_replace(None);
        self.hooks.on_exit(&err);
        err
    }
}
