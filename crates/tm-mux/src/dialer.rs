//! Failover dialing
//!
//! [`MuxDialer`] turns a list of candidate endpoints into one live session.
//! Candidates are tried strictly in order, each bounded by the per-attempt
//! timeout; the first that upgrades and yields a session wins and later
//! candidates are never contacted. If every candidate fails the caller gets
//! one error carrying each candidate's cause.

use std::sync::Arc;

use tm_core::config::{deduplicate, DialConfig};
use tm_protocol::{tunnel_url, Protocol};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::error::{AttemptError, AttemptFailure, DialError};
use crate::muxer::{Muxer, Role};
use crate::session::{new_muxer, validate_config};
use crate::upgrade::{Upgraded, Upgrader, WsUpgrader};

/// Dials tunnel sessions with failover across candidate addresses
pub struct MuxDialer {
    config: DialConfig,
    upgrader: Arc<dyn Upgrader>,
    span: Span,
}

impl MuxDialer {
    /// Dialer with the default websocket upgrader, which does not verify
    /// server certificates, and a `tunnel_dial` span
    pub fn new(config: DialConfig) -> Self {
        Self {
            config,
            upgrader: Arc::new(WsUpgrader::insecure()),
            span: info_span!("tunnel_dial"),
        }
    }

    /// Replace the upgrade dialer
    pub fn with_upgrader(mut self, upgrader: Arc<dyn Upgrader>) -> Self {
        self.upgrader = upgrader;
        self
    }

    /// Replace the span attempts are logged in
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &DialConfig {
        &self.config
    }

    /// Dial the addresses from the configuration
    pub async fn dial_configured(
        &self,
        parent: &CancellationToken,
    ) -> Result<Arc<dyn Muxer>, DialError> {
        self.dial(parent, &self.config.addresses).await
    }

    /// Dial `addresses` in order until one yields a session.
    ///
    /// Blank entries and repeats are dropped first; if nothing is left the
    /// call fails with [`DialError::NoAddress`] without touching the
    /// network. Virtual connections of the returned session derive their
    /// cancellation from `parent`.
    pub async fn dial<S: AsRef<str>>(
        &self,
        parent: &CancellationToken,
        addresses: &[S],
    ) -> Result<Arc<dyn Muxer>, DialError> {
        let candidates = deduplicate(addresses);
        self.dial_round(parent, candidates)
            .instrument(self.span.clone())
            .await
    }

    async fn dial_round(
        &self,
        parent: &CancellationToken,
        candidates: Vec<String>,
    ) -> Result<Arc<dyn Muxer>, DialError> {
        if candidates.is_empty() {
            warn!("No usable tunnel address");
            return Err(DialError::NoAddress);
        }

        let protocol = self.config.protocol;
        debug!(candidates = candidates.len(), %protocol, "Dialing tunnel");

        let mut failures = Vec::with_capacity(candidates.len());
        for (attempt, address) in candidates.into_iter().enumerate() {
            match self.attempt(parent, &address, protocol).await {
                Ok(mux) => {
                    info!(
                        %address,
                        %protocol,
                        library = %mux.library(),
                        "Tunnel established"
                    );
                    return Ok(mux);
                }
                Err(AttemptFailure::Cancelled) => {
                    debug!(%address, "Tunnel dial cancelled");
                    return Err(DialError::Cancelled);
                }
                Err(source) => {
                    warn!(%address, attempt, error = %source, "Tunnel attempt failed");
                    failures.push(AttemptError { address, source });
                }
            }
        }

        error!(attempts = failures.len(), "All tunnel addresses failed");
        Err(DialError::Attempts(failures))
    }

    async fn attempt(
        &self,
        parent: &CancellationToken,
        address: &str,
        protocol: Protocol,
    ) -> Result<Arc<dyn Muxer>, AttemptFailure> {
        if parent.is_cancelled() {
            return Err(AttemptFailure::Cancelled);
        }

        let url = tunnel_url(self.config.scheme(), address, self.config.path(), protocol)?;
        let per_timeout = self.config.per_timeout();

        let establish = async {
            let upgraded = self
                .upgrader
                .upgrade(&url)
                .await
                .map_err(AttemptFailure::Upgrade)?;
            self.establish(parent, upgraded, protocol).await
        };

        tokio::select! {
            biased;
            _ = parent.cancelled() => Err(AttemptFailure::Cancelled),
            result = tokio::time::timeout(per_timeout, establish) => {
                result.unwrap_or(Err(AttemptFailure::Timeout(per_timeout)))
            }
        }
    }

    async fn establish(
        &self,
        parent: &CancellationToken,
        upgraded: Upgraded,
        protocol: Protocol,
    ) -> Result<Arc<dyn Muxer>, AttemptFailure> {
        let Upgraded { mut io, link } = upgraded;

        if let Err(e) = validate_config(protocol, &self.config) {
            // the upgraded connection is not handed to anyone, close it
            if let Err(shutdown) = io.shutdown().await {
                debug!(error = %shutdown, "Closing rejected tunnel connection failed");
            }
            return Err(e.into());
        }

        let mux = new_muxer(
            protocol,
            Some(parent.clone()),
            io,
            link,
            &self.config,
            Role::Client,
        )?;
        Ok(mux)
    }
}

impl std::fmt::Debug for MuxDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxDialer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
