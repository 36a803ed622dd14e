//! Sessions: one backend plus the shared limiter and counters
//!
//! [`Session`] is generic over the [`Backend`] so the wiring of counters,
//! throttling and cancellation is written once. The constructors pick the
//! backend from the configured protocol and hand the result out as an
//! `Arc<dyn Muxer>`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tm_core::config::{DialConfig, SmuxConfig, YamuxConfig};
use tm_core::{BoxedIo, Link};
use tm_protocol::Protocol;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SmuxBackend, YamuxBackend};
use crate::conn::VirtualConn;
use crate::error::MuxError;
use crate::limiter::{Limit, RateLimiter};
use crate::muxer::{Library, Muxer, Role};
use crate::stats::{StreamStat, TrafficStat};

/// A live multiplexed session over backend `B`
pub struct Session<B> {
    backend: B,
    link: Link,
    limiter: Arc<RateLimiter>,
    traffic: Arc<TrafficStat>,
    streams: Arc<StreamStat>,
    parent: CancellationToken,
}

impl<B: Backend> Session<B> {
    /// Wrap a running backend.
    ///
    /// Every virtual connection gets a child of `parent`; without one the
    /// session uses a token nobody else cancels.
    pub fn from_backend(backend: B, link: Link, parent: Option<CancellationToken>) -> Self {
        Self {
            backend,
            link,
            limiter: Arc::new(RateLimiter::unlimited()),
            traffic: Arc::new(TrafficStat::new()),
            streams: Arc::new(StreamStat::new()),
            parent: parent.unwrap_or_default(),
        }
    }

    fn wrap(&self, stream: BoxedIo) -> VirtualConn {
        self.streams.open_one();
        VirtualConn::new(
            stream,
            Arc::clone(&self.limiter),
            self.parent.child_token(),
            Arc::clone(&self.traffic),
            Arc::clone(&self.streams),
            self.link,
        )
    }
}

#[async_trait]
impl<B: Backend> Muxer for Session<B> {
    async fn open(&self, cancel: &CancellationToken) -> Result<VirtualConn, MuxError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MuxError::Cancelled),
            stream = self.backend.open_stream() => stream?,
        };
        Ok(self.wrap(stream))
    }

    async fn accept(&self) -> Result<VirtualConn, MuxError> {
        let stream = self.backend.accept_stream().await?;
        Ok(self.wrap(stream))
    }

    async fn close(&self) -> Result<(), MuxError> {
        self.backend.close().await
    }

    async fn closed(&self) {
        self.backend.closed().await
    }

    fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    fn termination(&self) -> Option<String> {
        self.backend.termination()
    }

    fn addr(&self) -> Option<SocketAddr> {
        self.link.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote
    }

    fn limit(&self) -> Limit {
        self.limiter.limit()
    }

    fn set_limit(&self, limit: Limit) {
        self.limiter.set_limit(limit);
    }

    fn num_streams(&self) -> (u64, u64) {
        self.streams.load()
    }

    fn traffic(&self) -> (u64, u64) {
        self.traffic.load()
    }

    fn library(&self) -> Library {
        B::LIBRARY
    }
}

impl<B: Backend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("library", &B::LIBRARY)
            .field("link", &self.link)
            .field("limit", &self.limiter.limit())
            .field("streams", &self.streams.load())
            .field("traffic", &self.traffic.load())
            .finish()
    }
}

/// Build an smux session over an upgraded connection
pub fn new_smux(
    parent: Option<CancellationToken>,
    io: BoxedIo,
    link: Link,
    config: &SmuxConfig,
    role: Role,
) -> Result<Session<SmuxBackend>, MuxError> {
    config.validate()?;
    Ok(Session::from_backend(
        SmuxBackend::new(io, config, role),
        link,
        parent,
    ))
}

/// Build a yamux session over an upgraded connection
pub fn new_yamux(
    parent: Option<CancellationToken>,
    io: BoxedIo,
    link: Link,
    config: &YamuxConfig,
    role: Role,
) -> Result<Session<YamuxBackend>, MuxError> {
    config.validate()?;
    Ok(Session::from_backend(
        YamuxBackend::new(io, config, role),
        link,
        parent,
    ))
}

/// Check the backend tuning `protocol` would be built with
pub fn validate_config(protocol: Protocol, config: &DialConfig) -> Result<(), MuxError> {
    match protocol {
        Protocol::Smux => config.smux.validate()?,
        Protocol::Yamux => config.yamux.validate()?,
    }
    Ok(())
}

/// Build the session for `protocol` and apply the configured initial limit
pub fn new_muxer(
    protocol: Protocol,
    parent: Option<CancellationToken>,
    io: BoxedIo,
    link: Link,
    config: &DialConfig,
    role: Role,
) -> Result<Arc<dyn Muxer>, MuxError> {
    let mux: Arc<dyn Muxer> = match protocol {
        Protocol::Smux => Arc::new(new_smux(parent, io, link, &config.smux, role)?),
        Protocol::Yamux => Arc::new(new_yamux(parent, io, link, &config.yamux, role)?),
    };
    if let Some(bps) = config.limit_bps {
        mux.set_limit(Limit::bps(bps));
    }
    Ok(mux)
}
