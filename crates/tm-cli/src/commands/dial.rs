//! Tunnel client: dial a server, push echo traffic, report the session

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::output::{format_bytes, format_sessions, print_success, print_warning, SessionSummary};
use tm_core::config::DialConfig;
use tm_mux::{ClientHooks, DialError, Limit, MuxDialer, Muxer, TunnelKeeper};
use tm_protocol::Protocol;

/// Command-line overrides applied on top of the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub addresses: Vec<String>,
    pub protocol: Option<String>,
    pub limit: Option<f64>,
    pub plain: bool,
    pub streams: usize,
    pub bytes: usize,
    pub keep: bool,
}

impl DialOptions {
    /// Fold the overrides into `config`
    pub fn apply(&self, mut config: DialConfig) -> DialConfig {
        if !self.addresses.is_empty() {
            config.addresses = self.addresses.clone();
        }
        if let Some(name) = &self.protocol {
            config.protocol = Protocol::select(name);
        }
        if let Some(limit) = self.limit {
            config.limit_bps = Some(limit);
        }
        if self.plain {
            config.scheme = "ws".to_string();
        }
        config
    }
}

/// Dial the configured candidates.
///
/// With `keep` the tunnel is held open and redialed until `cancel` fires.
/// Otherwise every stream echoes `bytes` bytes and the session is reported.
pub async fn dial_command(
    config: DialConfig,
    options: DialOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let config = options.apply(config);
    let dialer = MuxDialer::new(config);

    if options.keep {
        return keep_alive(dialer, cancel).await;
    }

    let mux = dialer.dial_configured(&cancel).await?;
    print_success(&format!(
        "Connected via {} to {}",
        mux.library(),
        mux.remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    ));

    let started = Instant::now();
    let result = exercise(&mux, options.streams.max(1), options.bytes, &cancel).await;
    let elapsed = started.elapsed();

    println!("{}", format_sessions(&[SessionSummary::capture("1", mux.as_ref())]));
    let _ = mux.close().await;

    let echoed = result?;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    print_success(&format!(
        "Echoed {} in {:.2}s ({}/s)",
        format_bytes(echoed),
        secs,
        format_bytes((echoed as f64 / secs) as u64)
    ));
    Ok(())
}

/// Open `streams` streams and round-trip `bytes` bytes over each
async fn exercise(
    mux: &Arc<dyn Muxer>,
    streams: usize,
    bytes: usize,
    cancel: &CancellationToken,
) -> Result<u64> {
    let rounds = (0..streams).map(|index| async move {
        let mut conn = mux
            .open(cancel)
            .await
            .with_context(|| format!("open stream {}", index))?;

        let payload: Vec<u8> = (0..bytes).map(|i| (i + index) as u8).collect();
        let echoed = {
            let (mut reader, mut writer) = tokio::io::split(&mut conn);
            let write = async {
                writer.write_all(&payload).await?;
                writer.flush().await
            };
            let read = async {
                let mut echoed = vec![0u8; payload.len()];
                reader.read_exact(&mut echoed).await?;
                Ok::<_, std::io::Error>(echoed)
            };
            let (written, echoed) = tokio::join!(write, read);
            written.with_context(|| format!("write stream {}", index))?;
            echoed.with_context(|| format!("read stream {}", index))?
        };
        conn.close().await.ok();

        if echoed != payload {
            bail!("stream {} echoed corrupted data", index);
        }
        Ok::<u64, anyhow::Error>(bytes as u64)
    });

    Ok(try_join_all(rounds).await?.into_iter().sum())
}

/// Logs keeper transitions
struct LoggingHooks;

impl ClientHooks for LoggingHooks {
    fn disconnected(&self, mux: &Arc<dyn Muxer>, reason: &str) {
        let (rx, tx) = mux.traffic();
        warn!(
            %reason,
            rx = %format_bytes(rx),
            tx = %format_bytes(tx),
            "tunnel lost, redialing"
        );
    }

    fn reconnected(&self, mux: &Arc<dyn Muxer>) {
        info!(remote = ?mux.remote_addr(), library = %mux.library(), "tunnel restored");
    }

    fn on_exit(&self, err: &DialError) {
        info!("tunnel keeper stopped: {}", err);
    }
}

async fn keep_alive(dialer: MuxDialer, cancel: CancellationToken) -> Result<()> {
    let keeper = Arc::new(TunnelKeeper::new(dialer).with_hooks(Arc::new(LoggingHooks)));

    let mut updates = keeper.subscribe();
    let reporter = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let current = updates.borrow_and_update().clone();
            if let Some(mux) = current {
                let limit = match mux.limit() {
                    Limit::Infinite => "unlimited".to_string(),
                    Limit::Bps(rate) => format!("{}/s", format_bytes(rate as u64)),
                };
                print_success(&format!("Tunnel up via {} (limit {})", mux.library(), limit));
            }
        }
    });

    let err = keeper.connect_and_run(&cancel).await;
    reporter.abort();

    match err {
        DialError::Cancelled => {
            print_warning("Tunnel closed");
            Ok(())
        }
        other => Err(other.into()),
    }
}
