//! Tunnel server: accept websocket upgrades and echo every stream

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::output::{format_bytes, format_sessions, print_info, SessionSummary};
use tm_core::config::DialConfig;
use tm_mux::{accept_upgrade, new_muxer, Muxer, Role, VirtualConn};

/// Live server-side sessions keyed by accept order
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: DashMap<u64, Arc<dyn Muxer>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, mux: Arc<dyn Muxer>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(id, mux);
        id
    }

    fn remove(&self, id: u64) -> Option<Arc<dyn Muxer>> {
        self.sessions.remove(&id).map(|(_, mux)| mux)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot every live session, ordered by id
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<(u64, SessionSummary)> = self
            .sessions
            .iter()
            .map(|entry| {
                let id = *entry.key();
                (id, SessionSummary::capture(id.to_string(), entry.value().as_ref()))
            })
            .collect();
        summaries.sort_by_key(|(id, _)| *id);
        summaries.into_iter().map(|(_, s)| s).collect()
    }

    /// Close every live session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<dyn Muxer>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for mux in sessions {
            let _ = mux.close().await;
        }
    }
}

/// Run the tunnel server until `cancel` fires
pub async fn serve_command(
    bind: String,
    config: DialConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let local = listener.local_addr()?;

    print_info(&format!("Serving tunnels on ws://{}{}", local, config.path()));
    info!(%local, path = %config.path(), "tunnel server listening");

    let registry = Arc::new(SessionRegistry::new());
    let config = Arc::new(config);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tunnel server shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (tcp, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_tunnel(tcp, peer, &config, &registry, cancel).await {
                        warn!(%peer, "tunnel failed: {:#}", e);
                    }
                });
            }
        }
    }

    if !registry.is_empty() {
        println!("{}", format_sessions(&registry.summaries()));
    }
    registry.close_all().await;
    Ok(())
}

async fn handle_tunnel(
    tcp: TcpStream,
    peer: SocketAddr,
    config: &DialConfig,
    registry: &SessionRegistry,
    cancel: CancellationToken,
) -> Result<()> {
    let (upgraded, protocol) = accept_upgrade(tcp, config.path())
        .await
        .context("upgrade refused")?;
    let mux = new_muxer(
        protocol,
        Some(cancel.clone()),
        upgraded.io,
        upgraded.link,
        config,
        Role::Server,
    )?;

    let id = registry.register(Arc::clone(&mux));
    info!(id, %peer, library = %mux.library(), "tunnel session established");

    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = mux.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(id, "session ended: {}", e);
                    break;
                }
            },
        };
        tokio::spawn(echo(conn));
    }

    if let Some(mux) = registry.remove(id) {
        let (rx, tx) = mux.traffic();
        let (total, _) = mux.num_streams();
        info!(
            id,
            streams = total,
            rx = %format_bytes(rx),
            tx = %format_bytes(tx),
            "tunnel session closed"
        );
        let _ = mux.close().await;
    }
    Ok(())
}

async fn echo(mut conn: VirtualConn) {
    let copied = {
        let (mut reader, mut writer) = tokio::io::split(&mut conn);
        tokio::io::copy(&mut reader, &mut writer).await
    };
    if let Err(e) = copied {
        debug!("echo stream ended: {}", e);
    }
    let _ = conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_protocol::Protocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serve_echoes_and_tracks_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_command(
            address.clone(),
            DialConfig::default(),
            cancel.clone(),
        ));

        let config = DialConfig {
            protocol: Protocol::Yamux,
            scheme: "ws".into(),
            ..Default::default()
        };
        let dialer = tm_mux::MuxDialer::new(config);
        let mux = loop {
            match dialer.dial(&CancellationToken::new(), &[address.as_str()]).await {
                Ok(mux) => break mux,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        };

        let mut conn = mux.open(&CancellationToken::new()).await.unwrap();
        conn.write_all(b"tunnel").await.unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registry_orders_summaries() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (near, far) = tokio::io::duplex(64 * 1024);
            let config = DialConfig::default();
            let server = new_muxer(
                Protocol::Smux,
                None,
                Box::new(near),
                Default::default(),
                &config,
                Role::Server,
            )
            .unwrap();
            peers.push(far);
            registry.register(server);
        }

        let ids: Vec<String> = registry.summaries().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let removed = registry.remove(2).unwrap();
        assert_eq!(removed.library().name, "smux");
        assert_eq!(registry.len(), 2);

        registry.close_all().await;
        assert!(registry.summaries().iter().all(|s| s.streams == (0, 0)));
    }
}
