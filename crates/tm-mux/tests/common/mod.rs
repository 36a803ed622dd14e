//! Shared fixtures for tm-mux integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tm_core::config::DialConfig;
use tm_core::{BoxedIo, Link};
use tm_mux::{new_muxer, Muxer, Role, Upgraded, Upgrader};
use tm_protocol::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use url::Url;

pub const PIPE_CAPACITY: usize = 256 * 1024;

/// What the remote end of a session does with accepted streams
#[derive(Debug, Clone, Copy)]
pub enum Handler {
    /// Write back everything received
    Echo,
    /// Read and drop everything
    Discard,
}

/// Client and server sessions joined by an in-memory pipe
pub fn session_pair(protocol: Protocol) -> (Arc<dyn Muxer>, Arc<dyn Muxer>) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let config = DialConfig::default();
    let client = new_muxer(protocol, None, Box::new(a), Link::default(), &config, Role::Client)
        .expect("client session");
    let server = new_muxer(protocol, None, Box::new(b), Link::default(), &config, Role::Server)
        .expect("server session");
    (client, server)
}

/// Serve every stream the session accepts until it closes
pub fn serve(server: Arc<dyn Muxer>, handler: Handler) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(mut conn) = server.accept().await {
            tokio::spawn(async move {
                match handler {
                    Handler::Echo => {
                        let mut buf = vec![0u8; 16 * 1024];
                        loop {
                            let n = match conn.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = conn.flush().await;
                        }
                    }
                    Handler::Discard => {
                        let _ = tokio::io::copy(&mut conn, &mut tokio::io::sink()).await;
                    }
                }
                let _ = conn.close().await;
            });
        }
    })
}

/// How a scripted candidate behaves
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Upgrade fails immediately
    Refuse,
    /// Upgrade never completes
    Hang,
    /// Upgrade succeeds; a server session of the given protocol answers
    Serve(Protocol, Handler),
    /// Upgrade succeeds; the raw far end is kept for inspection
    Raw,
}

/// Upgrader whose candidates follow a script, recording every attempt
#[derive(Default)]
pub struct ScriptedUpgrader {
    scripts: HashMap<String, Script>,
    attempts: Mutex<Vec<String>>,
    servers: Mutex<Vec<Arc<dyn Muxer>>>,
    raw: Mutex<Vec<DuplexStream>>,
}

impl ScriptedUpgrader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, host: &str, script: Script) -> Self {
        self.scripts.insert(host.to_string(), script);
        self
    }

    /// Hosts contacted, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Server sessions created for successful upgrades
    pub fn servers(&self) -> Vec<Arc<dyn Muxer>> {
        self.servers.lock().clone()
    }

    /// Far ends of `Script::Raw` upgrades
    pub fn take_raw(&self) -> Vec<DuplexStream> {
        std::mem::take(&mut *self.raw.lock())
    }
}

#[async_trait]
impl Upgrader for ScriptedUpgrader {
    async fn upgrade(&self, url: &Url) -> io::Result<Upgraded> {
        let host = url.host_str().unwrap_or_default().to_string();
        self.attempts.lock().push(host.clone());

        let script = self.scripts.get(&host).copied().unwrap_or(Script::Refuse);
        match script {
            Script::Refuse => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", host),
            )),
            Script::Hang => std::future::pending().await,
            Script::Serve(protocol, handler) => {
                let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
                let server = new_muxer(
                    protocol,
                    None,
                    Box::new(b),
                    Link::default(),
                    &DialConfig::default(),
                    Role::Server,
                )
                .map_err(io::Error::from)?;
                serve(Arc::clone(&server), handler);
                self.servers.lock().push(server);
                Ok(Upgraded {
                    io: Box::new(a) as BoxedIo,
                    link: Link::default(),
                })
            }
            Script::Raw => {
                let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
                self.raw.lock().push(b);
                Ok(Upgraded {
                    io: Box::new(a),
                    link: Link::default(),
                })
            }
        }
    }
}

/// Dial config for scripted tests
pub fn dial_config(protocol: Protocol) -> DialConfig {
    DialConfig {
        protocol,
        scheme: "ws".to_string(),
        ..Default::default()
    }
}
