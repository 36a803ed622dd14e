//! Websocket upgrade of a TCP connection into a tunnel byte stream
//!
//! The client half ([`WsUpgrader`]) dials `scheme://address/path?protocol=..`
//! and the server half ([`accept_upgrade`]) answers it, reading the
//! requested protocol from the query. Both return the websocket as a plain
//! duplex stream: binary messages carry the multiplexed frames.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use tm_core::{BoxedIo, Link};
use tm_protocol::{Protocol, DEFAULT_TUNNEL_PATH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, client_async_tls_with_config, Connector, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::tls::insecure_client_config;

/// An upgraded connection and the addresses of its TCP link
pub struct Upgraded {
    /// The upgraded duplex stream
    pub io: BoxedIo,
    /// Addresses of the physical connection
    pub link: Link,
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded").field("link", &self.link).finish()
    }
}

/// Performs the client half of the tunnel upgrade
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Connect to `url` and upgrade the connection to a tunnel stream
    async fn upgrade(&self, url: &Url) -> io::Result<Upgraded>;
}

enum TlsMode {
    Insecure,
    Config(Arc<ClientConfig>),
}

/// Websocket upgrader over TCP, with rustls for `wss`
pub struct WsUpgrader {
    tls: TlsMode,
}

impl WsUpgrader {
    /// Upgrader that accepts any server certificate
    pub fn insecure() -> Self {
        Self {
            tls: TlsMode::Insecure,
        }
    }

    /// Upgrader using a caller-provided TLS client config
    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsMode::Config(config),
        }
    }

    fn connector(&self, url: &Url) -> io::Result<Connector> {
        if url.scheme() != "wss" {
            return Ok(Connector::Plain);
        }
        let config = match &self.tls {
            TlsMode::Config(config) => Arc::clone(config),
            TlsMode::Insecure => Arc::new(
                insecure_client_config().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            ),
        };
        Ok(Connector::Rustls(config))
    }
}

impl Default for WsUpgrader {
    fn default() -> Self {
        Self::insecure()
    }
}

#[async_trait]
impl Upgrader for WsUpgrader {
    async fn upgrade(&self, url: &Url) -> io::Result<Upgraded> {
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "tunnel url has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "tunnel url has no port"))?;

        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let link = Link {
            local: tcp.local_addr().ok(),
            remote: tcp.peer_addr().ok(),
        };

        let connector = self.connector(url)?;
        let (ws, response) = client_async_tls_with_config(url.as_str(), tcp, None, Some(connector))
            .await
            .map_err(ws_error)?;
        debug!(url = %url, status = %response.status(), "tunnel upgraded");

        Ok(Upgraded {
            io: Box::new(WsIo::new(ws)),
            link,
        })
    }
}

/// Answer a tunnel upgrade on an accepted TCP connection.
///
/// Requests for any path other than `path` (empty means the default tunnel
/// path) are refused with 404. Returns the upgraded stream and the protocol
/// the client asked for.
pub async fn accept_upgrade(tcp: TcpStream, path: &str) -> io::Result<(Upgraded, Protocol)> {
    let expected = if path.is_empty() {
        DEFAULT_TUNNEL_PATH
    } else {
        path
    };
    tcp.set_nodelay(true)?;
    let link = Link {
        local: tcp.local_addr().ok(),
        remote: tcp.peer_addr().ok(),
    };

    let mut protocol = Protocol::default();
    let ws = accept_hdr_async(tcp, |request: &Request, response: Response| {
        if request.uri().path() != expected {
            let mut refusal = ErrorResponse::new(Some("unknown tunnel path".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        protocol = Protocol::from_query(request.uri().query());
        Ok(response)
    })
    .await
    .map_err(ws_error)?;

    debug!(remote = ?link.remote, %protocol, "tunnel upgrade accepted");
    Ok((
        Upgraded {
            io: Box::new(WsIo::new(ws)),
            link,
        },
        protocol,
    ))
}

fn ws_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// A websocket seen as a byte stream
struct WsIo<S> {
    ws: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsIo<S> {
    fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            pending: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(this.ws.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.pending = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "websocket closed by peer");
                    return Poll::Ready(Ok(()));
                }
                // control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_error(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        ready!(this.ws.poll_ready_unpin(cx)).map_err(ws_error)?;
        this.ws
            .start_send_unpin(Message::Binary(buf.to_vec()))
            .map_err(ws_error)?;
        // Push the frame out now; a blocked socket is retried on the next call.
        if let Poll::Ready(Err(e)) = this.ws.poll_flush_unpin(cx) {
            return Poll::Ready(Err(ws_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().ws.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().ws.poll_close_unpin(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_error(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tm_protocol::tunnel_url;

    #[tokio::test]
    async fn test_loopback_upgrade_carries_bytes_and_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut upgraded, protocol) = accept_upgrade(tcp, "").await.unwrap();
            let mut buf = [0u8; 5];
            upgraded.io.read_exact(&mut buf).await.unwrap();
            upgraded.io.write_all(&buf).await.unwrap();
            upgraded.io.flush().await.unwrap();
            protocol
        });

        let url = tunnel_url("ws", &addr.to_string(), "", Protocol::Yamux).unwrap();
        let mut upgraded = WsUpgrader::insecure().upgrade(&url).await.unwrap();
        assert_eq!(upgraded.link.remote, Some(addr));

        upgraded.io.write_all(b"hello").await.unwrap();
        upgraded.io.flush().await.unwrap();
        let mut echoed = [0u8; 5];
        upgraded.io.read_exact(&mut echoed).await.unwrap();

        assert_eq!(&echoed, b"hello");
        assert_eq!(server.await.unwrap(), Protocol::Yamux);
    }

    #[tokio::test]
    async fn test_wrong_path_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_upgrade(tcp, "/api/v1/tunnel").await.is_err()
        });

        let url = tunnel_url("ws", &addr.to_string(), "/elsewhere", Protocol::Smux).unwrap();
        assert!(WsUpgrader::insecure().upgrade(&url).await.is_err());
        assert!(server.await.unwrap());
    }
}
