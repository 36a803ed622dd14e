//! Generic dialing through a session

mod common;

use common::{serve, session_pair, Handler};
use tm_core::Dialer;
use tm_mux::{MuxError, MuxOpener, Muxer};
use tm_protocol::host::{resolve_hostname, AGENT_DOMAIN};
use tm_protocol::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_dialer_opens_virtual_connections() {
    let (client, server) = session_pair(Protocol::Yamux);
    serve(server, Handler::Echo);

    let host = resolve_hostname(7, AGENT_DOMAIN);
    let opener = MuxOpener::new(client.clone(), host.clone());
    assert_eq!(opener.host(), "7.agent.ssoc.internal");

    let dialer: &dyn Dialer = &opener;
    let cancel = CancellationToken::new();
    for _ in 0..2 {
        let mut io = dialer.dial(&cancel, "tcp", &format!("{}:80", host)).await.unwrap();
        io.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");
    }

    // every dial is its own stream on the shared session
    assert_eq!(opener.muxer().num_streams().0, 2);
    assert_eq!(client.num_streams().0, 2);
}

#[tokio::test]
async fn test_dial_on_closed_session_fails() {
    let (client, _server) = session_pair(Protocol::Smux);
    let opener = MuxOpener::new(client.clone(), "1.manager.ssoc.internal");
    client.close().await.unwrap();

    assert!(matches!(
        opener.open(&CancellationToken::new()).await,
        Err(MuxError::SessionClosed)
    ));
    let dialed = opener
        .dial(&CancellationToken::new(), "tcp", "1.manager.ssoc.internal:443")
        .await;
    match dialed {
        Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::NotConnected),
        Ok(_) => panic!("dial on a closed session succeeded"),
    }
}
