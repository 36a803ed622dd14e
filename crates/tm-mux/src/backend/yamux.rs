//! yamux backend over the `yamux` crate
//!
//! `yamux::Connection` is poll-driven and must be polled continuously for
//! any stream to make progress, so it lives in a driver task. The session
//! talks to the driver over a command channel; inbound streams arrive on a
//! bounded queue sized by the accept backlog.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::Poll;

use ::yamux::{Config, Connection, ConnectionError, Mode, Stream};
use async_trait::async_trait;
use tm_core::config::YamuxConfig;
use tm_core::BoxedIo;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Backend, Termination, CLOSED_BY_PEER, CLOSED_LOCALLY};
use crate::error::MuxError;
use crate::muxer::{Library, Role};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

type OpenReply = oneshot::Sender<Result<Stream, MuxError>>;

enum Command {
    Open(OpenReply),
    Close(oneshot::Sender<()>),
}

enum Exit {
    Close(Option<oneshot::Sender<()>>),
    Ended,
    Failed(ConnectionError),
}

/// Handle to a yamux connection running in its driver task
pub struct YamuxBackend {
    commands: mpsc::Sender<Command>,
    inbound: Mutex<mpsc::Receiver<Stream>>,
    done: CancellationToken,
    termination: Termination,
}

impl YamuxBackend {
    /// Start a yamux connection for `role` over `io`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(io: BoxedIo, config: &YamuxConfig, role: Role) -> Self {
        let mut cfg = Config::default();
        cfg.set_max_num_streams(config.max_num_streams);
        cfg.set_split_send_size(config.split_send_size);

        let mode = match role {
            Role::Client => Mode::Client,
            Role::Server => Mode::Server,
        };
        let connection = Connection::new(io.compat(), cfg, mode);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.accept_backlog.max(1));
        let done = CancellationToken::new();
        let termination = Termination::default();

        tokio::spawn(drive(
            connection,
            commands_rx,
            inbound_tx,
            done.clone(),
            termination.clone(),
        ));

        Self {
            commands: commands_tx,
            inbound: Mutex::new(inbound_rx),
            done,
            termination,
        }
    }
}

async fn drive<T>(
    mut connection: Connection<T>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Stream>,
    done: CancellationToken,
    termination: Termination,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let _guard = done.clone().drop_guard();
    let mut pending: VecDeque<OpenReply> = VecDeque::new();

    let exit = poll_fn(|cx| {
        loop {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => pending.push_back(reply),
                Poll::Ready(Some(Command::Close(reply))) => {
                    return Poll::Ready(Exit::Close(Some(reply)))
                }
                // every session handle is gone
                Poll::Ready(None) => return Poll::Ready(Exit::Close(None)),
                Poll::Pending => break,
            }
        }

        while !pending.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(result) => {
                    let result = result.map_err(|e| MuxError::Open(e.to_string()));
                    if let Some(reply) = pending.pop_front() {
                        // the opener may have given up; the stream is dropped then
                        let _ = reply.send(result);
                    }
                }
                Poll::Pending => break,
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound.try_send(stream).is_err() {
                        warn!("yamux accept backlog full, dropping inbound stream");
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Exit::Failed(e)),
                Poll::Ready(None) => return Poll::Ready(Exit::Ended),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    // Pending openers see their reply channel dropped and report SessionClosed.
    drop(pending);
    drop(inbound);

    match exit {
        Exit::Close(reply) => {
            termination.record(CLOSED_LOCALLY);
            if let Err(e) = poll_fn(|cx| connection.poll_close(cx)).await {
                debug!(error = %e, "yamux close failed");
            }
            done.cancel();
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        Exit::Ended => {
            termination.record(CLOSED_BY_PEER);
            debug!("yamux session ended by peer");
        }
        Exit::Failed(e) => {
            warn!(error = %e, "yamux session failed");
            termination.record(e.to_string());
        }
    }
}

#[async_trait]
impl Backend for YamuxBackend {
    const LIBRARY: Library = Library {
        name: "yamux",
        module: "yamux",
    };

    async fn open_stream(&self) -> Result<BoxedIo, MuxError> {
        if self.done.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Open(reply))
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        let stream = response.await.map_err(|_| MuxError::SessionClosed)??;
        Ok(Box::new(stream.compat()))
    }

    async fn accept_stream(&self) -> Result<BoxedIo, MuxError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(stream) => Ok(Box::new(stream.compat())),
            None => Err(MuxError::SessionClosed),
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        if self.done.is_cancelled() {
            return Err(MuxError::SessionClosed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Close(reply))
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        // the driver is gone without acknowledging: someone else closed it
        response.await.map_err(|_| MuxError::SessionClosed)
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
