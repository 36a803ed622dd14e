//! Error types for sessions and dialing

use std::io;
use std::time::Duration;

use thiserror::Error;
use tm_core::ConfigError;
use tm_protocol::ProtocolError;

/// Errors raised by a session or one of its virtual connections
#[derive(Error, Debug)]
pub enum MuxError {
    /// The underlying multiplexed session is gone
    #[error("Session closed")]
    SessionClosed,

    /// `close` was called on a connection that was already closed
    #[error("use of closed network connection")]
    AlreadyClosed,

    /// The caller's cancellation token fired first
    #[error("Operation cancelled")]
    Cancelled,

    /// The backend refused to create a stream
    #[error("Failed to open stream: {0}")]
    Open(String),

    /// Backend tuning rejected at session construction
    #[error("Invalid backend config: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => e,
            MuxError::SessionClosed | MuxError::AlreadyClosed => {
                io::Error::new(io::ErrorKind::NotConnected, err)
            }
            MuxError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            MuxError::Open(_) => io::Error::new(io::ErrorKind::ConnectionRefused, err),
            MuxError::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
        }
    }
}

/// Why a single candidate address failed
#[derive(Error, Debug)]
pub enum AttemptFailure {
    /// The upgrade URL could not be built from the address
    #[error("invalid address: {0}")]
    Url(#[from] ProtocolError),

    /// The upgrade handshake failed
    #[error("upgrade failed: {0}")]
    Upgrade(io::Error),

    /// Upgrade plus session setup exceeded the per-candidate timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The upgrade succeeded but no session could be built on it
    #[error("session setup failed: {0}")]
    Session(#[from] MuxError),

    /// The parent token fired during the attempt
    #[error("cancelled")]
    Cancelled,
}

/// One failed candidate
#[derive(Error, Debug)]
#[error("{address}: {source}")]
pub struct AttemptError {
    /// Candidate that was tried
    pub address: String,
    /// Root cause
    #[source]
    pub source: AttemptFailure,
}

/// Errors returned by a failover dial round
#[derive(Error, Debug)]
pub enum DialError {
    /// No non-blank candidate address was supplied
    #[error("no usable tunnel address")]
    NoAddress,

    /// Every candidate failed; one entry per candidate, in dial order
    #[error("all tunnel addresses failed: {}", join_attempts(.0))]
    Attempts(Vec<AttemptError>),

    /// The parent token fired before a session was established
    #[error("tunnel dial cancelled")]
    Cancelled,
}

impl DialError {
    /// Per-candidate failures, empty unless every candidate failed
    pub fn attempts(&self) -> &[AttemptError] {
        match self {
            DialError::Attempts(attempts) => attempts,
            _ => &[],
        }
    }
}

fn join_attempts(attempts: &[AttemptError]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
