//! Protocol error types

use thiserror::Error;

/// Errors that can occur while building tunnel requests
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Protocol name is not one of the recognized backends
    #[error("Unknown multiplexing protocol: {0}")]
    UnknownProtocol(String),

    /// A URL could not be assembled from its parts
    #[error("Invalid tunnel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
