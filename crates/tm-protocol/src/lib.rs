//! tm-protocol: Wire-level constants for tunmux tunnels
//!
//! This crate defines how a tunnel is negotiated on the wire: the
//! multiplexing protocol names carried in the upgrade request, the
//! well-known tunnel path, and the hostnames used to address nodes.

pub mod error;
pub mod host;
pub mod protocol;

pub use error::ProtocolError;
pub use protocol::{tunnel_url, Protocol, DEFAULT_TUNNEL_PATH, PROTOCOL_QUERY_KEY};
