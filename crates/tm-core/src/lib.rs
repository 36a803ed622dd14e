//! tm-core: Core abstractions and configuration for tunmux
//!
//! This crate provides the shared I/O aliases, dialing contract, and
//! configuration structures used by the multiplexing core and the CLI.

pub mod config;
pub mod error;
pub mod io;
pub mod traits;

pub use error::ConfigError;
pub use io::{outbound_ip, AsyncIo, BoxedIo, Link};
pub use traits::Dialer;
