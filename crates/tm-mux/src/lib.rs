//! tm-mux: Multiplexed tunnel sessions
//!
//! Turns one upgraded duplex connection into a [`Muxer`]: a session that
//! opens and accepts any number of [`VirtualConn`] streams over the single
//! physical link. Two wire protocols (smux and yamux) sit behind the same
//! interface. Every session carries a shared byte-rate limiter and live
//! traffic/stream counters, and [`MuxDialer`] fails over across candidate
//! endpoints until one yields a session.

pub mod backend;
pub mod backoff;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod keeper;
pub mod limiter;
pub mod muxer;
pub mod opener;
pub mod session;
pub mod stats;
mod tls;
pub mod upgrade;

pub use conn::{CloseHandle, VirtualConn};
pub use dialer::MuxDialer;
pub use error::{AttemptError, AttemptFailure, DialError, MuxError};
pub use keeper::{ClientHooks, TunnelKeeper};
pub use limiter::Limit;
pub use muxer::{Library, Muxer, Role};
pub use opener::MuxOpener;
pub use session::{new_muxer, new_smux, new_yamux, validate_config, Session};
pub use upgrade::{accept_upgrade, Upgraded, Upgrader, WsUpgrader};
