//! CLI command implementations

mod config;
mod dial;
mod serve;

pub use config::{config_get, config_init, config_set, config_show, resolve_config};
pub use dial::{dial_command, DialOptions};
pub use serve::{serve_command, SessionRegistry};
