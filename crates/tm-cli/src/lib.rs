//! tunmux CLI library
//!
//! Command implementations and output helpers behind the `tunmux` binary.

pub mod commands;
pub mod output;
