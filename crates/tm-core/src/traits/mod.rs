//! Core trait definitions

mod dialer;

pub use dialer::Dialer;
