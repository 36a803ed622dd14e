//! Tuning for the two multiplexing backends

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// smux session tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuxConfig {
    /// Keep-alive ping interval, zero disables pings
    #[serde(with = "duration_secs")]
    pub keep_alive_interval: Duration,

    /// Session idle timeout, zero disables it
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Frames queued for sending before writers are back-pressured
    pub max_tx_queue: usize,

    /// Frames queued per stream before the reader is back-pressured
    pub max_rx_queue: usize,
}

impl Default for SmuxConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            max_tx_queue: 1024,
            max_rx_queue: 1024,
        }
    }
}

impl SmuxConfig {
    /// Reject values the backend cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tx_queue == 0 || self.max_rx_queue == 0 {
            return Err(ConfigError::Invalid(
                "smux queue sizes must be non-zero".to_string(),
            ));
        }
        if !self.idle_timeout.is_zero()
            && !self.keep_alive_interval.is_zero()
            && self.idle_timeout <= self.keep_alive_interval
        {
            return Err(ConfigError::Invalid(format!(
                "smux idle timeout {:?} must exceed keep-alive interval {:?}",
                self.idle_timeout, self.keep_alive_interval
            )));
        }
        Ok(())
    }
}

/// yamux session tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YamuxConfig {
    /// Maximum concurrently open streams
    pub max_num_streams: usize,

    /// Largest data frame sent in one piece
    pub split_send_size: usize,

    /// Inbound streams queued for `accept` before new ones are reset
    pub accept_backlog: usize,
}

impl Default for YamuxConfig {
    fn default() -> Self {
        Self {
            max_num_streams: 512,
            split_send_size: 16 * 1024,
            accept_backlog: 256,
        }
    }
}

impl YamuxConfig {
    /// Reject values the backend cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_streams == 0 || self.split_send_size == 0 || self.accept_backlog == 0 {
            return Err(ConfigError::Invalid(
                "yamux stream limit, split size and accept backlog must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
