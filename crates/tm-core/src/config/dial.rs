//! Tunnel dial configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tm_protocol::{Protocol, DEFAULT_TUNNEL_PATH};

use super::backend::{SmuxConfig, YamuxConfig};
use super::backoff::BackoffConfig;
use super::serde_utils::duration_secs;

/// Per-candidate timeout used when none (or zero) is configured
pub const DEFAULT_PER_TIMEOUT: Duration = Duration::from_secs(5);

/// Upgrade scheme used when none is configured
pub const DEFAULT_SCHEME: &str = "wss";

/// Configuration for dialing a tunnel to one of several candidate endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Multiplexing protocol to request (`smux` unless exactly `yamux`)
    pub protocol: Protocol,

    /// Upgrade request path, empty means the well-known tunnel path
    pub path: String,

    /// Upgrade scheme, `wss` or `ws`
    pub scheme: String,

    /// Timeout for a single candidate, covering upgrade and session setup
    #[serde(with = "duration_secs")]
    pub per_timeout: Duration,

    /// Candidate endpoints, tried in order
    pub addresses: Vec<String>,

    /// Initial session rate in bytes/second, absent means unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_bps: Option<f64>,

    /// smux tuning
    pub smux: SmuxConfig,

    /// yamux tuning
    pub yamux: YamuxConfig,

    /// Backoff between whole dial rounds when keeping a tunnel alive
    pub backoff: BackoffConfig,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Smux,
            path: DEFAULT_TUNNEL_PATH.to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            per_timeout: DEFAULT_PER_TIMEOUT,
            addresses: vec![],
            limit_bps: None,
            smux: SmuxConfig::default(),
            yamux: YamuxConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl DialConfig {
    /// Effective per-candidate timeout
    pub fn per_timeout(&self) -> Duration {
        if self.per_timeout.is_zero() {
            DEFAULT_PER_TIMEOUT
        } else {
            self.per_timeout
        }
    }

    /// Effective upgrade path
    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            DEFAULT_TUNNEL_PATH
        } else {
            &self.path
        }
    }

    /// Effective upgrade scheme
    pub fn scheme(&self) -> &str {
        if self.scheme.is_empty() {
            DEFAULT_SCHEME
        } else {
            &self.scheme
        }
    }
}

/// Trim candidates, drop blanks and drop repeats, keeping first-seen order
pub fn deduplicate<S: AsRef<str>>(addresses: &[S]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(addresses.len());
    for addr in addresses {
        let addr = addr.as_ref().trim();
        if addr.is_empty() || unique.iter().any(|seen| seen == addr) {
            continue;
        }
        unique.push(addr.to_string());
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DialConfig::default();
        assert_eq!(config.protocol, Protocol::Smux);
        assert_eq!(config.path(), "/api/v1/tunnel");
        assert_eq!(config.scheme(), "wss");
        assert_eq!(config.per_timeout(), Duration::from_secs(5));
        assert!(config.limit_bps.is_none());
    }

    #[test]
    fn test_zero_and_empty_fall_back() {
        let config = DialConfig {
            path: String::new(),
            scheme: String::new(),
            per_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.path(), DEFAULT_TUNNEL_PATH);
        assert_eq!(config.scheme(), DEFAULT_SCHEME);
        assert_eq!(config.per_timeout(), DEFAULT_PER_TIMEOUT);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DialConfig = toml::from_str(
            r#"
            protocol = "yamux"
            per_timeout = 2
            addresses = ["a:443", "b:443"]
            "#,
        )
        .unwrap();
        assert_eq!(config.protocol, Protocol::Yamux);
        assert_eq!(config.per_timeout(), Duration::from_secs(2));
        assert_eq!(config.path(), DEFAULT_TUNNEL_PATH);
        assert_eq!(config.yamux.max_num_streams, YamuxConfig::default().max_num_streams);
    }

    #[test]
    fn test_unknown_protocol_name_selects_smux() {
        let config: DialConfig = toml::from_str(r#"protocol = "Yamux""#).unwrap();
        assert_eq!(config.protocol, Protocol::Smux);
    }

    #[test]
    fn test_deduplicate() {
        let addrs = deduplicate(&["", " a ", "a", "b", "   ", "b", "c"]);
        assert_eq!(addrs, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deduplicate_all_blank() {
        assert!(deduplicate(&["", "  ", "\t"]).is_empty());
        assert!(deduplicate::<&str>(&[]).is_empty());
    }
}
