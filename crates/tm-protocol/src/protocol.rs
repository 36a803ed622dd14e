//! Multiplexing protocol selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::ProtocolError;

/// Path requested when a tunnel configuration does not name one
pub const DEFAULT_TUNNEL_PATH: &str = "/api/v1/tunnel";

/// Query parameter carrying the requested multiplexing protocol
pub const PROTOCOL_QUERY_KEY: &str = "protocol";

/// Stream-multiplexing wire protocol spoken inside an upgraded tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    /// smux framing (default)
    #[default]
    Smux,
    /// yamux framing
    Yamux,
}

impl Protocol {
    /// Select a protocol from a free-form name.
    ///
    /// Only an exact, case-sensitive `"yamux"` selects yamux. Everything
    /// else, including the empty string, falls back to smux.
    pub fn select(name: &str) -> Self {
        if name == "yamux" {
            Protocol::Yamux
        } else {
            Protocol::Smux
        }
    }

    /// Select the protocol named by an upgrade request's query string
    pub fn from_query(query: Option<&str>) -> Self {
        let Some(query) = query else {
            return Protocol::Smux;
        };

        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == PROTOCOL_QUERY_KEY)
            .map(|(_, value)| Protocol::select(&value))
            .unwrap_or_default()
    }

    /// Wire name of the protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Smux => "smux",
            Protocol::Yamux => "yamux",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    /// Strict parse, used where an operator typed the name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smux" => Ok(Protocol::Smux),
            "yamux" => Ok(Protocol::Yamux),
            other => Err(ProtocolError::UnknownProtocol(other.to_string())),
        }
    }
}

impl From<String> for Protocol {
    fn from(name: String) -> Self {
        Protocol::select(&name)
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

/// Build the upgrade target `scheme://address/path?protocol=<name>`.
///
/// An empty `path` is replaced by [`DEFAULT_TUNNEL_PATH`].
pub fn tunnel_url(
    scheme: &str,
    address: &str,
    path: &str,
    protocol: Protocol,
) -> Result<Url, ProtocolError> {
    let mut url = Url::parse(&format!("{}://{}", scheme, address))?;
    url.set_path(if path.is_empty() { DEFAULT_TUNNEL_PATH } else { path });
    url.query_pairs_mut()
        .append_pair(PROTOCOL_QUERY_KEY, protocol.as_str());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_is_case_sensitive() {
        assert_eq!(Protocol::select("yamux"), Protocol::Yamux);
        assert_eq!(Protocol::select("YAMUX"), Protocol::Smux);
        assert_eq!(Protocol::select("Yamux"), Protocol::Smux);
        assert_eq!(Protocol::select(""), Protocol::Smux);
        assert_eq!(Protocol::select("quic"), Protocol::Smux);
    }

    #[test]
    fn test_strict_parse() {
        assert_eq!("yamux".parse::<Protocol>().unwrap(), Protocol::Yamux);
        assert!(matches!(
            "h2".parse::<Protocol>(),
            Err(ProtocolError::UnknownProtocol(name)) if name == "h2"
        ));
    }

    #[test]
    fn test_from_query() {
        assert_eq!(Protocol::from_query(None), Protocol::Smux);
        assert_eq!(Protocol::from_query(Some("protocol=yamux")), Protocol::Yamux);
        assert_eq!(
            Protocol::from_query(Some("x=1&protocol=yamux&y=2")),
            Protocol::Yamux
        );
        assert_eq!(Protocol::from_query(Some("protocol=smux")), Protocol::Smux);
        assert_eq!(Protocol::from_query(Some("other=yamux")), Protocol::Smux);
    }

    #[test]
    fn test_tunnel_url_default_path() {
        let url = tunnel_url("wss", "broker.example:8443", "", Protocol::Smux).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://broker.example:8443/api/v1/tunnel?protocol=smux"
        );
    }

    #[test]
    fn test_tunnel_url_custom_path() {
        let url = tunnel_url("ws", "10.0.0.1:8080", "/custom", Protocol::Yamux).unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.1:8080/custom?protocol=yamux");

        // the scheme's default port is elided
        let url = tunnel_url("ws", "10.0.0.1:80", "/custom", Protocol::Yamux).unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.1/custom?protocol=yamux");
    }

    #[test]
    fn test_serde_is_lenient() {
        let p: Protocol = serde_json::from_str(r#""yamux""#).unwrap();
        assert_eq!(p, Protocol::Yamux);
        let p: Protocol = serde_json::from_str(r#""anything""#).unwrap();
        assert_eq!(p, Protocol::Smux);
        assert_eq!(serde_json::to_string(&Protocol::Yamux).unwrap(), r#""yamux""#);
    }
}
