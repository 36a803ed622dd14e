//! Node hostnames inside the tunnel network
//!
//! Nodes are addressed by `<numeric id>.<role domain>`. These names only
//! resolve through an established tunnel; they are never looked up in DNS.

use url::Url;

use crate::error::ProtocolError;

/// Domain under which agents are addressed
pub const AGENT_DOMAIN: &str = "agent.ssoc.internal";

/// Domain of the (single) manager
pub const MANAGER_DOMAIN: &str = "manager.ssoc.internal";

/// Domain under which brokers are addressed
pub const BROKER_DOMAIN: &str = "broker.ssoc.internal";

/// Build `<id>.<domain>`
pub fn resolve_hostname(id: i64, domain: &str) -> String {
    format!("{}.{}", id, domain)
}

/// URL of an agent, as seen from a manager or broker
pub fn agent_url(agent_id: i64, path: &str, websocket: bool) -> Result<Url, ProtocolError> {
    build_url(&resolve_hostname(agent_id, AGENT_DOMAIN), path, websocket)
}

/// URL of the manager
pub fn manager_url(path: &str, websocket: bool) -> Result<Url, ProtocolError> {
    build_url(MANAGER_DOMAIN, path, websocket)
}

/// URL of a specific broker, as seen from the manager
pub fn server_to_broker_url(
    broker_id: i64,
    path: &str,
    websocket: bool,
) -> Result<Url, ProtocolError> {
    build_url(&resolve_hostname(broker_id, BROKER_DOMAIN), path, websocket)
}

/// URL of the broker an agent is attached to
pub fn agent_to_broker_url(path: &str, websocket: bool) -> Result<Url, ProtocolError> {
    build_url(BROKER_DOMAIN, path, websocket)
}

// Traffic inside the tunnel is already encrypted, so only plain schemes are used.
fn build_url(host: &str, path: &str, websocket: bool) -> Result<Url, ProtocolError> {
    let scheme = if websocket { "ws" } else { "http" };
    let mut url = Url::parse(&format!("{}://{}", scheme, host))?;
    url.set_path(path);
    Ok(url)
}
