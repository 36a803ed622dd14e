//! Generic network dialing contract

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::io::BoxedIo;

/// Something that can produce a duplex byte stream for a network address.
///
/// HTTP clients and other collaborators take this instead of a concrete
/// transport, so the same code runs over plain TCP or over a tunnel.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `address` on `network` (e.g. `"tcp"`), giving up when `cancel` fires
    async fn dial(
        &self,
        cancel: &CancellationToken,
        network: &str,
        address: &str,
    ) -> std::io::Result<BoxedIo>;
}
