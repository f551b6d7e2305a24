//! Collaborators connectors hand connections to.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

/// Emulated service that takes over a connection.
#[async_trait]
pub trait Service: Send + Sync + std::fmt::Debug {
    /// Serve `conn` until it closes or `cancel` fires.
    async fn handle(&self, cancel: CancellationToken, conn: &mut Connection) -> anyhow::Result<()>;
}

/// Forwards a connection to a backing container.
#[async_trait]
pub trait Director: Send + Sync + std::fmt::Debug {
    /// Proxy `conn` to a container until either side closes.
    async fn dial_container(&self, conn: &mut Connection) -> anyhow::Result<()>;
}
