use crate::types::{ConnectionEvent, OutboundMessage, SenderId, TenantId};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Send half of a live tenant connection.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Send a message to a specific end-user on this tenant's connection.
    async fn send(&self, recipient: &SenderId, message: OutboundMessage) -> Result<()>;
}

/// Opens platform connections, one per tenant.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Begin the platform handshake for `tenant` and deliver lifecycle and
    /// message events on `events` out of band. Returns the send half
    /// immediately; callers must not block on the connection reaching ready.
    async fn connect(
        &self,
        tenant: &TenantId,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn PlatformConnection>>;
}
