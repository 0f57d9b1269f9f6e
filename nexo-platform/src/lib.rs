//! Messaging-platform plumbing for nexo.
//!
//! Connectors are pure I/O: they open one platform connection per tenant,
//! surface its lifecycle as `ConnectionEvent`s, and expose a send primitive.

mod bridge;
mod traits;
mod types;

pub use bridge::WhatsAppBridgeConnector;
pub use traits::{PlatformConnection, PlatformConnector};
pub use types::{
    ConnectionEvent, InboundMessage, MessageId, OutboundMessage, SenderId, TenantId,
};
