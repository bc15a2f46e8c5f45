//! Peer links: the transport seam used by routing and circuit management

use std::sync::Arc;

use async_trait::async_trait;

use super::error::RouterError;
use super::transport_manager::{ConnId, EventSink, FrameMode, TransportManager};

/// Cell-carrying connections to other routers
#[async_trait]
pub trait CellTransport: Send + Sync {
    /// Open a connection whose inbound bytes are framed into cells.
    async fn connect(&self, host: &str, port: u16) -> Result<ConnId, RouterError>;

    async fn write(&self, conn: ConnId, bytes: &[u8]) -> Result<(), RouterError>;

    async fn close(&self, conn: ConnId);
}

/// [`CellTransport`] over the node's [`TransportManager`]
///
/// Every link it opens reports into the node's peer event sink.
pub struct PeerLinks {
    transport: Arc<TransportManager>,
    events: EventSink,
}

impl PeerLinks {
    pub fn new(transport: Arc<TransportManager>, events: EventSink) -> Self {
        Self { transport, events }
    }
}

#[async_trait]
impl CellTransport for PeerLinks {
    async fn connect(&self, host: &str, port: u16) -> Result<ConnId, RouterError> {
        self.transport
            .connect(host, port, FrameMode::Cells, self.events.clone())
            .await
    }

    async fn write(&self, conn: ConnId, bytes: &[u8]) -> Result<(), RouterError> {
        self.transport.write(conn, bytes).await
    }

    async fn close(&self, conn: ConnId) {
        self.transport.close(conn).await
    }
}
