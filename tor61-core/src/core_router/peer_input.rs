//! Peer input dispatcher
//!
//! Decodes frames read from peer connections and republishes them on the bus
//! under a generic topic, a per-type topic and the correlation keys that
//! pending waiters use.

use std::sync::Arc;

use tracing::{trace, warn};

use super::events::{BusEvent, CorrelationKey, InboundCell, RouterBus, Topic};
use super::metrics;
use super::transport_manager::ConnId;
use crate::core_cell::{Cell, CellError, CellType, RawCell};

#[derive(Clone)]
pub struct PeerInput {
    bus: RouterBus,
}

impl PeerInput {
    pub fn new(bus: RouterBus) -> Self {
        Self { bus }
    }

    /// Decode one frame from `conn` and publish it.
    ///
    /// Malformed frames are logged, counted and dropped; the error is returned
    /// for the caller's information only.
    pub fn dispatch(&self, conn: ConnId, frame: &RawCell) -> Result<CellType, CellError> {
        let cell = match Cell::decode(frame) {
            Ok(cell) => cell,
            Err(e) => {
                warn!(%conn, error = %e, "dropping malformed frame");
                metrics::malformed_cell();
                return Err(e);
            }
        };

        let kind = cell.cell_type();
        let circuit = cell.circuit();
        trace!(%conn, circuit, kind = %kind, "cell received");
        metrics::cell_received(kind.as_str());

        let keyed = match &cell {
            Cell::Create { .. }
            | Cell::Created { .. }
            | Cell::CreateFailed { .. }
            | Cell::Destroy { .. } => vec![Topic::Keyed(kind, CorrelationKey::circuit(conn, circuit))],
            Cell::Opened { .. } | Cell::OpenFailed { .. } => {
                vec![Topic::Keyed(kind, CorrelationKey::conn(conn))]
            }
            Cell::Open { .. } => Vec::new(),
            Cell::Relay(relay) => vec![
                Topic::Relay(relay.command(), CorrelationKey::circuit(conn, circuit)),
                Topic::Relay(
                    relay.command(),
                    CorrelationKey::stream(conn, circuit, relay.stream),
                ),
            ],
        };

        let event = BusEvent::Cell(Arc::new(InboundCell {
            conn,
            cell,
            raw: *frame,
        }));

        self.bus.publish(Topic::AnyCell, event.clone());
        self.bus.publish(Topic::Kind(kind), event.clone());
        for topic in keyed {
            self.bus.publish(topic, event.clone());
        }

        Ok(kind)
    }
}
