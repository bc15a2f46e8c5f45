//! Topics and events carried on the router's correlation bus

use std::sync::Arc;

use super::transport_manager::ConnId;
use crate::core_bus::EventBus;
use crate::core_cell::{Cell, CellType, CircuitId, RawCell, RelayCommand, StreamId};

/// Identifies which reply a waiter is interested in.
///
/// Circuit numbers are only unique per connection, so the connection is
/// always part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub conn: ConnId,
    pub circuit: Option<CircuitId>,
    pub stream: Option<StreamId>,
}

impl CorrelationKey {
    pub fn conn(conn: ConnId) -> Self {
        Self {
            conn,
            circuit: None,
            stream: None,
        }
    }

    pub fn circuit(conn: ConnId, circuit: CircuitId) -> Self {
        Self {
            conn,
            circuit: Some(circuit),
            stream: None,
        }
    }

    pub fn stream(conn: ConnId, circuit: CircuitId, stream: StreamId) -> Self {
        Self {
            conn,
            circuit: Some(circuit),
            stream: Some(stream),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every decoded cell
    AnyCell,
    /// Every cell of one type
    Kind(CellType),
    /// A non-relay cell correlated to a connection and/or circuit
    Keyed(CellType, CorrelationKey),
    /// A relay cell correlated by subcommand, circuit and optionally stream
    Relay(RelayCommand, CorrelationKey),
    /// The entry circuit is usable
    ReadyToSend,
    /// The entry circuit went away
    NotReadyToSend,
    /// We answered an inbound OPEN; the connection is ours to use (odd side)
    OpenedSent,
}

/// A decoded cell together with the exact bytes it arrived as
#[derive(Debug, Clone)]
pub struct InboundCell {
    pub conn: ConnId,
    pub cell: Cell,
    pub raw: RawCell,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Cell(Arc<InboundCell>),
    ReadyToSend,
    NotReadyToSend,
    OpenedSent(ConnId),
}

impl BusEvent {
    pub fn cell(&self) -> Option<&InboundCell> {
        match self {
            BusEvent::Cell(inbound) => Some(inbound),
            _ => None,
        }
    }
}

pub type RouterBus = EventBus<Topic, BusEvent>;
