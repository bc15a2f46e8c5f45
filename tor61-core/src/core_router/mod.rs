//! Tor61 router core: links, routing, circuits and the node that wires them

pub mod circuit_manager;
pub mod circuit_numbers;
mod error;
pub mod events;
mod links;
pub mod metrics;
mod peer_input;
mod route_table;
pub mod router_node;
pub mod routing;
mod stream_ids;
pub mod transport_manager;

pub use circuit_manager::{CircuitDeps, CircuitManager, CircuitState, EntryCircuit, RebuildReason};
pub use circuit_numbers::{AllocatorFactory, CircuitNumbers, ConnectionBook, Parity};
pub use error::RouterError;
pub use events::{BusEvent, CorrelationKey, InboundCell, RouterBus, Topic};
pub use links::{CellTransport, PeerLinks};
pub use peer_input::PeerInput;
pub use route_table::{ForwardingTable, Hop};
pub use router_node::RouterNode;
pub use routing::{CellSink, RouteDecision, RoutingEngine};
pub use stream_ids::StreamIds;
pub use transport_manager::{ConnId, EventSink, FrameMode, ListenerId, TransportEvent, TransportManager};
