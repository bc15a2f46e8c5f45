//! Tor61 cell format
//!
//! Fixed-size 512 byte frames exchanged between routers, plus the helpers the
//! forwarding path needs to work on raw frames without a full decode.

mod cell;
mod error;

pub use cell::{
    circuit_of, data_cells, rewrite_circuit, AgentId, Cell, CellType, CircuitId, RawCell,
    RelayCell, RelayCommand, RelayPayload, StreamId, CELL_SIZE, MAX_RELAY_BODY,
    RELAY_HEADER_SIZE,
};
pub use error::CellError;
