//! Test utilities shared by the unit tests
//!
//! An in-memory [`CellTransport`](crate::core_router::CellTransport) and
//! channel helpers that fail instead of hanging.

pub mod async_helpers;
pub mod memory_transport;

pub use async_helpers::*;
pub use memory_transport::*;
