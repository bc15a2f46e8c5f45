//! Edges of the overlay: where traffic enters and leaves it
//!
//! - [`Entrance`]: local HTTP proxy whose requests ride the entry circuit
//! - [`Exit`]: last-stop handler that talks to the wider internet

mod entrance;
mod exit;
pub mod http;

pub use entrance::Entrance;
pub use exit::Exit;
