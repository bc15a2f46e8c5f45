//! Tor61: a small onion-routing overlay
//!
//! Routers exchange fixed 512-byte cells over TCP, build multi-hop circuits
//! through each other and carry HTTP proxy traffic along them.

pub mod config;
pub mod core_bus;
pub mod core_cell;
pub mod core_directory;
pub mod core_edge;
pub mod core_router;
pub mod logging;
pub mod shutdown;

#[cfg(test)]
pub mod test_utils;

pub use config::{Config, ConfigError};
pub use core_directory::{Directory, RegistryClient, RegistryServer, StaticDirectory};
pub use core_router::{RouterError, RouterNode};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};
