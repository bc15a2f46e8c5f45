//! Router directory
//!
//! Supplies the list of routers a node may build circuits through and
//! publishes the node's own listening port and agent id.

mod client;
mod error;
mod server;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core_cell::AgentId;

pub use client::RegistryClient;
pub use error::DirectoryError;
pub use server::RegistryServer;

/// Name every router registers under: `Tor61Router-<group>-<instance>`
pub fn router_name(prefix: &str, group: u16, instance: u16) -> String {
    format!("{}Router-{:04}-{:04}", prefix, group, instance)
}

/// Agent id of a router: `group * 2^16 + instance`
pub fn agent_id(group: u16, instance: u16) -> AgentId {
    (AgentId::from(group) << 16) | AgentId::from(instance)
}

/// Where a router listens and who it claims to be
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterDescriptor {
    pub host: String,
    pub port: u16,
    pub agent: AgentId,
}

impl RouterDescriptor {
    pub fn new(host: impl Into<String>, port: u16, agent: AgentId) -> Self {
        Self {
            host: host.into(),
            port,
            agent,
        }
    }

    /// `host:port`, the form carried in EXTEND cells and used for link reuse
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RouterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr(), self.agent)
    }
}

/// Source of router descriptors and sink for our own registration
#[async_trait]
pub trait Directory: Send + Sync {
    /// Announce this router.
    ///
    /// # Arguments
    /// * `port` - peer port other routers should connect to
    /// * `name` - human readable router name
    /// * `agent` - our agent id
    async fn register(&self, port: u16, name: &str, agent: AgentId) -> Result<(), DirectoryError>;

    /// Current list of known routers, possibly including ourselves.
    async fn fetch_router_list(&self) -> Result<Vec<RouterDescriptor>, DirectoryError>;

    /// Withdraw our registration.
    async fn unregister(&self) -> Result<(), DirectoryError>;
}

/// Fixed router list, for tests and statically configured overlays
///
/// Registration adds this router to the list it serves, so a single node can
/// build circuits through itself.
pub struct StaticDirectory {
    host: String,
    routers: RwLock<Vec<RouterDescriptor>>,
}

impl StaticDirectory {
    pub fn new(routers: Vec<RouterDescriptor>) -> Self {
        Self::with_host("127.0.0.1", routers)
    }

    /// # Arguments
    /// * `host` - address recorded for routers that register themselves
    pub fn with_host(host: impl Into<String>, routers: Vec<RouterDescriptor>) -> Self {
        Self {
            host: host.into(),
            routers: RwLock::new(routers),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn register(&self, port: u16, _name: &str, agent: AgentId) -> Result<(), DirectoryError> {
        let descriptor = RouterDescriptor::new(self.host.clone(), port, agent);
        let mut routers = self.routers.write().await;
        if !routers.contains(&descriptor) {
            routers.push(descriptor);
        }
        Ok(())
    }

    async fn fetch_router_list(&self) -> Result<Vec<RouterDescriptor>, DirectoryError> {
        Ok(self.routers.read().await.clone())
    }

    async fn unregister(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}
