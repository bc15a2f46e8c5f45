/*
   RouterNode

   Single entry point for running a Tor61 router: wires every service
   together, registers with the directory and starts the entry circuit loop.

    ┌──────────────────────────────────────────────────────────────────┐
    │                           RouterNode                             │
    │                                                                  │
    │  peer listener ──► peer event loop ──► PeerInput ──► RouterBus   │
    │  (512-byte cells)       │ Closed                       │         │
    │                         ▼                              ▼         │
    │              routing / circuits / exit      RoutingEngine        │
    │                                           ┌────┴─────┬───────┐   │
    │                                      Forward    EntryReturn  Exit│
    │                                           │         │        │   │
    │                                      next hop   Entrance   Exit  │
    │                                                 (proxy)  (TCP out)│
    │                                                                  │
    │  CircuitManager: entry circuit build / probe / rebuild,          │
    │                  peer CREATE and EXTEND handling                 │
    └──────────────────────────────────────────────────────────────────┘

   Errors that prevent the node from working at all (proxy port taken,
   registration refused) fail `start`; the rebuild limit is reported later
   through `fatal_errors`. The caller decides whether to start a fresh node.
*/

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::circuit_manager::{CircuitDeps, CircuitManager, CircuitState};
use super::circuit_numbers::ConnectionBook;
use super::error::RouterError;
use super::events::RouterBus;
use super::links::PeerLinks;
use super::metrics;
use super::peer_input::PeerInput;
use super::routing::RoutingEngine;
use super::stream_ids::StreamIds;
use super::transport_manager::{FrameMode, TransportEvent, TransportManager};
use crate::config::Config;
use crate::core_cell::AgentId;
use crate::core_directory::{agent_id, router_name, Directory, DirectoryError};
use crate::core_edge::{Entrance, Exit};

pub struct RouterNode {
    agent: AgentId,
    name: String,
    peer_port: u16,
    proxy_port: u16,
    transport: Arc<TransportManager>,
    routing: Arc<RoutingEngine>,
    circuits: CircuitManager,
    directory: Arc<dyn Directory>,
    tasks: Vec<JoinHandle<()>>,
    fatal: Option<mpsc::UnboundedReceiver<RouterError>>,
}

impl RouterNode {
    /// Start every service of a router described by `config`.
    pub async fn start(config: &Config, directory: Arc<dyn Directory>) -> Result<Self, RouterError> {
        metrics::init_metrics();

        let agent = agent_id(config.node.group, config.node.instance);
        let name = router_name(
            &config.registry.name_prefix,
            config.node.group,
            config.node.instance,
        );
        let transport = Arc::new(TransportManager::new(config.circuit.connect_timeout));
        let mut tasks = Vec::new();

        match Self::wire(config, directory.clone(), transport.clone(), agent, &name, &mut tasks).await {
            Ok((peer_port, proxy_port, routing, circuits, fatal)) => {
                info!(%name, agent, peer_port, proxy_port, "router started");
                Ok(Self {
                    agent,
                    name,
                    peer_port,
                    proxy_port,
                    transport,
                    routing,
                    circuits,
                    directory,
                    tasks,
                    fatal: Some(fatal),
                })
            }
            Err(e) => {
                warn!(%name, error = %e, "router failed to start");
                for task in tasks {
                    task.abort();
                }
                transport.shutdown().await;
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn wire(
        config: &Config,
        directory: Arc<dyn Directory>,
        transport: Arc<TransportManager>,
        agent: AgentId,
        name: &str,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<
        (
            u16,
            u16,
            Arc<RoutingEngine>,
            CircuitManager,
            mpsc::UnboundedReceiver<RouterError>,
        ),
        RouterError,
    > {
        let bus = RouterBus::new();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let (_, peer_port) = transport
            .listen(config.node.peer_port, FrameMode::Cells, peer_tx.clone())
            .await?;

        let (entrance_tx, entrance_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (extend_tx, extend_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let links = Arc::new(PeerLinks::new(transport.clone(), peer_tx));
        let routing = Arc::new(RoutingEngine::new(
            agent,
            links.clone(),
            bus.clone(),
            entrance_tx,
            exit_tx,
        ));
        tasks.extend(routing.spawn());

        let exit = Arc::new(Exit::new(routing.clone(), transport.clone(), extend_tx));
        tasks.extend(exit.spawn(&bus, exit_rx));

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (_, proxy_port) = transport
            .listen(config.node.proxy_port, FrameMode::Raw, client_tx)
            .await
            .map_err(|e| RouterError::ProxyListener(e.to_string()))?;

        let streams = Arc::new(StreamIds::new());
        let entrance = Entrance::new(routing.clone(), transport.clone(), streams.clone());
        tasks.push(entrance.spawn(&bus, client_rx, entrance_rx));

        let circuits = CircuitManager::new(
            config.circuit.clone(),
            CircuitDeps {
                routing: routing.clone(),
                transport: links,
                bus: bus.clone(),
                directory: directory.clone(),
                streams,
                book: ConnectionBook::new(),
                fatal: fatal_tx,
            },
        );

        directory
            .register(peer_port, name, agent)
            .await
            .map_err(|e| match e {
                DirectoryError::Registration(_) => RouterError::Directory(e),
                other => RouterError::Directory(DirectoryError::Registration(other.to_string())),
            })?;

        tasks.extend(circuits.spawn(extend_rx));

        let input = PeerInput::new(bus);
        let peer_routing = routing.clone();
        let peer_circuits = circuits.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                match event {
                    TransportEvent::Frame { conn, frame } => {
                        if let Ok(kind) = input.dispatch(conn, &frame) {
                            trace!(%conn, %kind, "cell dispatched");
                        }
                    }
                    TransportEvent::Accepted { conn, remote, .. } => {
                        debug!(%conn, %remote, "peer connected");
                    }
                    TransportEvent::Closed { conn } => {
                        info!(%conn, "peer link closed");
                        peer_routing.on_connection_closed(conn).await;
                        peer_circuits.on_connection_closed(conn).await;
                        exit.on_peer_closed(conn).await;
                    }
                    TransportEvent::Data { .. } => {}
                }
            }
        }));

        Ok((peer_port, proxy_port, routing, circuits, fatal_rx))
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    pub fn circuit_state(&self) -> watch::Receiver<CircuitState> {
        self.circuits.state()
    }

    /// Errors after which this node should be replaced. Can be taken once.
    pub fn fatal_errors(&mut self) -> Option<mpsc::UnboundedReceiver<RouterError>> {
        self.fatal.take()
    }

    /// Stop every task, close every connection and unregister.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.transport.shutdown().await;
        if let Err(e) = self.directory.unregister().await {
            debug!(name = %self.name, error = %e, "unregister failed");
        }
        info!(name = %self.name, "router stopped");
    }
}
