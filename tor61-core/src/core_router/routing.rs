/*
    RoutingEngine - relay cell forwarding and administrative replies

    For every RELAY cell that arrives on (conn, circuit) exactly one of:

      Forward(next)  the forwarding table maps (conn, circuit) to another leg;
                     the raw frame is rewritten to the next circuit number and
                     written unchanged otherwise
      EntryReturn    (conn, circuit) is this node's entry circuit; the cell is
                     a response for the local proxy
      Exit           this router is the last stop; the exit handles it

    Also owns the entry-forward pointer: installing it announces ReadyToSend,
    clearing it destroys the old entry circuit and announces NotReadyToSend.

    Table and pointer are read on every relay cell and written rarely, so both
    sit behind RwLocks and are replaced whole.
*/

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::RouterError;
use super::events::{BusEvent, InboundCell, RouterBus, Topic};
use super::links::CellTransport;
use super::metrics;
use super::route_table::{ForwardingTable, Hop};
use super::transport_manager::ConnId;
use crate::core_cell::{
    rewrite_circuit, AgentId, Cell, CellType, CircuitId, RawCell, RelayPayload, StreamId,
};
use crate::core_directory::RouterDescriptor;

/// Where a relay cell went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    EntryReturn,
    Exit,
    Forward(Hop),
}

pub type CellSink = mpsc::UnboundedSender<Arc<InboundCell>>;

pub struct RoutingEngine {
    local_agent: AgentId,
    transport: Arc<dyn CellTransport>,
    bus: RouterBus,
    table: RwLock<ForwardingTable>,
    entry: RwLock<Option<Hop>>,
    entrance: CellSink,
    exit: CellSink,
}

impl RoutingEngine {
    /// # Arguments
    /// * `entrance` - receives relay cells returning on the entry circuit
    /// * `exit` - receives relay cells for which this router is the last stop
    pub fn new(
        local_agent: AgentId,
        transport: Arc<dyn CellTransport>,
        bus: RouterBus,
        entrance: CellSink,
        exit: CellSink,
    ) -> Self {
        Self {
            local_agent,
            transport,
            bus,
            table: RwLock::new(ForwardingTable::new()),
            entry: RwLock::new(None),
            entrance,
            exit,
        }
    }

    pub fn local_agent(&self) -> AgentId {
        self.local_agent
    }

    /// Start reacting to inbound RELAY, OPEN and DESTROY cells.
    ///
    /// Subscriptions are taken before this returns, so no cell published
    /// afterwards is missed.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut relays = self.bus.subscribe(Topic::Kind(CellType::Relay));
        let mut opens = self.bus.subscribe(Topic::Kind(CellType::Open));
        let mut destroys = self.bus.subscribe(Topic::Kind(CellType::Destroy));

        let engine = self.clone();
        let relay_task = tokio::spawn(async move {
            while let Some(event) = relays.recv().await {
                if let BusEvent::Cell(inbound) = event {
                    if let Err(e) = engine.route(inbound.clone()).await {
                        warn!(conn = %inbound.conn, circuit = inbound.cell.circuit(), error = %e, "failed to route relay cell");
                    }
                }
            }
        });

        let engine = self.clone();
        let open_task = tokio::spawn(async move {
            while let Some(event) = opens.recv().await {
                let Some(inbound) = event.cell() else { continue };
                if let Cell::Open { opener, .. } = inbound.cell {
                    let conn = inbound.conn;
                    match engine.send_opened(conn, opener).await {
                        Ok(()) => {
                            debug!(%conn, agent = opener, "answered OPEN");
                            engine.bus.publish(Topic::OpenedSent, BusEvent::OpenedSent(conn));
                        }
                        Err(e) => warn!(%conn, error = %e, "failed to answer OPEN"),
                    }
                }
            }
        });

        let engine = self.clone();
        let destroy_task = tokio::spawn(async move {
            while let Some(event) = destroys.recv().await {
                if let Some(inbound) = event.cell() {
                    engine
                        .on_destroy(Hop::new(inbound.conn, inbound.cell.circuit()))
                        .await;
                }
            }
        });

        vec![relay_task, open_task, destroy_task]
    }

    /// Classify an inbound relay cell and act on it.
    pub async fn route(&self, inbound: Arc<InboundCell>) -> Result<RouteDecision, RouterError> {
        let from = Hop::new(inbound.conn, inbound.cell.circuit());

        let next = self.table.read().await.get(&from);
        if let Some(next) = next {
            let mut raw = inbound.raw;
            rewrite_circuit(&mut raw, next.circuit);
            self.transport.write(next.conn, &raw).await?;
            metrics::cell_forwarded();
            debug!(%from, to = %next, "forwarded relay cell");
            return Ok(RouteDecision::Forward(next));
        }

        if *self.entry.read().await == Some(from) {
            debug!(%from, "relay cell returned on entry circuit");
            self.entrance
                .send(inbound)
                .map_err(|_| RouterError::Shutdown)?;
            return Ok(RouteDecision::EntryReturn);
        }

        debug!(%from, "relay cell for exit");
        self.exit.send(inbound).map_err(|_| RouterError::Shutdown)?;
        Ok(RouteDecision::Exit)
    }

    /// Install the one-directional forwarding entry `from -> to`.
    pub async fn set_route(&self, from: Hop, to: Hop) {
        let mut table = self.table.write().await;
        table.insert(from, to);
        metrics::forwarding_entries(table.len());
        debug!(%from, %to, "route installed");
    }

    pub async fn lookup_route(&self, from: Hop) -> Option<Hop> {
        self.table.read().await.get(&from)
    }

    pub async fn entry_forward(&self) -> Option<Hop> {
        *self.entry.read().await
    }

    /// Record the first hop of the local circuit and announce it is usable.
    pub async fn set_entry_forward(&self, hop: Hop) {
        *self.entry.write().await = Some(hop);
        info!(entry = %hop, "entry circuit ready");
        self.bus.publish(Topic::ReadyToSend, BusEvent::ReadyToSend);
    }

    /// Forget the entry circuit, destroying it on the wire.
    pub async fn clear_entry_forward(&self) -> Option<Hop> {
        let old = self.entry.write().await.take();
        if let Some(hop) = old {
            self.bus
                .publish(Topic::NotReadyToSend, BusEvent::NotReadyToSend);
            if let Err(e) = self.send_destroy(hop.conn, hop.circuit).await {
                debug!(entry = %hop, error = %e, "could not send DESTROY for old entry circuit");
            }
        }
        old
    }

    /// Write locally produced cells onto the entry circuit.
    ///
    /// Each cell is rewritten to the entry circuit number first. Without an
    /// entry circuit nothing is written and 0 is returned.
    pub async fn enter_from_local(&self, cells: Vec<RawCell>) -> Result<usize, RouterError> {
        let Some(entry) = *self.entry.read().await else {
            return Ok(0);
        };

        let count = cells.len();
        for mut raw in cells {
            rewrite_circuit(&mut raw, entry.circuit);
            self.transport.write(entry.conn, &raw).await?;
        }
        Ok(count)
    }

    /// Tear down both legs of a circuit after a DESTROY arrived on `hop`.
    pub async fn on_destroy(&self, hop: Hop) {
        let other = {
            let mut table = self.table.write().await;
            let other = table.remove_circuit(hop);
            metrics::forwarding_entries(table.len());
            other
        };

        if let Some(other) = other {
            debug!(%hop, %other, "circuit destroyed, propagating");
            if let Err(e) = self.send_destroy(other.conn, other.circuit).await {
                debug!(hop = %other, error = %e, "could not propagate DESTROY");
            }
        }
    }

    /// Drop every circuit that used `conn`, destroying the surviving legs.
    pub async fn on_connection_closed(&self, conn: ConnId) {
        let survivors = {
            let mut table = self.table.write().await;
            let survivors = table.remove_connection(conn);
            metrics::forwarding_entries(table.len());
            survivors
        };

        for hop in survivors {
            debug!(%conn, %hop, "connection lost, destroying other leg");
            if let Err(e) = self.send_destroy(hop.conn, hop.circuit).await {
                debug!(%hop, error = %e, "could not send DESTROY");
            }
        }
    }

    pub async fn write_raw(&self, conn: ConnId, raw: &RawCell) -> Result<(), RouterError> {
        self.transport.write(conn, raw).await
    }

    async fn send(&self, conn: ConnId, cell: Cell) -> Result<(), RouterError> {
        let raw = cell.encode()?;
        self.transport.write(conn, &raw).await
    }

    pub async fn send_open(&self, conn: ConnId, opened: AgentId) -> Result<(), RouterError> {
        self.send(
            conn,
            Cell::Open {
                opener: self.local_agent,
                opened,
            },
        )
        .await
    }

    pub async fn send_opened(&self, conn: ConnId, opener: AgentId) -> Result<(), RouterError> {
        self.send(
            conn,
            Cell::Opened {
                opener,
                opened: self.local_agent,
            },
        )
        .await
    }

    pub async fn send_open_failed(&self, conn: ConnId, opener: AgentId) -> Result<(), RouterError> {
        self.send(
            conn,
            Cell::OpenFailed {
                opener,
                opened: self.local_agent,
            },
        )
        .await
    }

    pub async fn send_create(&self, conn: ConnId, circuit: CircuitId) -> Result<(), RouterError> {
        self.send(conn, Cell::Create { circuit }).await
    }

    pub async fn send_created(&self, conn: ConnId, circuit: CircuitId) -> Result<(), RouterError> {
        self.send(conn, Cell::Created { circuit }).await
    }

    pub async fn send_create_failed(
        &self,
        conn: ConnId,
        circuit: CircuitId,
    ) -> Result<(), RouterError> {
        self.send(conn, Cell::CreateFailed { circuit }).await
    }

    pub async fn send_destroy(&self, conn: ConnId, circuit: CircuitId) -> Result<(), RouterError> {
        self.send(conn, Cell::Destroy { circuit }).await
    }

    pub async fn send_extend(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        router: &RouterDescriptor,
    ) -> Result<(), RouterError> {
        self.send_relay(
            conn,
            circuit,
            0,
            RelayPayload::Extend {
                host: router.addr(),
                agent: router.agent,
            },
        )
        .await
    }

    pub async fn send_extended(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        stream: StreamId,
    ) -> Result<(), RouterError> {
        self.send_relay(conn, circuit, stream, RelayPayload::Extended)
            .await
    }

    pub async fn send_extend_failed(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        stream: StreamId,
    ) -> Result<(), RouterError> {
        self.send_relay(conn, circuit, stream, RelayPayload::ExtendFailed)
            .await
    }

    pub async fn send_relay(
        &self,
        conn: ConnId,
        circuit: CircuitId,
        stream: StreamId,
        payload: RelayPayload,
    ) -> Result<(), RouterError> {
        self.send(conn, Cell::relay(circuit, stream, payload)).await
    }
}
