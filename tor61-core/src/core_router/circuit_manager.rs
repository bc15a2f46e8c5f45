/*
    CircuitManager - building, probing and rebuilding the entry circuit

    Entry circuit lifecycle, driven by one long-running task:

        Idle
         │  fetch router list, pick a random first hop
         ▼
        ConnectingFirstHop ── OPEN / OPENED (reuse link by host:port)
         ▼
        CreatingCircuit ───── CREATE / CREATED
         ▼
        Extending{1..N} ───── RELAY EXTEND / EXTENDED through the circuit
         ▼
        Established ◄──────┐  entry-forward pointer installed
         │ probe_interval   │ pass
         ▼                  │
        Testing ────────────┘  BEGIN bogus host -> BEGIN_FAILED
         │ fail                BEGIN known host -> CONNECTED
         ▼
        TornDown ─► Idle       DESTROY entry circuit, drop first-hop link

    Every wait is a bus waiter raced against its own deadline. Dropping the
    build future (shutdown, abort) drops the waiters and their timers with it.

    Peer-initiated work handled here as well:
      - CREATE on any link is answered with CREATED
      - EXTEND reaching its last hop connects/creates towards the requested
        router, stitches both legs into the forwarding table, then answers
        EXTENDED (or EXTEND_FAILED)
*/

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::IndexedRandom;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::circuit_numbers::ConnectionBook;
use super::error::RouterError;
use super::events::{BusEvent, CorrelationKey, InboundCell, RouterBus, Topic};
use super::links::CellTransport;
use super::metrics;
use super::route_table::Hop;
use super::routing::RoutingEngine;
use super::stream_ids::StreamIds;
use super::transport_manager::ConnId;
use crate::config::CircuitConfig;
use crate::core_bus::Outcome;
use crate::core_cell::{Cell, CellType, CircuitId, RelayCommand, RelayPayload};
use crate::core_directory::{Directory, RouterDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Idle,
    ConnectingFirstHop,
    CreatingCircuit,
    Extending { hop: usize },
    Established(Hop),
    Testing(Hop),
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    ProbeFailed,
    FirstHopClosed,
    Destroyed,
}

impl RebuildReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildReason::ProbeFailed => "probe_failed",
            RebuildReason::FirstHopClosed => "first_hop_closed",
            RebuildReason::Destroyed => "destroyed",
        }
    }
}

/// A fully extended circuit originated by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCircuit {
    pub first_hop: Hop,
    pub path: Vec<RouterDescriptor>,
}

/// Collaborators the circuit manager drives
pub struct CircuitDeps {
    pub routing: Arc<RoutingEngine>,
    pub transport: Arc<dyn CellTransport>,
    pub bus: RouterBus,
    pub directory: Arc<dyn Directory>,
    pub streams: Arc<StreamIds>,
    pub book: ConnectionBook,
    /// Errors the node cannot recover from by itself
    pub fatal: mpsc::UnboundedSender<RouterError>,
}

struct Inner {
    config: CircuitConfig,
    routing: Arc<RoutingEngine>,
    transport: Arc<dyn CellTransport>,
    bus: RouterBus,
    directory: Arc<dyn Directory>,
    streams: Arc<StreamIds>,
    fatal: mpsc::UnboundedSender<RouterError>,
    book: Mutex<ConnectionBook>,
    /// One gate per `host:port`; held while a link to it is being opened.
    dialing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    routers: RwLock<Vec<RouterDescriptor>>,
    first_hop: Mutex<Option<ConnId>>,
    rebuild_tx: mpsc::UnboundedSender<RebuildReason>,
    rebuild_rx: Mutex<Option<mpsc::UnboundedReceiver<RebuildReason>>>,
    state: watch::Sender<CircuitState>,
}

#[derive(Clone)]
pub struct CircuitManager {
    inner: Arc<Inner>,
}

fn reply_type(outcome: &Outcome<BusEvent>) -> Option<CellType> {
    match outcome {
        Outcome::Event(event) => event.cell().map(|inbound| inbound.cell.cell_type()),
        _ => None,
    }
}

fn relay_reply(outcome: &Outcome<BusEvent>) -> Option<RelayCommand> {
    match outcome {
        Outcome::Event(event) => match &event.cell()?.cell {
            Cell::Relay(relay) => Some(relay.command()),
            _ => None,
        },
        _ => None,
    }
}

/// Split an EXTEND target of the form `host:port`.
fn parse_target(target: &str, agent: u32) -> Option<RouterDescriptor> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some(RouterDescriptor::new(host, port.parse().ok()?, agent))
}

impl CircuitManager {
    pub fn new(config: CircuitConfig, deps: CircuitDeps) -> Self {
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CircuitState::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                routing: deps.routing,
                transport: deps.transport,
                bus: deps.bus,
                directory: deps.directory,
                streams: deps.streams,
                fatal: deps.fatal,
                book: Mutex::new(deps.book),
                dialing: Mutex::new(HashMap::new()),
                routers: RwLock::new(Vec::new()),
                first_hop: Mutex::new(None),
                rebuild_tx,
                rebuild_rx: Mutex::new(Some(rebuild_rx)),
                state,
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<CircuitState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, state: CircuitState) {
        debug!(?state, "entry circuit state");
        self.inner.state.send_replace(state);
    }

    /// Start the entry circuit loop and the peer-initiated handlers.
    ///
    /// # Arguments
    /// * `extend_rx` - EXTEND cells for which this router is the last hop
    pub fn spawn(
        &self,
        mut extend_rx: mpsc::UnboundedReceiver<Arc<InboundCell>>,
    ) -> Vec<JoinHandle<()>> {
        let mut creates = self.inner.bus.subscribe(Topic::Kind(CellType::Create));
        let mut opened = self.inner.bus.subscribe(Topic::OpenedSent);

        let manager = self.clone();
        let create_task = tokio::spawn(async move {
            while let Some(event) = creates.recv().await {
                if let Some(inbound) = event.cell() {
                    manager.handle_create(inbound.conn, inbound.cell.circuit()).await;
                }
            }
        });

        let manager = self.clone();
        let opened_task = tokio::spawn(async move {
            while let Some(event) = opened.recv().await {
                if let BusEvent::OpenedSent(conn) = event {
                    manager.inner.book.lock().await.register_accepted(conn);
                }
            }
        });

        let manager = self.clone();
        let extend_task = tokio::spawn(async move {
            while let Some(request) = extend_rx.recv().await {
                let manager = manager.clone();
                tokio::spawn(async move { manager.handle_extend(request).await });
            }
        });

        let manager = self.clone();
        let entry_task = tokio::spawn(async move { manager.run_entry_loop().await });

        vec![create_task, opened_task, extend_task, entry_task]
    }

    async fn run_entry_loop(&self) {
        let Some(mut rebuild_rx) = self.inner.rebuild_rx.lock().await.take() else {
            warn!("entry circuit loop already running");
            return;
        };
        let max_attempts = self.inner.config.max_rebuild_attempts;
        let mut failures = 0u32;

        loop {
            match self.build_entry_circuit().await {
                Ok(entry) => {
                    failures = 0;
                    // Reasons queued during the build refer to older links.
                    while rebuild_rx.try_recv().is_ok() {}

                    *self.inner.first_hop.lock().await = Some(entry.first_hop.conn);
                    self.inner.routing.set_entry_forward(entry.first_hop).await;
                    self.set_state(CircuitState::Established(entry.first_hop));
                    metrics::circuit_built();
                    info!(
                        entry = %entry.first_hop,
                        hops = entry.path.len(),
                        "entry circuit established"
                    );

                    let reason = self.supervise(&entry, &mut rebuild_rx).await;
                    info!(entry = %entry.first_hop, reason = reason.as_str(), "rebuilding entry circuit");
                    metrics::circuit_rebuild(reason.as_str());
                    self.teardown(&entry).await;
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "entry circuit build failed");
                    metrics::circuit_rebuild("build_failed");
                    self.set_state(CircuitState::TornDown);

                    if max_attempts > 0 && failures >= max_attempts {
                        let _ = self.inner.fatal.send(RouterError::RebuildExhausted(failures));
                        return;
                    }
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
            }
        }
    }

    /// Watch an established circuit until it has to be rebuilt.
    async fn supervise(
        &self,
        entry: &EntryCircuit,
        rebuild_rx: &mut mpsc::UnboundedReceiver<RebuildReason>,
    ) -> RebuildReason {
        let hop = entry.first_hop;
        let destroyed = self
            .inner
            .bus
            .once(Topic::Keyed(
                CellType::Destroy,
                CorrelationKey::circuit(hop.conn, hop.circuit),
            ))
            .wait();
        tokio::pin!(destroyed);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.probe_interval) => {
                    self.set_state(CircuitState::Testing(hop));
                    let passed = self.probe_entry_circuit(entry).await;
                    metrics::probe_result(passed);
                    if !passed {
                        return RebuildReason::ProbeFailed;
                    }
                    self.set_state(CircuitState::Established(hop));
                }
                reason = rebuild_rx.recv() => {
                    return reason.unwrap_or(RebuildReason::FirstHopClosed);
                }
                _ = &mut destroyed => {
                    return RebuildReason::Destroyed;
                }
            }
        }
    }

    /// Fetch a fresh router list from the directory.
    pub async fn refresh_routers(&self) -> Result<Vec<RouterDescriptor>, RouterError> {
        let routers = self.inner.directory.fetch_router_list().await?;
        debug!(count = routers.len(), "router list refreshed");
        *self.inner.routers.write().await = routers.clone();
        if routers.is_empty() {
            return Err(RouterError::NoRouters);
        }
        Ok(routers)
    }

    /// A random router from the cached list, refreshing it when empty.
    pub async fn pick_router(&self) -> Result<RouterDescriptor, RouterError> {
        let cached = self.inner.routers.read().await.clone();
        let routers = if cached.is_empty() {
            self.refresh_routers().await?
        } else {
            cached
        };
        let mut rng = rand::rng();
        routers.choose(&mut rng).cloned().ok_or(RouterError::NoRouters)
    }

    /// Link to `router`, reusing an existing one to the same `host:port`.
    ///
    /// Concurrent calls for one address share a single dial: later callers
    /// wait for the pending OPEN and then reuse its link.
    pub async fn establish_connection(
        &self,
        router: &RouterDescriptor,
    ) -> Result<ConnId, RouterError> {
        let addr = router.addr();
        let gate = self
            .inner
            .dialing
            .lock()
            .await
            .entry(addr.clone())
            .or_default()
            .clone();
        let _dialing = gate.lock().await;

        if let Some(conn) = self.inner.book.lock().await.lookup(&addr) {
            debug!(%conn, router = %router, "reusing link");
            return Ok(conn);
        }

        let conn = self.inner.transport.connect(&router.host, router.port).await?;
        let waiter = self.inner.bus.once_any([
            Topic::Keyed(CellType::Opened, CorrelationKey::conn(conn)),
            Topic::Keyed(CellType::OpenFailed, CorrelationKey::conn(conn)),
        ]);

        if let Err(e) = self.inner.routing.send_open(conn, router.agent).await {
            self.inner.transport.close(conn).await;
            return Err(e);
        }

        let outcome = waiter.race(self.inner.config.reply_timeout).await;
        let result = match reply_type(&outcome) {
            Some(CellType::Opened) => Ok(conn),
            Some(_) => Err(RouterError::Rejected("OPEN")),
            None if matches!(outcome, Outcome::TimedOut) => Err(RouterError::Timeout("OPENED")),
            None => Err(RouterError::Shutdown),
        };

        match result {
            Ok(conn) => {
                self.inner.book.lock().await.register_initiated(&addr, conn);
                debug!(%conn, router = %router, "link opened");
                Ok(conn)
            }
            Err(e) => {
                self.inner.transport.close(conn).await;
                Err(e)
            }
        }
    }

    /// Create a new circuit on `conn` with a number from our half of the space.
    pub async fn establish_circuit(&self, conn: ConnId) -> Result<CircuitId, RouterError> {
        let circuit = self
            .inner
            .book
            .lock()
            .await
            .next_circuit(conn)
            .ok_or(RouterError::ConnectionNotFound(conn))?;

        let key = CorrelationKey::circuit(conn, circuit);
        let waiter = self.inner.bus.once_any([
            Topic::Keyed(CellType::Created, key),
            Topic::Keyed(CellType::CreateFailed, key),
        ]);
        self.inner.routing.send_create(conn, circuit).await?;

        let outcome = waiter.race(self.inner.config.reply_timeout).await;
        match reply_type(&outcome) {
            Some(CellType::Created) => {
                debug!(%conn, circuit, "circuit created");
                Ok(circuit)
            }
            Some(_) => Err(RouterError::Rejected("CREATE")),
            None if matches!(outcome, Outcome::TimedOut) => Err(RouterError::Timeout("CREATED")),
            None => Err(RouterError::Shutdown),
        }
    }

    /// Lengthen the circuit starting at `hop` by one router.
    pub async fn extend_circuit(
        &self,
        hop: Hop,
        router: &RouterDescriptor,
    ) -> Result<(), RouterError> {
        let key = CorrelationKey::circuit(hop.conn, hop.circuit);
        let waiter = self.inner.bus.once_any([
            Topic::Relay(RelayCommand::Extended, key),
            Topic::Relay(RelayCommand::ExtendFailed, key),
        ]);
        self.inner
            .routing
            .send_extend(hop.conn, hop.circuit, router)
            .await?;

        let outcome = waiter.race(self.inner.config.reply_timeout).await;
        match relay_reply(&outcome) {
            Some(RelayCommand::Extended) => {
                debug!(%hop, router = %router, "circuit extended");
                Ok(())
            }
            Some(_) => Err(RouterError::Rejected("EXTEND")),
            None if matches!(outcome, Outcome::TimedOut) => Err(RouterError::Timeout("EXTENDED")),
            None => Err(RouterError::Shutdown),
        }
    }

    /// Build a fresh entry circuit of `hops` extensions.
    ///
    /// The entry-forward pointer is not touched; the caller installs it.
    pub async fn build_entry_circuit(&self) -> Result<EntryCircuit, RouterError> {
        self.set_state(CircuitState::Idle);
        self.refresh_routers().await?;

        let first = self.pick_router().await?;
        self.set_state(CircuitState::ConnectingFirstHop);
        let conn = self.establish_connection(&first).await?;

        self.set_state(CircuitState::CreatingCircuit);
        let circuit = match self.establish_circuit(conn).await {
            Ok(circuit) => circuit,
            Err(e) => {
                // An unresponsive first hop is not worth keeping a link to.
                self.drop_link(conn).await;
                return Err(e);
            }
        };

        let hop = Hop::new(conn, circuit);
        let mut path = vec![first];
        for k in 1..=self.inner.config.hops {
            self.set_state(CircuitState::Extending { hop: k });
            let next = self.pick_router().await?;
            if let Err(e) = self.extend_circuit(hop, &next).await {
                // The link stays up; other circuits may share it.
                if let Err(destroy) = self.inner.routing.send_destroy(conn, circuit).await {
                    debug!(%hop, error = %destroy, "could not destroy partial circuit");
                }
                return Err(e);
            }
            path.push(next);
        }

        Ok(EntryCircuit {
            first_hop: hop,
            path,
        })
    }

    /// Check the circuit end to end with two BEGINs.
    ///
    /// The bogus host must come back BEGIN_FAILED and the known host
    /// CONNECTED, each within `probe_timeout`.
    pub async fn probe_entry_circuit(&self, entry: &EntryCircuit) -> bool {
        let config = &self.inner.config;
        let hop = entry.first_hop;

        let (Some(bogus), Some(known)) = (self.inner.streams.allocate(), self.inner.streams.allocate())
        else {
            warn!("no stream ids left for probing");
            return false;
        };

        let expect = |stream| {
            let key = CorrelationKey::stream(hop.conn, hop.circuit, stream);
            self.inner.bus.once_any([
                Topic::Relay(RelayCommand::Connected, key),
                Topic::Relay(RelayCommand::BeginFailed, key),
            ])
        };
        let bogus_waiter = expect(bogus);
        let known_waiter = expect(known);

        let cells = [
            Cell::relay(0, bogus, RelayPayload::Begin { host: config.bogus_host.clone() }).encode(),
            Cell::relay(0, known, RelayPayload::Begin { host: config.known_host.clone() }).encode(),
        ];
        let passed = match cells {
            [Ok(bogus_cell), Ok(known_cell)] => {
                match self
                    .inner
                    .routing
                    .enter_from_local(vec![bogus_cell, known_cell])
                    .await
                {
                    Ok(2) => {
                        let (bogus_reply, known_reply) = tokio::join!(
                            bogus_waiter.race(config.probe_timeout),
                            known_waiter.race(config.probe_timeout)
                        );
                        let bogus_ok = relay_reply(&bogus_reply) == Some(RelayCommand::BeginFailed);
                        let known_ok = relay_reply(&known_reply) == Some(RelayCommand::Connected);

                        if known_ok {
                            // Release the exit's connection to the known host.
                            if let Ok(end) = Cell::relay(0, known, RelayPayload::End).encode() {
                                let _ = self.inner.routing.enter_from_local(vec![end]).await;
                            }
                        }
                        debug!(entry = %hop, bogus_ok, known_ok, "probe replies");
                        bogus_ok && known_ok
                    }
                    Ok(_) => false,
                    Err(e) => {
                        debug!(entry = %hop, error = %e, "probe could not be sent");
                        false
                    }
                }
            }
            _ => {
                warn!("probe hosts cannot be encoded");
                false
            }
        };

        self.inner.streams.release(bogus);
        self.inner.streams.release(known);

        if passed {
            info!(entry = %hop, "entry circuit probe passed");
        } else {
            warn!(entry = %hop, "entry circuit probe failed");
        }
        passed
    }

    /// Destroy the entry circuit and drop its first-hop link.
    pub async fn teardown(&self, entry: &EntryCircuit) {
        self.set_state(CircuitState::TornDown);
        *self.inner.first_hop.lock().await = None;
        self.inner.routing.clear_entry_forward().await;
        self.drop_link(entry.first_hop.conn).await;
    }

    async fn drop_link(&self, conn: ConnId) {
        self.inner.book.lock().await.remove(conn);
        self.inner.transport.close(conn).await;
        self.inner.routing.on_connection_closed(conn).await;
    }

    /// A peer link went away.
    pub async fn on_connection_closed(&self, conn: ConnId) {
        self.inner.book.lock().await.remove(conn);
        if *self.inner.first_hop.lock().await == Some(conn) {
            info!(%conn, "first hop link closed");
            let _ = self.inner.rebuild_tx.send(RebuildReason::FirstHopClosed);
        }
    }

    /// Answer a peer's CREATE.
    pub async fn handle_create(&self, conn: ConnId, circuit: CircuitId) {
        match self.inner.routing.send_created(conn, circuit).await {
            Ok(()) => debug!(%conn, circuit, "accepted CREATE"),
            Err(e) => warn!(%conn, circuit, error = %e, "failed to answer CREATE"),
        }
    }

    /// Extend a circuit that ends at this router.
    pub async fn handle_extend(&self, request: Arc<InboundCell>) {
        let Cell::Relay(relay) = &request.cell else {
            return;
        };
        let RelayPayload::Extend { host, agent } = &relay.payload else {
            return;
        };
        let from = Hop::new(request.conn, relay.circuit);

        let result = match parse_target(host, *agent) {
            Some(router) => match self.establish_connection(&router).await {
                Ok(conn) => self
                    .establish_circuit(conn)
                    .await
                    .map(|circuit| Hop::new(conn, circuit)),
                Err(e) => Err(e),
            },
            None => Err(RouterError::Rejected("EXTEND target")),
        };

        let reply = match result {
            Ok(next) => {
                self.inner.routing.set_route(from, next).await;
                self.inner.routing.set_route(next, from).await;
                info!(%from, to = %next, target = %host, "extended circuit");
                self.inner
                    .routing
                    .send_extended(from.conn, from.circuit, relay.stream)
                    .await
            }
            Err(e) => {
                warn!(%from, target = %host, error = %e, "extend failed");
                self.inner
                    .routing
                    .send_extend_failed(from.conn, from.circuit, relay.stream)
                    .await
            }
        };
        if let Err(e) = reply {
            warn!(%from, error = %e, "could not answer EXTEND");
        }
    }
}
