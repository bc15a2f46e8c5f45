//! Exit: the last stop of a circuit
//!
//! Turns BEGIN/DATA/END relay cells into TCP connections to remote hosts and
//! streams the remote bytes back as DATA cells. Each open stream gets its own
//! pump task that owns the remote connection's events, so bytes leave in the
//! order they arrived and nothing is lost between connect and registration.
//!
//! EXTEND cells also end up here (this router is the circuit's last hop) and
//! are handed to the circuit manager.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::http::split_host;
use crate::core_cell::{data_cells, Cell, CellType, RelayPayload, StreamId};
use crate::core_router::{
    CellSink, ConnId, FrameMode, Hop, InboundCell, RouterBus, RoutingEngine, Topic,
    TransportEvent, TransportManager,
};

type StreamKey = (Hop, StreamId);

pub struct Exit {
    routing: Arc<RoutingEngine>,
    transport: Arc<TransportManager>,
    extend: CellSink,
    streams: Mutex<HashMap<StreamKey, ConnId>>,
}

impl Exit {
    /// # Arguments
    /// * `transport` - dials the remote hosts named in BEGIN cells
    /// * `extend` - receives EXTEND cells for the circuit manager
    pub fn new(
        routing: Arc<RoutingEngine>,
        transport: Arc<TransportManager>,
        extend: CellSink,
    ) -> Self {
        Self {
            routing,
            transport,
            extend,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(
        self: &Arc<Self>,
        bus: &RouterBus,
        mut cells: mpsc::UnboundedReceiver<Arc<InboundCell>>,
    ) -> Vec<JoinHandle<()>> {
        let mut destroys = bus.subscribe(Topic::Kind(CellType::Destroy));

        let exit = self.clone();
        let cell_task = tokio::spawn(async move {
            while let Some(inbound) = cells.recv().await {
                exit.handle_cell(inbound).await;
            }
        });

        let exit = self.clone();
        let destroy_task = tokio::spawn(async move {
            while let Some(event) = destroys.recv().await {
                if let Some(inbound) = event.cell() {
                    let hop = Hop::new(inbound.conn, inbound.cell.circuit());
                    exit.close_where(|(h, _)| *h == hop).await;
                }
            }
        });

        vec![cell_task, destroy_task]
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    async fn handle_cell(self: &Arc<Self>, inbound: Arc<InboundCell>) {
        let Cell::Relay(relay) = &inbound.cell else {
            return;
        };
        let key = (Hop::new(inbound.conn, relay.circuit), relay.stream);

        match &relay.payload {
            RelayPayload::Begin { host } => {
                let exit = self.clone();
                let host = host.clone();
                tokio::spawn(async move { exit.begin(key, &host).await });
            }
            RelayPayload::Data(bytes) => self.forward(key, bytes).await,
            RelayPayload::End => {
                let remote = self.streams.lock().await.remove(&key);
                if let Some(remote) = remote {
                    debug!(hop = %key.0, stream = key.1, %remote, "stream ended by circuit");
                    self.transport.close(remote).await;
                }
            }
            RelayPayload::Extend { .. } => {
                if self.extend.send(inbound.clone()).is_err() {
                    warn!(hop = %key.0, "circuit manager gone, dropping EXTEND");
                }
            }
            _ => {
                debug!(hop = %key.0, command = %relay.command(), "ignoring relay cell at exit");
            }
        }
    }

    async fn begin(self: Arc<Self>, key: StreamKey, host: &str) {
        let (hop, stream) = key;
        if self.streams.lock().await.contains_key(&key) {
            warn!(%hop, stream, "BEGIN for a stream that is already open");
            self.reply(key, RelayPayload::BeginFailed).await;
            return;
        }

        let (name, port) = split_host(host);
        let (sink, events) = mpsc::unbounded_channel();
        match self.transport.connect(name, port, FrameMode::Raw, sink).await {
            Ok(remote) => {
                self.streams.lock().await.insert(key, remote);
                info!(%hop, stream, host, %remote, "stream connected");
                self.reply(key, RelayPayload::Connected).await;

                let exit = self.clone();
                tokio::spawn(async move { exit.pump(key, remote, events).await });
            }
            Err(e) => {
                debug!(%hop, stream, host, error = %e, "BEGIN failed");
                self.reply(key, RelayPayload::BeginFailed).await;
            }
        }
    }

    /// Relay remote bytes back over the circuit until either side closes.
    async fn pump(
        &self,
        key: StreamKey,
        remote: ConnId,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (hop, stream) = key;
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Data { bytes, .. } => {
                    let cells = match data_cells(&bytes, stream, hop.circuit) {
                        Ok(cells) => cells,
                        Err(e) => {
                            warn!(%hop, stream, error = %e, "could not frame remote data");
                            continue;
                        }
                    };
                    trace!(%hop, stream, bytes = bytes.len(), cells = cells.len(), "remote data");
                    for raw in cells {
                        if let Err(e) = self.routing.write_raw(hop.conn, &raw).await {
                            debug!(%hop, stream, error = %e, "circuit gone, closing remote");
                            self.streams.lock().await.remove(&key);
                            self.transport.close(remote).await;
                            return;
                        }
                    }
                }
                TransportEvent::Closed { .. } => {
                    if self.streams.lock().await.remove(&key).is_some() {
                        debug!(%hop, stream, %remote, "remote closed stream");
                        self.reply(key, RelayPayload::End).await;
                    }
                    return;
                }
                _ => {}
            }
        }
    }

    async fn forward(&self, key: StreamKey, bytes: &[u8]) {
        let remote = self.streams.lock().await.get(&key).copied();
        let Some(remote) = remote else {
            debug!(hop = %key.0, stream = key.1, "DATA for unknown stream");
            self.reply(key, RelayPayload::End).await;
            return;
        };
        if let Err(e) = self.transport.write(remote, bytes).await {
            debug!(hop = %key.0, stream = key.1, error = %e, "remote write failed");
            self.streams.lock().await.remove(&key);
            self.transport.close(remote).await;
            self.reply(key, RelayPayload::End).await;
        }
    }

    async fn reply(&self, (hop, stream): StreamKey, payload: RelayPayload) {
        if let Err(e) = self
            .routing
            .send_relay(hop.conn, hop.circuit, stream, payload)
            .await
        {
            debug!(%hop, stream, error = %e, "could not answer on circuit");
        }
    }

    /// Close every stream carried by the peer link `conn`.
    pub async fn on_peer_closed(&self, conn: ConnId) {
        self.close_where(|(hop, _)| hop.conn == conn).await;
    }

    async fn close_where(&self, matches: impl Fn(&StreamKey) -> bool) {
        let remotes: Vec<(StreamKey, ConnId)> = {
            let mut streams = self.streams.lock().await;
            let keys: Vec<StreamKey> = streams.keys().filter(|k| matches(k)).copied().collect();
            keys.into_iter()
                .filter_map(|k| streams.remove(&k).map(|remote| (k, remote)))
                .collect()
        };
        for ((hop, stream), remote) in remotes {
            debug!(%hop, stream, %remote, "closing stream with its circuit");
            self.transport.close(remote).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_router::PeerInput;
    use crate::test_utils::{decode_written, recv_unbounded_timeout, MemoryTransport};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);
    const PEER: ConnId = ConnId(500);

    struct Harness {
        exit: Arc<Exit>,
        input: PeerInput,
        writes: mpsc::UnboundedReceiver<(ConnId, Vec<u8>)>,
        extends: mpsc::UnboundedReceiver<Arc<InboundCell>>,
        _entrance: mpsc::UnboundedReceiver<Arc<InboundCell>>,
    }

    fn harness() -> Harness {
        let (transport, writes) = MemoryTransport::new();
        let bus = RouterBus::new();
        let (entrance_tx, entrance) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (extend_tx, extends) = mpsc::unbounded_channel();
        let routing = Arc::new(RoutingEngine::new(1, transport, bus.clone(), entrance_tx, exit_tx));
        routing.spawn();

        let exit = Arc::new(Exit::new(
            routing,
            Arc::new(TransportManager::new(Duration::from_secs(2))),
            extend_tx,
        ));
        exit.spawn(&bus, exit_rx);

        Harness {
            exit,
            input: PeerInput::new(bus),
            writes,
            extends,
            _entrance: entrance,
        }
    }

    fn deliver(h: &Harness, cell: Cell) {
        h.input.dispatch(PEER, &cell.encode().unwrap()).unwrap();
    }

    async fn next_reply(h: &mut Harness) -> Cell {
        let (conn, bytes) = recv_unbounded_timeout(&mut h.writes, WAIT).await.unwrap();
        assert_eq!(conn, PEER);
        decode_written(&bytes)
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let mut h = harness();
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

        deliver(&h, Cell::relay(3, 9, RelayPayload::Begin { host }));
        let (mut socket, _) = server.accept().await.unwrap();
        assert_eq!(next_reply(&mut h).await, Cell::relay(3, 9, RelayPayload::Connected));

        deliver(&h, Cell::relay(3, 9, RelayPayload::Data(b"GET / HTTP/1.0\r\n\r\n".to_vec())));
        let mut buf = vec![0u8; 18];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

        socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        assert_eq!(
            next_reply(&mut h).await,
            Cell::relay(3, 9, RelayPayload::Data(b"HTTP/1.0 200 OK\r\n\r\n".to_vec()))
        );

        drop(socket);
        assert_eq!(next_reply(&mut h).await, Cell::relay(3, 9, RelayPayload::End));
        assert_eq!(h.exit.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_begin_to_closed_port_fails() {
        let mut h = harness();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        deliver(&h, Cell::relay(3, 1, RelayPayload::Begin { host: format!("127.0.0.1:{}", port) }));
        assert_eq!(next_reply(&mut h).await, Cell::relay(3, 1, RelayPayload::BeginFailed));
    }

    #[tokio::test]
    async fn test_end_closes_remote() {
        let mut h = harness();
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

        deliver(&h, Cell::relay(3, 2, RelayPayload::Begin { host }));
        let (mut socket, _) = server.accept().await.unwrap();
        next_reply(&mut h).await;

        deliver(&h, Cell::relay(3, 2, RelayPayload::End));
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_destroy_closes_streams_of_circuit() {
        let mut h = harness();
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("127.0.0.1:{}", server.local_addr().unwrap().port());

        deliver(&h, Cell::relay(3, 2, RelayPayload::Begin { host }));
        let (mut socket, _) = server.accept().await.unwrap();
        next_reply(&mut h).await;

        deliver(&h, Cell::Destroy { circuit: 3 });
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(read, 0);
        assert_eq!(h.exit.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_ends_it() {
        let mut h = harness();
        deliver(&h, Cell::relay(3, 4, RelayPayload::Data(b"x".to_vec())));
        assert_eq!(next_reply(&mut h).await, Cell::relay(3, 4, RelayPayload::End));
    }

    #[tokio::test]
    async fn test_extend_is_handed_over() {
        let mut h = harness();
        deliver(
            &h,
            Cell::relay(
                3,
                0,
                RelayPayload::Extend {
                    host: "10.0.0.2:4000".to_string(),
                    agent: 2,
                },
            ),
        );
        let request = recv_unbounded_timeout(&mut h.extends, WAIT).await.unwrap();
        assert_eq!(request.conn, PEER);
        assert_eq!(request.cell.circuit(), 3);
    }
}
