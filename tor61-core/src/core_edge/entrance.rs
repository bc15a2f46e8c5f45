//! Entrance: the local HTTP proxy feeding the entry circuit
//!
//! One actor task owns all client state and reacts to four inputs:
//! client socket events, relay cells returning on the entry circuit, and the
//! routing engine's ReadyToSend / NotReadyToSend announcements.
//!
//! Per client:
//!
//! ```text
//! Headers ──head complete──► Waiting ──entry circuit──► Beginning ──CONNECTED──► Connected
//!    │                          ▲                          │                          │
//!    └── bad head: close        └──── ReadyToSend ─────────┘       END / BEGIN_FAILED: close
//! ```
//!
//! Bytes that arrive before CONNECTED are buffered and flushed as DATA cells
//! once the exit has connected.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::http::{parse_request, HttpError};
use crate::core_cell::{data_cells, Cell, RelayPayload, StreamId};
use crate::core_router::{
    BusEvent, ConnId, InboundCell, RouterBus, RoutingEngine, StreamIds, Topic, TransportEvent,
    TransportManager,
};

const BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Waiting,
    Beginning,
    Connected,
}

struct Client {
    conn: ConnId,
    phase: Phase,
    host: String,
    /// Unparsed head while in `Headers`, bytes awaiting CONNECTED afterwards
    buffer: Vec<u8>,
}

pub struct Entrance {
    routing: Arc<RoutingEngine>,
    transport: Arc<TransportManager>,
    stream_ids: Arc<StreamIds>,
    clients: HashMap<StreamId, Client>,
    by_conn: HashMap<ConnId, StreamId>,
}

impl Entrance {
    /// # Arguments
    /// * `transport` - owns the proxy listener and client sockets
    /// * `stream_ids` - shared with the circuit manager's probes
    pub fn new(
        routing: Arc<RoutingEngine>,
        transport: Arc<TransportManager>,
        stream_ids: Arc<StreamIds>,
    ) -> Self {
        Self {
            routing,
            transport,
            stream_ids,
            clients: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    /// Run the proxy until every input closes.
    ///
    /// # Arguments
    /// * `client_events` - events of the proxy listener and its clients
    /// * `returned` - relay cells the routing engine classified as EntryReturn
    pub fn spawn(
        mut self,
        bus: &RouterBus,
        mut client_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut returned: mpsc::UnboundedReceiver<Arc<InboundCell>>,
    ) -> JoinHandle<()> {
        let mut ready = bus.subscribe(Topic::ReadyToSend);
        let mut not_ready = bus.subscribe(Topic::NotReadyToSend);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = client_events.recv() => self.on_client_event(event).await,
                    Some(inbound) = returned.recv() => self.on_returned(&inbound).await,
                    Some(BusEvent::ReadyToSend) = ready.recv() => self.on_ready().await,
                    Some(BusEvent::NotReadyToSend) = not_ready.recv() => self.on_not_ready().await,
                    else => break,
                }
            }
            debug!("entrance stopped");
        })
    }

    async fn on_client_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { conn, remote, .. } => {
                let Some(stream) = self.stream_ids.allocate() else {
                    warn!(%conn, "no stream ids left, refusing client");
                    self.transport.close(conn).await;
                    return;
                };
                debug!(%conn, %remote, stream, "proxy client connected");
                self.clients.insert(
                    stream,
                    Client {
                        conn,
                        phase: Phase::Headers,
                        host: String::new(),
                        buffer: Vec::new(),
                    },
                );
                self.by_conn.insert(conn, stream);
            }
            TransportEvent::Data { conn, bytes } => {
                let Some(&stream) = self.by_conn.get(&conn) else {
                    return;
                };
                self.on_client_data(stream, bytes).await;
            }
            TransportEvent::Closed { conn } => {
                let Some(&stream) = self.by_conn.get(&conn) else {
                    return;
                };
                let begun = self
                    .clients
                    .get(&stream)
                    .is_some_and(|c| matches!(c.phase, Phase::Beginning | Phase::Connected));
                debug!(%conn, stream, "proxy client closed");
                if begun {
                    self.enter(stream, RelayPayload::End).await;
                }
                self.forget(stream);
            }
            TransportEvent::Frame { .. } => {}
        }
    }

    async fn on_client_data(&mut self, stream: StreamId, bytes: Vec<u8>) {
        let Some(client) = self.clients.get_mut(&stream) else {
            return;
        };

        match client.phase {
            Phase::Headers => {
                client.buffer.extend_from_slice(&bytes);
                match parse_request(&client.buffer) {
                    Ok(None) => {}
                    Ok(Some(request)) => {
                        debug!(stream, host = %request.host, "proxy request");
                        client.host = request.host;
                        client.buffer = request.bytes;
                        client.phase = Phase::Waiting;
                        self.begin(stream).await;
                    }
                    Err(e) => {
                        warn!(conn = %client.conn, stream, error = %e, "rejecting proxy request");
                        if e == HttpError::MissingHost {
                            let _ = self.transport.write(client.conn, BAD_REQUEST).await;
                        }
                        self.close(stream).await;
                    }
                }
            }
            Phase::Waiting | Phase::Beginning => client.buffer.extend_from_slice(&bytes),
            Phase::Connected => self.send_data(stream, &bytes).await,
        }
    }

    /// Send BEGIN if the entry circuit is up; otherwise keep waiting.
    async fn begin(&mut self, stream: StreamId) {
        let Some(client) = self.clients.get(&stream) else {
            return;
        };
        if client.phase != Phase::Waiting || self.routing.entry_forward().await.is_none() {
            return;
        }

        let begin = RelayPayload::Begin {
            host: client.host.clone(),
        };
        let raw = match Cell::relay(0, stream, begin).encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(stream, host = %client.host, error = %e, "cannot encode BEGIN");
                self.close(stream).await;
                return;
            }
        };

        match self.routing.enter_from_local(vec![raw]).await {
            Ok(1) => {
                if let Some(client) = self.clients.get_mut(&stream) {
                    trace!(stream, host = %client.host, "BEGIN sent");
                    client.phase = Phase::Beginning;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(stream, error = %e, "could not send BEGIN");
                self.close(stream).await;
            }
        }
    }

    async fn send_data(&mut self, stream: StreamId, bytes: &[u8]) {
        let cells = match data_cells(bytes, stream, 0) {
            Ok(cells) => cells,
            Err(e) => {
                warn!(stream, error = %e, "could not frame client data");
                return;
            }
        };
        let expected = cells.len();
        match self.routing.enter_from_local(cells).await {
            Ok(sent) if sent == expected => {}
            Ok(_) => {
                debug!(stream, "entry circuit gone while sending");
                self.close(stream).await;
            }
            Err(e) => {
                warn!(stream, error = %e, "could not send client data");
                self.close(stream).await;
            }
        }
    }

    async fn on_returned(&mut self, inbound: &InboundCell) {
        let Cell::Relay(relay) = &inbound.cell else {
            return;
        };
        let stream = relay.stream;
        let Some(client) = self.clients.get_mut(&stream) else {
            // Probe streams and streams we already dropped.
            trace!(stream, command = %relay.command(), "returned cell for unknown stream");
            return;
        };

        match &relay.payload {
            RelayPayload::Connected => {
                if client.phase != Phase::Beginning {
                    return;
                }
                client.phase = Phase::Connected;
                let pending = std::mem::take(&mut client.buffer);
                info!(stream, host = %client.host, "proxy stream connected");
                if !pending.is_empty() {
                    self.send_data(stream, &pending).await;
                }
            }
            RelayPayload::Data(bytes) => {
                let conn = client.conn;
                if let Err(e) = self.transport.write(conn, bytes).await {
                    debug!(%conn, stream, error = %e, "client write failed");
                    self.enter(stream, RelayPayload::End).await;
                    self.close(stream).await;
                }
            }
            RelayPayload::End | RelayPayload::BeginFailed => {
                debug!(stream, command = %relay.command(), "stream closed by exit");
                self.close(stream).await;
            }
            _ => {
                debug!(stream, command = %relay.command(), "unexpected relay cell for proxy stream");
            }
        }
    }

    async fn on_ready(&mut self) {
        let waiting: Vec<StreamId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.phase == Phase::Waiting)
            .map(|(stream, _)| *stream)
            .collect();
        if !waiting.is_empty() {
            debug!(count = waiting.len(), "entry circuit ready, starting buffered streams");
        }
        for stream in waiting {
            self.begin(stream).await;
        }
    }

    /// Streams riding the old entry circuit cannot survive a rebuild.
    async fn on_not_ready(&mut self) {
        let begun: Vec<StreamId> = self
            .clients
            .iter()
            .filter(|(_, c)| matches!(c.phase, Phase::Beginning | Phase::Connected))
            .map(|(stream, _)| *stream)
            .collect();
        if !begun.is_empty() {
            info!(count = begun.len(), "entry circuit lost, dropping streams");
        }
        for stream in begun {
            self.close(stream).await;
        }
    }

    async fn enter(&self, stream: StreamId, payload: RelayPayload) {
        match Cell::relay(0, stream, payload).encode() {
            Ok(raw) => {
                if let Err(e) = self.routing.enter_from_local(vec![raw]).await {
                    debug!(stream, error = %e, "could not enter cell");
                }
            }
            Err(e) => debug!(stream, error = %e, "could not encode cell"),
        }
    }

    /// Close the client socket and release the stream.
    async fn close(&mut self, stream: StreamId) {
        if let Some(conn) = self.forget(stream) {
            self.transport.close(conn).await;
        }
    }

    fn forget(&mut self, stream: StreamId) -> Option<ConnId> {
        let client = self.clients.remove(&stream)?;
        self.by_conn.remove(&client.conn);
        self.stream_ids.release(stream);
        Some(client.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_router::{FrameMode, Hop};
    use crate::test_utils::{decode_written, recv_unbounded_timeout, MemoryTransport};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(5);
    const FIRST_HOP: ConnId = ConnId(700);

    struct Harness {
        routing: Arc<RoutingEngine>,
        writes: mpsc::UnboundedReceiver<(ConnId, Vec<u8>)>,
        returned: mpsc::UnboundedSender<Arc<InboundCell>>,
        stream_ids: Arc<StreamIds>,
        proxy_port: u16,
        _exit: mpsc::UnboundedReceiver<Arc<InboundCell>>,
    }

    async fn harness() -> Harness {
        let (links, writes) = MemoryTransport::new();
        let bus = RouterBus::new();
        let (entrance_tx, _unused) = mpsc::unbounded_channel();
        let (exit_tx, exit) = mpsc::unbounded_channel();
        let routing = Arc::new(RoutingEngine::new(1, links, bus.clone(), entrance_tx, exit_tx));

        let transport = Arc::new(TransportManager::new(Duration::from_secs(2)));
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (_, proxy_port) = transport.listen(0, FrameMode::Raw, client_tx).await.unwrap();

        let stream_ids = Arc::new(StreamIds::new());
        let (returned, returned_rx) = mpsc::unbounded_channel();
        Entrance::new(routing.clone(), transport, stream_ids.clone()).spawn(&bus, client_rx, returned_rx);

        Harness {
            routing,
            writes,
            returned,
            stream_ids,
            proxy_port,
            _exit: exit,
        }
    }

    fn respond(h: &Harness, stream: StreamId, payload: RelayPayload) {
        let cell = Cell::relay(4, stream, payload);
        let raw = cell.encode().unwrap();
        h.returned
            .send(Arc::new(InboundCell {
                conn: FIRST_HOP,
                cell,
                raw,
            }))
            .unwrap();
    }

    async fn next_cell(h: &mut Harness) -> Cell {
        let (conn, bytes) = recv_unbounded_timeout(&mut h.writes, WAIT).await.unwrap();
        assert_eq!(conn, FIRST_HOP);
        decode_written(&bytes)
    }

    async fn client(h: &Harness) -> TcpStream {
        TcpStream::connect(("127.0.0.1", h.proxy_port)).await.unwrap()
    }

    const REQUEST: &[u8] = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
    const REWRITTEN: &[u8] = b"GET http://example.com/ HTTP/1.0\r\nHost: example.com\r\nConnection: close\r\n\r\n";

    #[tokio::test]
    async fn test_request_flows_through_entry_circuit() {
        let mut h = harness().await;
        h.routing.set_entry_forward(Hop::new(FIRST_HOP, 4)).await;

        let mut client = client(&h).await;
        client.write_all(REQUEST).await.unwrap();

        let stream = match next_cell(&mut h).await {
            Cell::Relay(relay) => {
                assert_eq!(relay.circuit, 4);
                assert_eq!(
                    relay.payload,
                    RelayPayload::Begin {
                        host: "example.com:80".to_string()
                    }
                );
                relay.stream
            }
            other => panic!("expected BEGIN, got {:?}", other),
        };
        assert_ne!(stream, 0);

        respond(&h, stream, RelayPayload::Connected);
        assert_eq!(
            next_cell(&mut h).await,
            Cell::relay(4, stream, RelayPayload::Data(REWRITTEN.to_vec()))
        );

        respond(&h, stream, RelayPayload::Data(b"HTTP/1.0 200 OK\r\n\r\nhi".to_vec()));
        let mut buf = vec![0u8; 21];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.0 200 OK\r\n\r\nhi");

        respond(&h, stream, RelayPayload::End);
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_requests_wait_for_entry_circuit() {
        let mut h = harness().await;
        let mut client = client(&h).await;
        client.write_all(REQUEST).await.unwrap();

        assert!(
            recv_unbounded_timeout(&mut h.writes, Duration::from_millis(200))
                .await
                .is_err()
        );

        h.routing.set_entry_forward(Hop::new(FIRST_HOP, 4)).await;
        match next_cell(&mut h).await {
            Cell::Relay(relay) => assert!(matches!(relay.payload, RelayPayload::Begin { .. })),
            other => panic!("expected BEGIN, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_failed_closes_client() {
        let mut h = harness().await;
        h.routing.set_entry_forward(Hop::new(FIRST_HOP, 4)).await;

        let mut client = client(&h).await;
        client.write_all(REQUEST).await.unwrap();
        let Cell::Relay(begin) = next_cell(&mut h).await else {
            panic!("expected BEGIN");
        };

        respond(&h, begin.stream, RelayPayload::BeginFailed);
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.stream_ids.in_use(), 0);
    }

    #[tokio::test]
    async fn test_client_close_sends_end() {
        let mut h = harness().await;
        h.routing.set_entry_forward(Hop::new(FIRST_HOP, 4)).await;

        let mut client = client(&h).await;
        client.write_all(REQUEST).await.unwrap();
        let Cell::Relay(begin) = next_cell(&mut h).await else {
            panic!("expected BEGIN");
        };

        drop(client);
        assert_eq!(
            next_cell(&mut h).await,
            Cell::relay(4, begin.stream, RelayPayload::End)
        );
    }

    #[tokio::test]
    async fn test_missing_host_is_rejected() {
        let h = harness().await;
        let mut client = client(&h).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lost_entry_circuit_drops_streams() {
        let mut h = harness().await;
        h.routing.set_entry_forward(Hop::new(FIRST_HOP, 4)).await;

        let mut client = client(&h).await;
        client.write_all(REQUEST).await.unwrap();
        next_cell(&mut h).await;

        h.routing.clear_entry_forward().await;
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }
}
