/*
  TransportManager - raw TCP transport

  Owns every socket the router uses: peer links carrying cells, and the plain
  byte streams of the exit (remote servers) and the entrance (proxy clients).
  Connection ids are opaque and never reused within a process.

  Framing:
    FrameMode::Cells -> the reader task re-chunks the byte stream into exact
                        512 byte frames (read_exact), one event per frame.
    FrameMode::Raw   -> whatever the socket returns is forwarded as-is.

  Each listener and connection is given an event sink when it is created, so
  peer traffic, exit sockets and proxy clients land in different consumers.

┌─────────────────────────────────────────────────────────┐
│                   TransportManager                       │
├─────────────────────────────────────────────────────────┤
│  Calls in:                                               │
│    • listen(port, mode, sink)  ──► Spawn accept task     │
│    • connect(host, port, ..)   ──► Dial + reader task    │
│    • write(conn, bytes)        ──► Write to socket       │
│    • close(conn)               ──► Shutdown socket       │
│                                                           │
│  Events out (per sink):                                  │
│    • Accepted{listener, conn, remote}                    │
│    • Frame{conn, frame}   (Cells)                        │
│    • Data{conn, bytes}    (Raw)                          │
│    • Closed{conn}         remote end closed or failed    │
└─────────────────────────────────────────────────────────┘

  close() is a local decision and does not emit Closed.
*/
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::error::RouterError;
use crate::core_cell::{RawCell, CELL_SIZE};

const RAW_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Cells,
    Raw,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Accepted {
        listener: ListenerId,
        conn: ConnId,
        remote: SocketAddr,
    },
    Frame {
        conn: ConnId,
        frame: Box<RawCell>,
    },
    Data {
        conn: ConnId,
        bytes: Vec<u8>,
    },
    Closed {
        conn: ConnId,
    },
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
    remote: SocketAddr,
}

type ConnectionMap = Arc<Mutex<HashMap<ConnId, Connection>>>;

pub struct TransportManager {
    connections: ConnectionMap,
    listeners: Mutex<HashMap<ListenerId, JoinHandle<()>>>,
    next_id: Arc<AtomicU64>,
    connect_timeout: Duration,
}

impl TransportManager {
    pub fn new(connect_timeout: Duration) -> Self {
        TransportManager {
            connections: Arc::new(Mutex::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            connect_timeout,
        }
    }

    /// Listen on `port` (0 picks an ephemeral port) on all interfaces.
    ///
    /// Returns the listener id and the port actually bound.
    pub async fn listen(
        &self,
        port: u16,
        mode: FrameMode,
        sink: EventSink,
    ) -> Result<(ListenerId, u16), RouterError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| RouterError::Transport(format!("failed to bind port {}: {}", port, e)))?;
        let bound = listener.local_addr()?.port();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let connections = self.connections.clone();
        let next_id = self.next_id.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, remote)) => {
                        let conn = ConnId(next_id.fetch_add(1, Ordering::SeqCst));
                        debug!(%conn, %remote, port = bound, "accepted connection");
                        if sink
                            .send(TransportEvent::Accepted {
                                listener: id,
                                conn,
                                remote,
                            })
                            .is_err()
                        {
                            break;
                        }
                        register(&connections, conn, socket, remote, mode, sink.clone()).await;
                    }
                    Err(e) => {
                        warn!(port = bound, error = %e, "failed to accept connection");
                    }
                }
            }
        });

        self.listeners.lock().await.insert(id, task);
        debug!(port = bound, ?mode, "listening");
        Ok((id, bound))
    }

    /// Dial `host:port`, bounded by the configured connect timeout.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        mode: FrameMode,
        sink: EventSink,
    ) -> Result<ConnId, RouterError> {
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RouterError::Transport(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| RouterError::Transport(format!("connect to {}:{} failed: {}", host, port, e)))?;
        let remote = socket.peer_addr()?;
        let conn = ConnId(self.next_id.fetch_add(1, Ordering::SeqCst));

        register(&self.connections, conn, socket, remote, mode, sink).await;
        debug!(%conn, %remote, "connected");
        Ok(conn)
    }

    pub async fn write(&self, conn: ConnId, bytes: &[u8]) -> Result<(), RouterError> {
        let writer = self
            .connections
            .lock()
            .await
            .get(&conn)
            .map(|c| c.writer.clone())
            .ok_or(RouterError::ConnectionNotFound(conn))?;

        let mut writer = writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| RouterError::Transport(format!("write to {} failed: {}", conn, e)))
    }

    /// Close a connection. Unknown ids are ignored.
    pub async fn close(&self, conn: ConnId) {
        let removed = self.connections.lock().await.remove(&conn);
        if let Some(connection) = removed {
            connection.reader.abort();
            let _ = connection.writer.lock().await.shutdown().await;
            debug!(%conn, "closed connection");
        }
    }

    pub async fn close_listener(&self, id: ListenerId) {
        if let Some(task) = self.listeners.lock().await.remove(&id) {
            task.abort();
        }
    }

    pub async fn remote_addr(&self, conn: ConnId) -> Option<SocketAddr> {
        self.connections.lock().await.get(&conn).map(|c| c.remote)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stop every listener and close every connection.
    pub async fn shutdown(&self) {
        for (_, task) in self.listeners.lock().await.drain() {
            task.abort();
        }
        let drained: Vec<(ConnId, Connection)> = self.connections.lock().await.drain().collect();
        for (_, connection) in drained {
            connection.reader.abort();
            let _ = connection.writer.lock().await.shutdown().await;
        }
    }
}

async fn register(
    connections: &ConnectionMap,
    conn: ConnId,
    socket: TcpStream,
    remote: SocketAddr,
    mode: FrameMode,
    sink: EventSink,
) {
    let _ = socket.set_nodelay(true);
    let (reader, writer) = socket.into_split();

    // Hold the map while spawning so the reader cannot try to remove the
    // connection before it has been inserted.
    let mut map = connections.lock().await;
    let reader = tokio::spawn(read_loop(conn, reader, mode, sink, connections.clone()));
    map.insert(
        conn,
        Connection {
            writer: Arc::new(Mutex::new(writer)),
            reader,
            remote,
        },
    );
}

async fn read_loop(
    conn: ConnId,
    mut reader: OwnedReadHalf,
    mode: FrameMode,
    sink: EventSink,
    connections: ConnectionMap,
) {
    match mode {
        FrameMode::Cells => loop {
            let mut frame = Box::new([0u8; CELL_SIZE]);
            match reader.read_exact(&mut frame[..]).await {
                Ok(_) => {
                    trace!(%conn, "frame received");
                    if sink.send(TransportEvent::Frame { conn, frame }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(%conn, error = %e, "cell stream ended");
                    break;
                }
            }
        },
        FrameMode::Raw => {
            let mut buf = vec![0u8; RAW_READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let bytes = buf[..n].to_vec();
                        if sink.send(TransportEvent::Data { conn, bytes }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%conn, error = %e, "byte stream ended");
                        break;
                    }
                }
            }
        }
    }

    if connections.lock().await.remove(&conn).is_some() {
        let _ = sink.send(TransportEvent::Closed { conn });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_cell::{Cell, CellType};
    use crate::test_utils::recv_unbounded_timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager() -> TransportManager {
        TransportManager::new(Duration::from_secs(3))
    }

    async fn accepted(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> ConnId {
        match recv_unbounded_timeout(rx, WAIT).await.unwrap() {
            TransportEvent::Accepted { conn, .. } => conn,
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listen_reports_bound_port() {
        let transport = manager();
        let (sink, _rx) = mpsc::unbounded_channel();
        let (_, port) = transport.listen(0, FrameMode::Cells, sink).await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_cells_are_framed_exactly() {
        let transport = manager();
        let (server_sink, mut server_rx) = mpsc::unbounded_channel();
        let (_, port) = transport.listen(0, FrameMode::Cells, server_sink).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let conn = accepted(&mut server_rx).await;

        let first = Cell::control(CellType::Create, 2).unwrap().encode().unwrap();
        let second = Cell::control(CellType::Destroy, 2).unwrap().encode().unwrap();
        let mut bytes = first.to_vec();
        bytes.extend_from_slice(&second);

        // Arbitrary chunking on the wire must not matter.
        client.write_all(&bytes[..100]).await.unwrap();
        client.write_all(&bytes[100..700]).await.unwrap();
        client.write_all(&bytes[700..]).await.unwrap();

        for expected in [first, second] {
            match recv_unbounded_timeout(&mut server_rx, WAIT).await.unwrap() {
                TransportEvent::Frame { conn: from, frame } => {
                    assert_eq!(from, conn);
                    assert_eq!(*frame, expected);
                }
                other => panic!("expected Frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_write_and_remote_close() {
        let transport = manager();
        let (server_sink, mut server_rx) = mpsc::unbounded_channel();
        let (_, port) = transport.listen(0, FrameMode::Raw, server_sink).await.unwrap();

        let (client_sink, _client_rx) = mpsc::unbounded_channel();
        let client = transport
            .connect("127.0.0.1", port, FrameMode::Raw, client_sink)
            .await
            .unwrap();
        let server_side = accepted(&mut server_rx).await;
        assert!(transport.remote_addr(client).await.is_some());

        transport.write(client, b"hello").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 5 {
            match recv_unbounded_timeout(&mut server_rx, WAIT).await.unwrap() {
                TransportEvent::Data { conn, bytes } => {
                    assert_eq!(conn, server_side);
                    received.extend(bytes);
                }
                other => panic!("expected Data, got {:?}", other),
            }
        }
        assert_eq!(received, b"hello");

        // Local close on the client side is seen as a remote close by the server.
        transport.close(client).await;
        match recv_unbounded_timeout(&mut server_rx, WAIT).await.unwrap() {
            TransportEvent::Closed { conn } => assert_eq!(conn, server_side),
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(matches!(
            transport.write(client, b"x").await,
            Err(RouterError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = manager();
        let (sink, _rx) = mpsc::unbounded_channel();

        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = transport.connect("127.0.0.1", port, FrameMode::Cells, sink).await;
        assert!(matches!(result, Err(RouterError::Transport(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let transport = manager();
        let (sink, mut rx) = mpsc::unbounded_channel();
        let (_, port) = transport.listen(0, FrameMode::Cells, sink.clone()).await.unwrap();
        transport
            .connect("127.0.0.1", port, FrameMode::Cells, sink)
            .await
            .unwrap();
        let _ = accepted(&mut rx).await;

        transport.shutdown().await;
        assert_eq!(transport.connection_count().await, 0);
    }
}
