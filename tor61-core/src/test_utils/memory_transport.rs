//! In-memory cell transport
//!
//! Records every connect, write and close so tests can assert on the cells a
//! component sent. Written bytes are also pushed to a channel so a test can
//! play the remote side.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use std::sync::Arc;

use crate::core_cell::Cell;
use crate::core_router::{CellTransport, ConnId, RouterError};

#[derive(Default)]
struct Record {
    connects: Vec<(String, u16, ConnId)>,
    writes: Vec<(ConnId, Vec<u8>)>,
    closed: Vec<ConnId>,
    refused: HashSet<String>,
}

pub struct MemoryTransport {
    next_conn: AtomicU64,
    record: Mutex<Record>,
    tx: mpsc::UnboundedSender<(ConnId, Vec<u8>)>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ConnId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            next_conn: AtomicU64::new(1),
            record: Mutex::new(Record::default()),
            tx,
        });
        (transport, rx)
    }

    fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make connects to `host:port` fail.
    pub fn refuse(&self, addr: &str) {
        self.record().refused.insert(addr.to_string());
    }

    pub fn connects(&self) -> Vec<(String, u16, ConnId)> {
        self.record().connects.clone()
    }

    pub fn writes(&self) -> Vec<(ConnId, Vec<u8>)> {
        self.record().writes.clone()
    }

    pub fn closed(&self) -> Vec<ConnId> {
        self.record().closed.clone()
    }
}

#[async_trait]
impl CellTransport for MemoryTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<ConnId, RouterError> {
        let addr = format!("{}:{}", host, port);
        let mut record = self.record();
        if record.refused.contains(&addr) {
            return Err(RouterError::Transport(format!("{}: connection refused", addr)));
        }
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        record.connects.push((host.to_string(), port, conn));
        Ok(conn)
    }

    async fn write(&self, conn: ConnId, bytes: &[u8]) -> Result<(), RouterError> {
        if self.record().closed.contains(&conn) {
            return Err(RouterError::ConnectionNotFound(conn));
        }
        self.record().writes.push((conn, bytes.to_vec()));
        let _ = self.tx.send((conn, bytes.to_vec()));
        Ok(())
    }

    async fn close(&self, conn: ConnId) {
        self.record().closed.push(conn);
    }
}

/// Decode a frame captured by [`MemoryTransport`], panicking on garbage.
pub fn decode_written(bytes: &[u8]) -> Cell {
    match Cell::decode(bytes) {
        Ok(cell) => cell,
        Err(e) => panic!("transport carried an undecodable frame: {}", e),
    }
}
