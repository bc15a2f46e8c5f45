/*
    RouteTable - circuit forwarding table

    Stitches the two legs of every circuit that passes through this router.
    A leg is a (connection, circuit number) pair; circuit numbers are only
    unique per connection, so both parts are needed.

    Entries are installed in pairs by a successful EXTEND at this hop:

        (prev_conn, prev_circ) -> (next_conn, next_circ)
        (next_conn, next_circ) -> (prev_conn, prev_circ)

    and removed together when either leg is destroyed or its connection drops.
*/

use std::collections::HashMap;
use std::fmt;

use super::transport_manager::ConnId;
use crate::core_cell::CircuitId;

/// One leg of a circuit as seen from this router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    pub conn: ConnId,
    pub circuit: CircuitId,
}

impl Hop {
    pub fn new(conn: ConnId, circuit: CircuitId) -> Self {
        Self { conn, circuit }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/circ-{}", self.conn, self.circuit)
    }
}

#[derive(Debug, Default)]
pub struct ForwardingTable {
    entries: HashMap<Hop, Hop>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the one-directional entry `from -> to`.
    pub fn insert(&mut self, from: Hop, to: Hop) -> Option<Hop> {
        self.entries.insert(from, to)
    }

    pub fn get(&self, from: &Hop) -> Option<Hop> {
        self.entries.get(from).copied()
    }

    /// Remove `hop` and the reverse entry pointing back at it.
    ///
    /// Returns the other leg so the caller can tear it down as well.
    pub fn remove_circuit(&mut self, hop: Hop) -> Option<Hop> {
        let other = self.entries.remove(&hop)?;
        if self.entries.get(&other) == Some(&hop) {
            self.entries.remove(&other);
        }
        Some(other)
    }

    /// Remove every circuit with a leg on `conn`.
    ///
    /// Returns the surviving legs on other connections.
    pub fn remove_connection(&mut self, conn: ConnId) -> Vec<Hop> {
        let dead: Vec<Hop> = self
            .entries
            .keys()
            .filter(|hop| hop.conn == conn)
            .copied()
            .collect();

        let mut survivors = Vec::new();
        for hop in dead {
            if let Some(other) = self.remove_circuit(hop) {
                if other.conn != conn {
                    survivors.push(other);
                }
            }
        }
        survivors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
