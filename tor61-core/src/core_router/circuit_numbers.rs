//! Circuit number allocation
//!
//! Both ends of a connection can originate circuits, so the number space of
//! every connection is split by parity: the side that accepted the OPEN uses
//! odd numbers, the side that initiated the connection uses even numbers.
//! Counters wrap before leaving the 16 bit wire range and never produce 0.

use std::collections::HashMap;
use std::sync::Arc;

use super::transport_manager::ConnId;
use crate::core_cell::CircuitId;

/// Largest value a counter may reach before it wraps.
pub const DEFAULT_CEILING: u32 = u16::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// We answered the peer's OPEN
    Odd,
    /// We sent the OPEN
    Even,
}

/// Per-connection odd/even counters
#[derive(Debug, Clone)]
pub struct CircuitNumbers {
    next_odd: u32,
    next_even: u32,
    ceiling: u32,
}

impl Default for CircuitNumbers {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitNumbers {
    pub fn new() -> Self {
        Self::with_ceiling(DEFAULT_CEILING)
    }

    /// Counters that wrap once the next value would reach `ceiling`.
    pub fn with_ceiling(ceiling: u32) -> Self {
        Self {
            next_odd: 1,
            next_even: 2,
            ceiling: ceiling.clamp(3, DEFAULT_CEILING),
        }
    }

    pub fn next(&mut self, parity: Parity) -> CircuitId {
        let (counter, start) = match parity {
            Parity::Odd => (&mut self.next_odd, 1),
            Parity::Even => (&mut self.next_even, 2),
        };
        let allocated = *counter;
        *counter += 2;
        if *counter >= self.ceiling {
            *counter = start;
        }
        allocated as CircuitId
    }
}

/// Builds the counters for every newly registered connection.
pub type AllocatorFactory = Arc<dyn Fn() -> CircuitNumbers + Send + Sync>;

#[derive(Debug)]
struct Link {
    addr: Option<String>,
    parity: Parity,
    numbers: CircuitNumbers,
}

/// Peer connections known to the circuit manager
///
/// Outbound links are indexed by `host:port` so later extensions to the same
/// router reuse them.
pub struct ConnectionBook {
    links: HashMap<ConnId, Link>,
    by_addr: HashMap<String, ConnId>,
    factory: AllocatorFactory,
}

impl Default for ConnectionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBook {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(CircuitNumbers::new))
    }

    pub fn with_allocator(factory: AllocatorFactory) -> Self {
        Self {
            links: HashMap::new(),
            by_addr: HashMap::new(),
            factory,
        }
    }

    /// Record a connection we initiated to `addr`.
    pub fn register_initiated(&mut self, addr: &str, conn: ConnId) {
        self.by_addr.insert(addr.to_string(), conn);
        self.links.insert(
            conn,
            Link {
                addr: Some(addr.to_string()),
                parity: Parity::Even,
                numbers: (self.factory)(),
            },
        );
    }

    /// Record a connection whose OPEN we answered.
    pub fn register_accepted(&mut self, conn: ConnId) {
        self.links.entry(conn).or_insert_with(|| Link {
            addr: None,
            parity: Parity::Odd,
            numbers: (self.factory)(),
        });
    }

    pub fn lookup(&self, addr: &str) -> Option<ConnId> {
        self.by_addr.get(addr).copied()
    }

    pub fn parity(&self, conn: ConnId) -> Option<Parity> {
        self.links.get(&conn).map(|link| link.parity)
    }

    /// Allocate the next circuit number this side may originate on `conn`.
    pub fn next_circuit(&mut self, conn: ConnId) -> Option<CircuitId> {
        let link = self.links.get_mut(&conn)?;
        Some(link.numbers.next(link.parity))
    }

    /// Forget `conn`. Returns true when it was known.
    pub fn remove(&mut self, conn: ConnId) -> bool {
        match self.links.remove(&conn) {
            Some(link) => {
                if let Some(addr) = link.addr {
                    if self.by_addr.get(&addr) == Some(&conn) {
                        self.by_addr.remove(&addr);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_odd_sequence_increases_by_two() {
        let mut numbers = CircuitNumbers::new();
        let allocated: Vec<CircuitId> = (0..5).map(|_| numbers.next(Parity::Odd)).collect();
        assert_eq!(allocated, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_even_sequence_starts_at_two() {
        let mut numbers = CircuitNumbers::new();
        let allocated: Vec<CircuitId> = (0..3).map(|_| numbers.next(Parity::Even)).collect();
        assert_eq!(allocated, vec![2, 4, 6]);
    }

    #[test]
    fn test_wraparound_before_ceiling() {
        let mut numbers = CircuitNumbers::with_ceiling(10);
        let odd: Vec<CircuitId> = (0..6).map(|_| numbers.next(Parity::Odd)).collect();
        assert_eq!(odd, vec![1, 3, 5, 7, 9, 1]);

        let even: Vec<CircuitId> = (0..5).map(|_| numbers.next(Parity::Even)).collect();
        assert_eq!(even, vec![2, 4, 6, 8, 2]);
    }

    #[test]
    fn test_default_stays_within_wire_range() {
        let mut numbers = CircuitNumbers::new();
        let mut last = 0;
        for _ in 0..40_000 {
            let n = numbers.next(Parity::Odd);
            assert_ne!(n, 0);
            if n < last {
                assert_eq!(n, 1);
                assert_eq!(last, 65533);
            }
            last = n;
        }
    }

    #[test]
    fn test_book_parity_follows_who_opened() {
        let mut book = ConnectionBook::new();
        book.register_initiated("10.0.0.1:4000", ConnId(1));
        book.register_accepted(ConnId(2));

        assert_eq!(book.next_circuit(ConnId(1)), Some(2));
        assert_eq!(book.next_circuit(ConnId(1)), Some(4));
        assert_eq!(book.next_circuit(ConnId(2)), Some(1));
        assert_eq!(book.next_circuit(ConnId(3)), None);
        assert_eq!(book.lookup("10.0.0.1:4000"), Some(ConnId(1)));
    }

    #[test]
    fn test_book_remove_forgets_address() {
        let mut book = ConnectionBook::new();
        book.register_initiated("10.0.0.1:4000", ConnId(1));
        assert!(book.remove(ConnId(1)));
        assert_eq!(book.lookup("10.0.0.1:4000"), None);
        assert!(!book.remove(ConnId(1)));
        assert!(book.is_empty());
    }

    #[test]
    fn test_injected_allocator() {
        let mut book =
            ConnectionBook::with_allocator(Arc::new(|| CircuitNumbers::with_ceiling(6)));
        book.register_initiated("h:1", ConnId(1));
        let seq: Vec<_> = (0..3).map(|_| book.next_circuit(ConnId(1)).unwrap()).collect();
        assert_eq!(seq, vec![2, 4, 2]);
    }

    proptest! {
        #[test]
        fn prop_parities_never_collide(ceiling in 3u32..200, draws in 1usize..500) {
            let mut numbers = CircuitNumbers::with_ceiling(ceiling);
            for _ in 0..draws {
                let odd = numbers.next(Parity::Odd);
                let even = numbers.next(Parity::Even);
                prop_assert_eq!(odd % 2, 1);
                prop_assert_eq!(even % 2, 0);
                prop_assert!(even != 0);
            }
        }
    }
}
