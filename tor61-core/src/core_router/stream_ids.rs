//! Stream id allocation for streams originated by this node
//!
//! Shared by the proxy entrance and the entry circuit health probe so the two
//! never hand out the same id on the entry circuit.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::core_cell::StreamId;

#[derive(Debug)]
struct State {
    next: StreamId,
    in_use: HashSet<StreamId>,
}

#[derive(Debug)]
pub struct StreamIds {
    state: Mutex<State>,
}

impl Default for StreamIds {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIds {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next: 1,
                in_use: HashSet::new(),
            }),
        }
    }

    /// Next free id, never 0. `None` only when every id is taken.
    pub fn allocate(&self) -> Option<StreamId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_use.len() >= usize::from(StreamId::MAX) {
            return None;
        }
        loop {
            let candidate = state.next;
            state.next = if candidate == StreamId::MAX { 1 } else { candidate + 1 };
            if state.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn release(&self, id: StreamId) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .remove(&id);
    }

    pub fn in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .len()
    }
}
