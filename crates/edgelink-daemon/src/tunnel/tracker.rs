use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::protocol::Protocol;

/// Which slots are connected, and with what protocol.
#[derive(Debug, Default)]
pub struct ConnTracker {
    connections: Mutex<HashMap<usize, Protocol>>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self, conn_index: usize, protocol: Protocol) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_index, protocol);
    }

    pub fn on_disconnected(&self, conn_index: usize) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_index);
    }

    /// True if any slot is currently connected with `protocol`.
    pub fn has_connected_with(&self, protocol: Protocol) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|p| *p == protocol)
    }

    pub fn protocol_of(&self, conn_index: usize) -> Option<Protocol> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conn_index)
            .copied()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
