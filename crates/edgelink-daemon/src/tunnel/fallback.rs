use tokio::time::Instant;
use tracing::{info, warn};

use super::protocol::{Protocol, ProtocolSelector};
use super::session::SessionError;
use crate::retry::BackoffHandler;

/// Per-slot backoff plus the protocol the slot is currently using.
///
/// While not in fallback the protocol follows the global preference. After
/// a fallback it stays pinned until the slot connects again.
#[derive(Debug, Clone)]
pub struct ProtocolFallback {
    backoff: BackoffHandler,
    protocol: Protocol,
    in_fallback: bool,
}

impl ProtocolFallback {
    pub const fn new(backoff: BackoffHandler, protocol: Protocol) -> Self {
        Self {
            backoff,
            protocol,
            in_fallback: false,
        }
    }

    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub const fn in_fallback(&self) -> bool {
        self.in_fallback
    }

    pub const fn backoff(&self) -> &BackoffHandler {
        &self.backoff
    }

    pub const fn backoff_mut(&mut self) -> &mut BackoffHandler {
        &mut self.backoff
    }

    /// The slot connected: forget past failures.
    pub fn reset(&mut self) {
        self.backoff.reset_now(Instant::now());
        self.in_fallback = false;
    }

    pub fn fallback(&mut self, protocol: Protocol) {
        self.backoff.reset_now(Instant::now());
        self.protocol = protocol;
        self.in_fallback = true;
    }

    /// Pick the protocol for the next attempt after a failure.
    ///
    /// Returns false when the slot is out of options and should stop.
    pub fn select_next_protocol(
        &mut self,
        selector: &dyn ProtocolSelector,
        cause: Option<&SessionError>,
        conn_index: usize,
    ) -> bool {
        let transport_broken = cause.is_some_and(SessionError::is_network_activity_timeout);
        let fallback = selector.fallback();

        if self.backoff.reached_max_retries() || (fallback.is_some() && transport_broken) {
            if transport_broken {
                warn!(
                    conn_index,
                    "If this persists, egress UDP to the edge is likely blocked or dropped on this network"
                );
            }
            let Some(fallback) = fallback else {
                return false;
            };
            if self.protocol == fallback {
                return false;
            }
            info!(conn_index, protocol = %fallback, "Switching to fallback protocol");
            self.fallback(fallback);
        } else if !self.in_fallback {
            let current = selector.current();
            if self.protocol != current {
                info!(conn_index, protocol = %current, "Changing protocol");
                self.protocol = current;
            }
        }
        true
    }
}
