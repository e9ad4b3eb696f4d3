//! Contract between the supervisor and a session implementation.
//!
//! A session runs the transport and registration handshake for one slot
//! against one edge address. It reports how it ended through the closed
//! [`SessionError`] set so the supervisor never inspects error internals.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::protocol::Protocol;
use super::signal::ConnectedSignal;
use crate::edge::EdgeAddr;

/// Request to restart a session cleanly after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectSignal {
    pub delay: Duration,
}

impl ReconnectSignal {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub async fn delay_before_reconnect(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// How a session ended, other than a clean stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Reconnect requested, restarting in {:?}", .0.delay)]
    Reconnect(ReconnectSignal),

    /// Another connection is already registered through this address.
    #[error("Duplicate connection registration: {0}")]
    DuplicateRegistration(String),

    #[error("Server rejected registration: {cause}")]
    ServerRegistration { cause: String, permanent: bool },

    /// No traffic within the keepalive window.
    #[error("Idle timeout: {0}")]
    IdleTimeout(String),

    /// The datagram path is firewalled locally.
    #[error("Egress blocked: {0}")]
    EgressBlocked(String),

    #[error("Failed to dial edge: {0}")]
    Dial(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),

    #[error("Session panicked: {0}")]
    Panicked(String),

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    /// Whether the slot may retry after this error.
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::DuplicateRegistration(_) | Self::Unrecoverable(_) | Self::Cancelled => false,
            Self::ServerRegistration { permanent, .. } => !*permanent,
            Self::Reconnect(_)
            | Self::IdleTimeout(_)
            | Self::EgressBlocked(_)
            | Self::Dial(_)
            | Self::Transport(_)
            | Self::Panicked(_) => true,
        }
    }

    /// Failures that point at the datagram transport itself.
    pub const fn is_network_activity_timeout(&self) -> bool {
        matches!(self, Self::IdleTimeout(_) | Self::EgressBlocked(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::ServerRegistration { cause, .. } if cause.contains("Unauthorized"))
    }
}

/// Everything a session needs for one attempt.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub conn_index: usize,
    pub addr: EdgeAddr,
    pub protocol: Protocol,
    /// Failed attempts since the slot last connected.
    pub previous_attempts: u32,
    /// Must be notified once registration succeeds.
    pub connected: ConnectedSignal,
    pub cancel: CancellationToken,
    /// Flips to `true` when a graceful shutdown starts.
    pub shutdown: watch::Receiver<bool>,
}

/// Runs one session until it stops.
///
/// `Ok(())` means a clean stop, e.g. after a graceful shutdown.
pub trait SessionConnector: Send + Sync + 'static {
    fn serve(&self, params: SessionParams) -> impl Future<Output = Result<(), SessionError>> + Send;
}
