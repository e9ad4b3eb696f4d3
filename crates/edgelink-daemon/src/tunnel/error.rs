//! Errors a connection slot reports to the supervisor.

use super::session::SessionError;
use crate::edge::EdgeError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Edge(#[from] EdgeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Retries and protocol fallbacks are used up.
    #[error("Giving up on connection: {0}")]
    FallbackExhausted(#[source] SessionError),

    #[error("Tunnel cancelled")]
    Cancelled,

    #[error("Graceful shutdown requested before the tunnel connected")]
    EarlyShutdown,
}

impl TunnelError {
    pub const fn is_reconnect(&self) -> bool {
        matches!(self, Self::Session(SessionError::Reconnect(_)))
    }

    pub const fn session(&self) -> Option<&SessionError> {
        match self {
            Self::Session(e) | Self::FallbackExhausted(e) => Some(e),
            _ => None,
        }
    }
}
