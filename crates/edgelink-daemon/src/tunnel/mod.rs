//! HA tunnel connections to the edge.
//!
//! A [`Supervisor`] keeps several sessions open at once, each in its own
//! slot. Slots pick addresses from the shared [`crate::edge::Edge`] pool,
//! back off and fall back between protocols on failure, and are restarted
//! until they run out of options.

pub mod addr_handler;
pub mod config;
pub mod error;
pub mod fallback;
pub mod protocol;
pub mod server;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod tracker;

pub use addr_handler::{AddrDecision, DefaultAddrFallback, EdgeAddrHandler, IpAddrFallback};
pub use config::TunnelConfig;
pub use error::TunnelError;
pub use fallback::ProtocolFallback;
pub use protocol::{
    AutoProtocolSelector, PercentageFetcher, Protocol, ProtocolSelector, StaticProtocolSelector,
    new_protocol_selector,
};
pub use server::{EdgeTunnelServer, Slot};
pub use session::{ReconnectSignal, SessionConnector, SessionError, SessionParams};
pub use signal::ConnectedSignal;
pub use supervisor::Supervisor;
pub use tracker::ConnTracker;
