//! Transport protocols and the process-wide protocol preference.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Transport used to reach the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Datagram-based transport, preferred.
    Quic,
    /// Stream-based transport.
    Http2,
}

impl Protocol {
    /// The protocol to downgrade to, if any.
    pub const fn fallback(self) -> Option<Self> {
        match self {
            Self::Quic => Some(Self::Http2),
            Self::Http2 => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quic => write!(f, "quic"),
            Self::Http2 => write!(f, "http2"),
        }
    }
}

impl FromStr for Protocol {
    type Err = edgelink_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quic" => Ok(Self::Quic),
            "http2" => Ok(Self::Http2),
            other => Err(edgelink_core::Error::Config(format!(
                "Unknown protocol {other:?}, expected quic or http2"
            ))),
        }
    }
}

/// Source of the globally preferred protocol.
pub trait ProtocolSelector: Send + Sync + fmt::Debug {
    fn current(&self) -> Protocol;

    fn fallback(&self) -> Option<Protocol>;
}

/// Always the configured protocol.
#[derive(Debug, Clone, Copy)]
pub struct StaticProtocolSelector {
    current: Protocol,
}

impl StaticProtocolSelector {
    pub const fn new(current: Protocol) -> Self {
        Self { current }
    }
}

impl ProtocolSelector for StaticProtocolSelector {
    fn current(&self) -> Protocol {
        self.current
    }

    fn fallback(&self) -> Option<Protocol> {
        None
    }
}

/// Reports the share (0-100) of connections that should use QUIC.
pub trait PercentageFetcher: Send + Sync {
    fn fetch(&self) -> Result<i32, String>;
}

#[derive(Debug)]
struct AutoState {
    current: Protocol,
    refresh_after: Instant,
}

/// Prefers QUIC, falls back to HTTP/2, and optionally re-reads the
/// preference from a [`PercentageFetcher`] once `ttl` has passed.
pub struct AutoProtocolSelector {
    state: Mutex<AutoState>,
    threshold: i32,
    fetcher: Option<Arc<dyn PercentageFetcher>>,
    ttl: Duration,
}

impl fmt::Debug for AutoProtocolSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoProtocolSelector")
            .field("state", &self.state)
            .field("threshold", &self.threshold)
            .field("has_fetcher", &self.fetcher.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl AutoProtocolSelector {
    pub fn new(
        current: Protocol,
        threshold: i32,
        fetcher: Option<Arc<dyn PercentageFetcher>>,
        ttl: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(AutoState {
                current,
                refresh_after: Instant::now() + ttl,
            }),
            threshold,
            fetcher,
            ttl,
        }
    }

    const fn pick(threshold: i32, percentage: i32) -> Protocol {
        if threshold < percentage {
            Protocol::Quic
        } else {
            Protocol::Http2
        }
    }
}

impl ProtocolSelector for AutoProtocolSelector {
    fn current(&self) -> Protocol {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(fetcher) = &self.fetcher else {
            return state.current;
        };
        let now = Instant::now();
        if now < state.refresh_after {
            return state.current;
        }

        match fetcher.fetch() {
            Ok(percentage) => {
                let next = Self::pick(self.threshold, percentage);
                if next != state.current {
                    info!(from = %state.current, to = %next, "preferred protocol changed");
                }
                state.current = next;
                state.refresh_after = now + self.ttl;
            }
            Err(e) => warn!(error = %e, "failed to refresh protocol preference"),
        }
        state.current
    }

    fn fallback(&self) -> Option<Protocol> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .fallback()
    }
}

/// Build the selector for a configured protocol name.
///
/// `auto` consults `fetcher` once up front when one is given.
pub fn new_protocol_selector(
    name: &str,
    fetcher: Option<Arc<dyn PercentageFetcher>>,
    threshold: i32,
    ttl: Duration,
) -> edgelink_core::Result<Arc<dyn ProtocolSelector>> {
    if name != "auto" {
        let protocol: Protocol = name.parse()?;
        return Ok(Arc::new(StaticProtocolSelector::new(protocol)));
    }

    let initial = match fetcher.as_deref().map(PercentageFetcher::fetch) {
        Some(Ok(percentage)) => AutoProtocolSelector::pick(threshold, percentage),
        Some(Err(e)) => {
            warn!(error = %e, "failed to fetch protocol preference, using quic");
            Protocol::Quic
        }
        None => Protocol::Quic,
    };
    Ok(Arc::new(AutoProtocolSelector::new(
        initial, threshold, fetcher, ttl,
    )))
}
