//! Policies deciding when a slot should move to a different edge address.

use super::session::SessionError;
use crate::edge::ConfigIpVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrDecision {
    pub needs_new_address: bool,
    /// Feeds the region's IP family hysteresis on give-back.
    pub is_connectivity_error: bool,
}

impl AddrDecision {
    const KEEP: Self = Self {
        needs_new_address: false,
        is_connectivity_error: false,
    };
    const ROTATE: Self = Self {
        needs_new_address: true,
        is_connectivity_error: false,
    };
    const ROTATE_CONNECTIVITY: Self = Self {
        needs_new_address: true,
        is_connectivity_error: true,
    };
}

pub trait EdgeAddrHandler: Send + std::fmt::Debug {
    fn should_get_new_address(&mut self, err: Option<&SessionError>) -> AddrDecision;
}

/// Conservative: rotates on duplicate registration right away, on
/// dial or idle failures only after two in a row. Never reports
/// connectivity errors.
#[derive(Debug, Default)]
pub struct DefaultAddrFallback {
    edge_errors: u32,
}

impl EdgeAddrHandler for DefaultAddrFallback {
    fn should_get_new_address(&mut self, err: Option<&SessionError>) -> AddrDecision {
        match err {
            Some(SessionError::DuplicateRegistration(_)) => AddrDecision::ROTATE,
            Some(
                SessionError::IdleTimeout(_)
                | SessionError::Dial(_)
                | SessionError::EgressBlocked(_),
            ) => {
                self.edge_errors += 1;
                if self.edge_errors >= 2 {
                    self.edge_errors = 0;
                    AddrDecision::ROTATE
                } else {
                    AddrDecision::KEEP
                }
            }
            _ => {
                self.edge_errors = 0;
                AddrDecision::KEEP
            }
        }
    }
}

/// Aggressive: rotates immediately and flags network failures as
/// connectivity errors so regions can switch IP family.
#[derive(Debug, Default)]
pub struct IpAddrFallback;

impl EdgeAddrHandler for IpAddrFallback {
    fn should_get_new_address(&mut self, err: Option<&SessionError>) -> AddrDecision {
        match err {
            Some(SessionError::DuplicateRegistration(_) | SessionError::IdleTimeout(_)) => {
                AddrDecision::ROTATE
            }
            Some(SessionError::Dial(_) | SessionError::EgressBlocked(_)) => {
                AddrDecision::ROTATE_CONNECTIVITY
            }
            _ => AddrDecision::KEEP,
        }
    }
}

/// Family hysteresis only makes sense when both families are allowed.
pub fn addr_handler_for(ip_version: ConfigIpVersion) -> Box<dyn EdgeAddrHandler> {
    match ip_version {
        ConfigIpVersion::Auto => Box::new(IpAddrFallback),
        ConfigIpVersion::Ipv4Only | ConfigIpVersion::Ipv6Only => {
            Box::new(DefaultAddrFallback::default())
        }
    }
}
