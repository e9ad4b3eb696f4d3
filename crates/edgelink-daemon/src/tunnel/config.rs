//! Supervisor configuration.

use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use edgelink_core::TunnelSettings;

use super::addr_handler::{EdgeAddrHandler, addr_handler_for};
use crate::edge::ConfigIpVersion;
use crate::retry::BackoffHandler;

/// Base delay of the supervisor's shared restart backoff.
pub const TUNNEL_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Configuration for the HA connection supervisor.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Number of connections to keep open. Clamped to the pool size.
    pub ha_connections: usize,

    /// Retries per backoff cycle, for slots and the shared restart timer.
    pub retries: u32,

    pub edge_ip_version: ConfigIpVersion,

    /// Addresses come from a fixed list rather than discovery. Slots then
    /// keep retrying even when the pool runs dry.
    pub static_edge: bool,

    /// Spacing between starting connections after the first one.
    pub registration_interval: Duration,

    /// How long to wait for in-flight sessions after a graceful shutdown.
    pub grace_period: Duration,

    /// Base delay of each slot's own backoff.
    pub slot_retry_base: Duration,

    /// Base delay of the shared restart backoff.
    pub supervisor_retry_base: Duration,

    /// Seeds every jitter source, for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::from_settings(&TunnelSettings::default())
    }
}

impl TunnelConfig {
    /// Build from loaded settings. Unknown IP versions fall back to `auto`;
    /// settings are validated when loaded.
    pub fn from_settings(settings: &TunnelSettings) -> Self {
        Self {
            ha_connections: settings.ha_connections,
            retries: settings.retries,
            edge_ip_version: settings.edge_ip_version.parse().unwrap_or_default(),
            static_edge: !settings.edge_addrs.is_empty(),
            registration_interval: settings.registration_interval(),
            grace_period: settings.grace_period(),
            slot_retry_base: crate::retry::DEFAULT_BASE_TIME,
            supervisor_retry_base: TUNNEL_RETRY_DURATION,
            seed: None,
        }
    }

    /// A jitter source for stream `salt`, seeded if configured.
    pub fn rng(&self, salt: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(salt)),
            None => StdRng::from_entropy(),
        }
    }

    /// Backoff owned by one slot.
    pub fn slot_backoff(&self, conn_index: usize) -> BackoffHandler {
        BackoffHandler::new(self.retries, self.slot_retry_base, false)
            .with_rng(self.rng(conn_index as u64 + 1))
    }

    /// Backoff shared by all slots waiting to restart.
    pub fn supervisor_backoff(&self) -> BackoffHandler {
        BackoffHandler::new(self.retries, self.supervisor_retry_base, true).with_rng(self.rng(0))
    }

    pub fn addr_handler(&self) -> Box<dyn EdgeAddrHandler> {
        addr_handler_for(self.edge_ip_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_default_settings() {
        let config = TunnelConfig::default();
        assert_eq!(config.ha_connections, 4);
        assert_eq!(config.retries, 5);
        assert_eq!(config.edge_ip_version, ConfigIpVersion::Auto);
        assert!(!config.static_edge);
        assert_eq!(config.registration_interval, Duration::from_secs(1));
        assert_eq!(config.supervisor_retry_base, Duration::from_secs(10));
    }

    #[test]
    fn edge_list_makes_static_edge() {
        let settings = TunnelSettings {
            edge_addrs: vec!["10.0.0.1:7844".into()],
            edge_ip_version: "6".into(),
            ..Default::default()
        };
        let config = TunnelConfig::from_settings(&settings);
        assert!(config.static_edge);
        assert_eq!(config.edge_ip_version, ConfigIpVersion::Ipv6Only);
    }

    #[test]
    fn seeded_backoffs_are_reproducible() {
        let config = TunnelConfig {
            seed: Some(9),
            ..Default::default()
        };
        let now = tokio::time::Instant::now();
        let a = config.slot_backoff(1).arm(now);
        let b = config.slot_backoff(1).arm(now);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn slot_backoff_gives_up_supervisor_backoff_does_not() {
        let config = TunnelConfig {
            retries: 0,
            ..Default::default()
        };
        let now = tokio::time::Instant::now();
        assert!(config.slot_backoff(0).arm(now).is_none());
        assert!(config.supervisor_backoff().arm(now).is_some());
    }
}
