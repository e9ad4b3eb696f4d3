//! Edge address pool.
//!
//! Discovered edge addresses are split into two redundant regions, each
//! further split by IP family. [`Edge`] hands addresses out to connection
//! slots and takes them back, keeping both regions evenly loaded.

pub mod addr;
pub mod discovery;
pub mod region;
pub mod regions;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

pub use addr::{AddrSet, ConfigIpVersion, EdgeAddr, IpVersion, UsedBy};
pub use discovery::{
    DEFAULT_DISCOVERY_DOMAIN, Discoverer, HostnameDiscovery, regional_service_name, resolve_addrs,
};
pub use region::Region;
pub use regions::Regions;

/// Errors raised by the edge address pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EdgeError {
    #[error("There are no free edge addresses left")]
    NoAddressesLeft,

    #[error("Edge discovery for {service} failed: {reason}")]
    Discovery { service: String, reason: String },

    #[error("Edge discovery returned {0} address groups, need at least 2")]
    TooFewRegions(usize),

    #[error("Failed to resolve any edge address")]
    NoStaticAddresses,
}

/// Thread-safe edge address pool shared by all connection slots.
#[derive(Debug)]
pub struct Edge {
    regions: Mutex<Regions>,
}

impl Edge {
    pub const fn from_regions(regions: Regions) -> Self {
        Self {
            regions: Mutex::new(regions),
        }
    }

    /// Discover the edge through `discoverer`.
    pub async fn resolve<D: Discoverer>(
        discoverer: &D,
        region: Option<&str>,
        ip_version: ConfigIpVersion,
        cooldown: Duration,
    ) -> Result<Self, EdgeError> {
        let service = regional_service_name(region);
        let groups = discoverer.discover(&service).await?;
        debug!(
            service = %service,
            groups = groups.len(),
            "edge discovery finished"
        );
        let regions = Regions::from_groups(&groups, ip_version)?.with_cooldown(cooldown);
        Ok(Self::from_regions(regions))
    }

    /// Use a fixed list of addresses instead of discovery.
    pub fn static_edge(addrs: &[EdgeAddr]) -> Result<Self, EdgeError> {
        if addrs.is_empty() {
            return Err(EdgeError::NoStaticAddresses);
        }
        Ok(Self::from_regions(Regions::new_no_resolve(addrs)))
    }

    fn lock(&self) -> MutexGuard<'_, Regions> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Any address, without allocating it. For one-off lookups.
    pub fn get_addr_for_rpc(&self) -> Result<EdgeAddr, EdgeError> {
        self.lock()
            .get_any_address()
            .ok_or(EdgeError::NoAddressesLeft)
    }

    /// The address `conn_index` already holds, or a fresh one.
    pub fn get_addr(&self, conn_index: usize) -> Result<EdgeAddr, EdgeError> {
        let mut regions = self.lock();
        if let Some(addr) = regions.addr_used_by(conn_index) {
            debug!(conn_index, ip = %addr, "reusing edge address");
            return Ok(addr);
        }
        let Some(addr) = regions.get_unused_addr(None, conn_index) else {
            debug!(conn_index, "no edge addresses left");
            return Err(EdgeError::NoAddressesLeft);
        };
        debug!(conn_index, ip = %addr, "assigned new edge address");
        Ok(addr)
    }

    /// Release the address `conn_index` holds and allocate a different one.
    pub fn get_different_addr(
        &self,
        conn_index: usize,
        has_connectivity_error: bool,
    ) -> Result<EdgeAddr, EdgeError> {
        let mut regions = self.lock();
        let old = regions.addr_used_by(conn_index);
        if let Some(old) = &old {
            regions.give_back(old, has_connectivity_error);
        }
        // The old address becomes available again on the next call
        let Some(addr) = regions.get_unused_addr(old.as_ref(), conn_index) else {
            debug!(conn_index, "no edge addresses left");
            return Err(EdgeError::NoAddressesLeft);
        };
        debug!(conn_index, ip = %addr, "rotated to new edge address");
        Ok(addr)
    }

    pub fn give_back(&self, addr: &EdgeAddr, has_connectivity_error: bool) -> bool {
        debug!(ip = %addr, has_connectivity_error, "edge address now unused");
        self.lock().give_back(addr, has_connectivity_error)
    }

    /// Release whatever `conn_index` holds, if anything.
    pub fn release(&self, conn_index: usize) {
        let mut regions = self.lock();
        if let Some(addr) = regions.addr_used_by(conn_index) {
            regions.give_back(&addr, false);
            debug!(conn_index, ip = %addr, "released edge address");
        }
    }

    pub fn available_addrs(&self) -> usize {
        self.lock().available_addrs()
    }

    /// Available addresses in each region.
    pub fn available_per_region(&self) -> (usize, usize) {
        let regions = self.lock();
        (
            regions.region1().available_addrs(),
            regions.region2().available_addrs(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr(s: &str) -> EdgeAddr {
        EdgeAddr::new(s.parse().unwrap())
    }

    fn edge() -> Edge {
        Edge::static_edge(&[
            addr("10.0.0.1:7844"),
            addr("10.0.0.2:7844"),
            addr("10.0.0.3:7844"),
            addr("10.0.0.4:7844"),
        ])
        .unwrap()
    }

    #[test]
    fn get_addr_is_sticky() {
        let edge = edge();
        let first = edge.get_addr(0).unwrap();
        assert_eq!(edge.get_addr(0).unwrap(), first);
        assert_eq!(edge.available_addrs(), 3);
    }

    #[test]
    fn different_addr_rotates_and_frees_old() {
        let edge = edge();
        let first = edge.get_addr(0).unwrap();
        let second = edge.get_different_addr(0, false).unwrap();
        assert_ne!(first, second);
        assert_eq!(edge.available_addrs(), 3);
        assert_eq!(edge.get_addr(0).unwrap(), second);
    }

    #[test]
    fn exhaustion_is_reported() {
        let edge = Edge::static_edge(&[addr("10.0.0.1:7844")]).unwrap();
        edge.get_addr(0).unwrap();
        assert_eq!(edge.get_addr(1), Err(EdgeError::NoAddressesLeft));
        // Rotating away from the only address finds nothing else
        assert_eq!(edge.get_different_addr(0, false), Err(EdgeError::NoAddressesLeft));
        assert_eq!(edge.available_addrs(), 1);
    }

    #[test]
    fn rpc_address_is_not_allocated() {
        let edge = edge();
        edge.get_addr_for_rpc().unwrap();
        assert_eq!(edge.available_addrs(), 4);
    }

    #[test]
    fn release_frees_slot_address() {
        let edge = edge();
        edge.get_addr(2).unwrap();
        edge.release(2);
        assert_eq!(edge.available_addrs(), 4);
        edge.release(2);
    }

    struct FixedDiscovery(Vec<Vec<EdgeAddr>>);

    impl Discoverer for FixedDiscovery {
        async fn discover(&self, service: &str) -> Result<Vec<Vec<EdgeAddr>>, EdgeError> {
            assert_eq!(service, "eu-v2-edgetunnel");
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn resolve_uses_regional_service() {
        let discovery = FixedDiscovery(vec![
            vec![addr("10.0.1.1:7844"), addr("10.0.1.2:7844")],
            vec![addr("10.0.2.1:7844")],
        ]);
        let edge = Edge::resolve(
            &discovery,
            Some("eu"),
            ConfigIpVersion::Auto,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(edge.available_per_region(), (2, 1));
    }

    #[tokio::test]
    async fn resolve_needs_two_groups() {
        let discovery = FixedDiscovery(vec![vec![addr("10.0.1.1:7844")]]);
        let result = Edge::resolve(
            &discovery,
            Some("eu"),
            ConfigIpVersion::Auto,
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(EdgeError::TooFewRegions(1))));
    }

    #[test]
    fn empty_static_edge_is_rejected() {
        assert!(matches!(
            Edge::static_edge(&[]),
            Err(EdgeError::NoStaticAddresses)
        ));
    }
}
