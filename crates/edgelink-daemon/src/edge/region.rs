use std::time::Duration;

use tokio::time::Instant;

use super::addr::{AddrSet, ConfigIpVersion, EdgeAddr, IpVersion};

/// How long a region stays on its secondary family after the primary failed.
pub const DEFAULT_FAMILY_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// One redundant shard of the edge, split by IP family.
///
/// Addresses are only handed out from the active family. A connectivity
/// failure on v6 while the primary is active demotes the region to its
/// secondary family until the cooldown passes or the secondary fails too.
#[derive(Debug, Clone)]
pub struct Region {
    primary: AddrSet,
    secondary: AddrSet,
    primary_is_active: bool,
    revert_deadline: Option<Instant>,
    cooldown: Duration,
}

impl Region {
    /// Build a region, preferring the family of the first address unless
    /// `ip_version` forces one.
    pub fn new(addrs: &[EdgeAddr], ip_version: ConfigIpVersion) -> Self {
        let (v4, v6): (Vec<EdgeAddr>, Vec<EdgeAddr>) = addrs
            .iter()
            .partition(|a| a.ip_version == IpVersion::V4);

        let (primary, secondary) = match ip_version.forced() {
            Some(IpVersion::V4) => (AddrSet::new(v4), AddrSet::default()),
            Some(IpVersion::V6) => (AddrSet::new(v6), AddrSet::default()),
            None => match addrs.first().map(|a| a.ip_version) {
                Some(IpVersion::V6) => (AddrSet::new(v6), AddrSet::new(v4)),
                _ => (AddrSet::new(v4), AddrSet::new(v6)),
            },
        };

        Self {
            primary,
            secondary,
            primary_is_active: true,
            revert_deadline: None,
            cooldown: DEFAULT_FAMILY_COOLDOWN,
        }
    }

    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub const fn primary_is_active(&self) -> bool {
        self.primary_is_active
    }

    pub const fn primary(&self) -> &AddrSet {
        &self.primary
    }

    pub const fn secondary(&self) -> &AddrSet {
        &self.secondary
    }

    pub const fn active(&self) -> &AddrSet {
        if self.primary_is_active {
            &self.primary
        } else {
            &self.secondary
        }
    }

    const fn active_mut(&mut self) -> &mut AddrSet {
        if self.primary_is_active {
            &mut self.primary
        } else {
            &mut self.secondary
        }
    }

    pub fn available_addrs(&self) -> usize {
        self.active().available_addrs()
    }

    /// Hand an unused address from the active family to `conn_index`.
    pub fn assign_any_address(
        &mut self,
        conn_index: usize,
        excluding: Option<&EdgeAddr>,
    ) -> Option<EdgeAddr> {
        let active = self.active_mut();
        let addr = active.get_unused_ip(excluding)?;
        active.mark_in_use(&addr, conn_index);
        Some(addr)
    }

    /// Searches both families: a connection keeps its address across a
    /// family switch.
    pub fn addr_used_by(&self, conn_index: usize) -> Option<EdgeAddr> {
        self.primary
            .addr_used_by(conn_index)
            .or_else(|| self.secondary.addr_used_by(conn_index))
    }

    pub fn get_any_address(&self) -> Option<EdgeAddr> {
        self.active().get_any_address()
    }

    pub fn give_back(&mut self, addr: &EdgeAddr, has_connectivity_error: bool) -> bool {
        self.give_back_at(addr, has_connectivity_error, Instant::now())
    }

    /// Release `addr` and, on a connectivity error, apply family hysteresis.
    ///
    /// Returns false if the address does not belong to this region.
    pub fn give_back_at(
        &mut self,
        addr: &EdgeAddr,
        has_connectivity_error: bool,
        now: Instant,
    ) -> bool {
        if !self.primary.give_back(addr) && !self.secondary.give_back(addr) {
            return false;
        }
        if !has_connectivity_error {
            return true;
        }

        if self.primary_is_active {
            if addr.ip_version == IpVersion::V6 && !self.secondary.is_empty() {
                self.primary_is_active = false;
                self.revert_deadline = Some(now + self.cooldown);
                tracing::debug!(ip = %addr, "demoting region to secondary IP family");
            }
        } else if addr.ip_version == IpVersion::V4 {
            // Secondary is failing as well, no point staying demoted
            self.revert_to_primary();
        } else if self.revert_deadline.is_some_and(|deadline| now >= deadline) {
            self.revert_to_primary();
        }
        true
    }

    fn revert_to_primary(&mut self) {
        self.primary_is_active = true;
        self.revert_deadline = None;
        tracing::debug!("reverting region to primary IP family");
    }
}
