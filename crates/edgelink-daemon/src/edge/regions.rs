use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::EdgeError;
use super::addr::{ConfigIpVersion, EdgeAddr};
use super::region::Region;

/// The edge address pool: two redundant regions.
///
/// Not synchronized; [`super::Edge`] wraps it in a lock.
#[derive(Debug, Clone)]
pub struct Regions {
    region1: Region,
    region2: Region,
    rng: StdRng,
}

impl Regions {
    /// Build from discovered address groups. The first two groups become the
    /// regions; fewer than two is an error.
    pub fn from_groups(
        groups: &[Vec<EdgeAddr>],
        ip_version: ConfigIpVersion,
    ) -> Result<Self, EdgeError> {
        let [first, second, ..] = groups else {
            return Err(EdgeError::TooFewRegions(groups.len()));
        };
        Ok(Self {
            region1: Region::new(first, ip_version),
            region2: Region::new(second, ip_version),
            rng: StdRng::from_entropy(),
        })
    }

    /// Split a fixed address list alternately between the two regions.
    pub fn new_no_resolve(addrs: &[EdgeAddr]) -> Self {
        let (even, odd): (Vec<_>, Vec<_>) = addrs
            .iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        let region1: Vec<EdgeAddr> = even.into_iter().map(|(_, a)| *a).collect();
        let region2: Vec<EdgeAddr> = odd.into_iter().map(|(_, a)| *a).collect();
        Self {
            region1: Region::new(&region1, ConfigIpVersion::Auto),
            region2: Region::new(&region2, ConfigIpVersion::Auto),
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the tie-breaking source.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.region1 = self.region1.with_cooldown(cooldown);
        self.region2 = self.region2.with_cooldown(cooldown);
        self
    }

    pub const fn region1(&self) -> &Region {
        &self.region1
    }

    pub const fn region2(&self) -> &Region {
        &self.region2
    }

    pub fn get_any_address(&self) -> Option<EdgeAddr> {
        self.region1
            .get_any_address()
            .or_else(|| self.region2.get_any_address())
    }

    pub fn addr_used_by(&self, conn_index: usize) -> Option<EdgeAddr> {
        self.region1
            .addr_used_by(conn_index)
            .or_else(|| self.region2.addr_used_by(conn_index))
    }

    /// Allocate an unused address, keeping the regions evenly loaded.
    ///
    /// Tries the region with more available addresses first; ties are broken
    /// at random.
    pub fn get_unused_addr(
        &mut self,
        excluding: Option<&EdgeAddr>,
        conn_index: usize,
    ) -> Option<EdgeAddr> {
        let avail1 = self.region1.available_addrs();
        let avail2 = self.region2.available_addrs();
        let region1_first = match avail1.cmp(&avail2) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.rng.gen_bool(0.5),
        };

        let (first, second) = if region1_first {
            (&mut self.region1, &mut self.region2)
        } else {
            (&mut self.region2, &mut self.region1)
        };
        first
            .assign_any_address(conn_index, excluding)
            .or_else(|| second.assign_any_address(conn_index, excluding))
    }

    pub fn available_addrs(&self) -> usize {
        self.region1.available_addrs() + self.region2.available_addrs()
    }

    /// Returns true if the address belongs to either region.
    pub fn give_back(&mut self, addr: &EdgeAddr, has_connectivity_error: bool) -> bool {
        self.region1.give_back(addr, has_connectivity_error)
            || self.region2.give_back(addr, has_connectivity_error)
    }
}
