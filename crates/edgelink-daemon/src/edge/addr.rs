use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// IP family of an edge address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "4"),
            Self::V6 => write!(f, "6"),
        }
    }
}

/// Configured IP family policy for edge connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigIpVersion {
    /// Follow the resolver's family preference and fail over between families.
    #[default]
    Auto,
    Ipv4Only,
    Ipv6Only,
}

impl ConfigIpVersion {
    /// The family forced by this policy, if any.
    pub const fn forced(self) -> Option<IpVersion> {
        match self {
            Self::Auto => None,
            Self::Ipv4Only => Some(IpVersion::V4),
            Self::Ipv6Only => Some(IpVersion::V6),
        }
    }
}

impl FromStr for ConfigIpVersion {
    type Err = edgelink_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "4" => Ok(Self::Ipv4Only),
            "6" => Ok(Self::Ipv6Only),
            other => Err(edgelink_core::Error::Config(format!(
                "Unknown edge IP version {other:?}, expected auto, 4 or 6"
            ))),
        }
    }
}

impl fmt::Display for ConfigIpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Ipv4Only => write!(f, "4"),
            Self::Ipv6Only => write!(f, "6"),
        }
    }
}

/// An edge endpoint, reachable over both a stream and a datagram transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeAddr {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
    pub ip_version: IpVersion,
}

impl EdgeAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            tcp: addr,
            udp: addr,
            ip_version: IpVersion::of(addr.ip()),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.tcp.ip()
    }
}

impl From<SocketAddr> for EdgeAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for EdgeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tcp)
    }
}

/// Who, if anyone, currently holds an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsedBy {
    Unused,
    InUse(usize),
}

/// A fixed set of addresses and their usage.
///
/// Membership never changes after construction: addresses are recycled,
/// never added or removed.
#[derive(Debug, Clone, Default)]
pub struct AddrSet {
    addrs: BTreeMap<EdgeAddr, UsedBy>,
}

impl AddrSet {
    pub fn new(addrs: impl IntoIterator<Item = EdgeAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().map(|a| (a, UsedBy::Unused)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn contains(&self, addr: &EdgeAddr) -> bool {
        self.addrs.contains_key(addr)
    }

    /// Number of addresses not held by any connection.
    pub fn available_addrs(&self) -> usize {
        self.addrs.values().filter(|u| **u == UsedBy::Unused).count()
    }

    pub fn used_by(&self, addr: &EdgeAddr) -> Option<UsedBy> {
        self.addrs.get(addr).copied()
    }

    /// The address held by `conn_index`, if any.
    pub fn addr_used_by(&self, conn_index: usize) -> Option<EdgeAddr> {
        self.addrs
            .iter()
            .find(|(_, used)| **used == UsedBy::InUse(conn_index))
            .map(|(addr, _)| *addr)
    }

    pub fn get_unused_ip(&self, excluding: Option<&EdgeAddr>) -> Option<EdgeAddr> {
        self.addrs
            .iter()
            .find(|(addr, used)| **used == UsedBy::Unused && Some(*addr) != excluding)
            .map(|(addr, _)| *addr)
    }

    /// Mark `addr` as held by `conn_index`. Returns false for unknown addresses.
    pub fn mark_in_use(&mut self, addr: &EdgeAddr, conn_index: usize) -> bool {
        match self.addrs.get_mut(addr) {
            Some(used) => {
                *used = UsedBy::InUse(conn_index);
                true
            }
            None => false,
        }
    }

    /// Any address, regardless of usage.
    pub fn get_any_address(&self) -> Option<EdgeAddr> {
        self.addrs.keys().next().copied()
    }

    /// Mark `addr` as unused. Returns false for unknown addresses.
    pub fn give_back(&mut self, addr: &EdgeAddr) -> bool {
        match self.addrs.get_mut(addr) {
            Some(used) => {
                *used = UsedBy::Unused;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EdgeAddr, &UsedBy)> {
        self.addrs.iter()
    }
}
