//! Edge discovery collaborators.

use std::future::Future;

use tracing::{debug, warn};

use super::EdgeError;
use super::addr::EdgeAddr;

/// Global discovery service name.
pub const SERVICE_NAME: &str = "v2-edgetunnel";
/// Domain the regional hostnames live under.
pub const DEFAULT_DISCOVERY_DOMAIN: &str = "edge.edgelink.dev";
/// Port edge servers listen on.
pub const DEFAULT_EDGE_PORT: u16 = 7844;

/// `<region>-<service>` when a region is configured, else the global name.
pub fn regional_service_name(region: Option<&str>) -> String {
    match region.filter(|r| !r.is_empty()) {
        Some(region) => format!("{region}-{SERVICE_NAME}"),
        None => SERVICE_NAME.to_string(),
    }
}

/// Finds edge addresses for a service.
///
/// Each returned group is one redundant region. Callers need at least two.
pub trait Discoverer: Send + Sync {
    fn discover(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Vec<Vec<EdgeAddr>>, EdgeError>> + Send;
}

/// Resolves `region1.<service>.<domain>` and `region2.<service>.<domain>`
/// with the system resolver.
#[derive(Debug, Clone)]
pub struct HostnameDiscovery {
    domain: String,
    port: u16,
}

impl HostnameDiscovery {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port: DEFAULT_EDGE_PORT,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn hostnames(&self, service: &str) -> [String; 2] {
        [
            format!("region1.{service}.{}", self.domain),
            format!("region2.{service}.{}", self.domain),
        ]
    }
}

impl Default for HostnameDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_DOMAIN)
    }
}

impl Discoverer for HostnameDiscovery {
    async fn discover(&self, service: &str) -> Result<Vec<Vec<EdgeAddr>>, EdgeError> {
        let mut groups = Vec::with_capacity(2);
        for host in self.hostnames(service) {
            let resolved = tokio::net::lookup_host((host.as_str(), self.port))
                .await
                .map_err(|e| EdgeError::Discovery {
                    service: service.to_string(),
                    reason: format!("failed to resolve {host}: {e}"),
                })?;
            // Resolver order is kept: it decides the preferred IP family
            let addrs: Vec<EdgeAddr> = resolved.map(EdgeAddr::new).collect();
            if addrs.is_empty() {
                return Err(EdgeError::Discovery {
                    service: service.to_string(),
                    reason: format!("{host} had no addresses"),
                });
            }
            debug!(host = %host, count = addrs.len(), "resolved edge region");
            groups.push(addrs);
        }
        Ok(groups)
    }
}

/// Resolve `host:port` strings, keeping the first address of each.
///
/// Entries that fail to resolve are skipped; it is an error only if none
/// resolve.
pub async fn resolve_addrs(hostnames: &[String]) -> Result<Vec<EdgeAddr>, EdgeError> {
    let mut resolved = Vec::with_capacity(hostnames.len());
    for host in hostnames {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    resolved.push(EdgeAddr::new(addr));
                } else {
                    warn!(host = %host, "edge hostname resolved to no addresses");
                }
            }
            Err(e) => warn!(host = %host, error = %e, "failed to resolve edge hostname"),
        }
    }
    if resolved.is_empty() {
        return Err(EdgeError::NoStaticAddresses);
    }
    Ok(resolved)
}
