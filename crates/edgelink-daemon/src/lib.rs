//! edgelink Daemon Library
//!
//! Connectivity core for the edgelink tunnel client:
//! - Exponential backoff with jitter and grace-period reset
//! - Edge address pool partitioned into two regions with IP-family hysteresis
//! - Per-connection protocol fallback
//! - Supervisor keeping several HA connections to the edge alive
//! - A reachability-check session implementation used by the daemon binary

pub mod edge;
pub mod reachability;
pub mod retry;
pub mod tunnel;
