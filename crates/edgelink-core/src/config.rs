//! Configuration resolution for edgelink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/edgelink/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete edgelink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub log: LogConfig,
}

/// Settings for the HA connection supervisor and the edge address pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelSettings {
    /// Number of simultaneous edge connections to maintain.
    pub ha_connections: usize,
    /// Maximum retries per backoff cycle before protocol fallback kicks in.
    pub retries: u32,
    /// Transport protocol: `auto`, `quic` or `http2`.
    pub protocol: String,
    /// Edge IP family: `auto`, `4` or `6`.
    pub edge_ip_version: String,
    /// Optional region prefix for edge discovery (e.g. `us`).
    pub region: Option<String>,
    /// Explicit edge addresses (`host:port`); disables discovery when set.
    pub edge_addrs: Vec<String>,
    /// How long in-flight sessions may drain after a graceful shutdown starts.
    pub grace_period_secs: u64,
    /// Spacing between starting HA connections after the first one connects.
    pub registration_interval_ms: u64,
    /// How long a region stays demoted to its secondary IP family.
    pub family_cooldown_secs: u64,
    /// Timeout for establishing the transport to an edge address.
    pub dial_timeout_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ha_connections: 4,
            retries: 5,
            protocol: "auto".to_string(),
            edge_ip_version: "auto".to_string(),
            region: None,
            edge_addrs: Vec::new(),
            grace_period_secs: 30,
            registration_interval_ms: 1000,
            family_cooldown_secs: 10 * 60,
            dial_timeout_secs: 15,
        }
    }
}

impl TunnelSettings {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub const fn registration_interval(&self) -> Duration {
        Duration::from_millis(self.registration_interval_ms)
    }

    pub const fn family_cooldown(&self) -> Duration {
        Duration::from_secs(self.family_cooldown_secs)
    }

    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ha_connections == 0 {
            return Err(Error::Config("ha_connections must be at least 1".into()));
        }
        if !matches!(self.protocol.as_str(), "auto" | "quic" | "http2") {
            return Err(Error::Config(format!(
                "Unknown protocol {:?}, expected auto, quic or http2",
                self.protocol
            )));
        }
        if !matches!(self.edge_ip_version.as_str(), "auto" | "4" | "6") {
            return Err(Error::Config(format!(
                "Unknown edge IP version {:?}, expected auto, 4 or 6",
                self.edge_ip_version
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    // An explicit file must exist
    if let Some(path) = explicit {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.tunnel.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".edgelink").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/edgelink/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("edgelink").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    tracing::debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn merge_config(base: &mut Config, overlay: Config) {
    let Config { tunnel, log } = overlay;

    if tunnel.region.is_some() {
        base.tunnel.region = tunnel.region;
    }
    if !tunnel.edge_addrs.is_empty() {
        base.tunnel.edge_addrs = tunnel.edge_addrs;
    }
    base.tunnel.ha_connections = tunnel.ha_connections;
    base.tunnel.retries = tunnel.retries;
    base.tunnel.protocol = tunnel.protocol;
    base.tunnel.edge_ip_version = tunnel.edge_ip_version;
    base.tunnel.grace_period_secs = tunnel.grace_period_secs;
    base.tunnel.registration_interval_ms = tunnel.registration_interval_ms;
    base.tunnel.family_cooldown_secs = tunnel.family_cooldown_secs;
    base.tunnel.dial_timeout_secs = tunnel.dial_timeout_secs;

    base.log = log;
}

/// Apply `EDGELINK_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("EDGELINK_HA_CONNECTIONS").and_then(|v| v.parse().ok()) {
        config.tunnel.ha_connections = n;
    }
    if let Some(n) = lookup("EDGELINK_RETRIES").and_then(|v| v.parse().ok()) {
        config.tunnel.retries = n;
    }
    if let Some(val) = lookup("EDGELINK_PROTOCOL") {
        config.tunnel.protocol = val;
    }
    if let Some(val) = lookup("EDGELINK_EDGE_IP_VERSION") {
        config.tunnel.edge_ip_version = val;
    }
    if let Some(val) = lookup("EDGELINK_REGION") {
        config.tunnel.region = Some(val).filter(|r| !r.is_empty());
    }
    if let Some(val) = lookup("EDGELINK_EDGE") {
        config.tunnel.edge_addrs = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(val) = lookup("EDGELINK_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = lookup("EDGELINK_LOG_JSON") {
        config.log.json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}
