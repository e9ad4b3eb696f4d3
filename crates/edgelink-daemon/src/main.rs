//! edgelink daemon
//!
//! Keeps a set of HA connections to the edge alive, restarting and
//! downgrading them as they fail, until asked to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edgelink_core::TunnelSettings;
use edgelink_core::config::load_config;
use edgelink_core::tracing_init::{default_filter, init_tracing};
use edgelink_daemon::edge::{
    ConfigIpVersion, DEFAULT_DISCOVERY_DOMAIN, Edge, EdgeError, HostnameDiscovery, resolve_addrs,
};
use edgelink_daemon::reachability::ReachConnector;
use edgelink_daemon::retry::{BackoffHandler, DEFAULT_BASE_TIME};
use edgelink_daemon::tunnel::{
    ConnectedSignal, Supervisor, TunnelConfig, TunnelError, new_protocol_selector,
};

/// How long a fetched protocol preference stays valid.
const PROTOCOL_REFRESH_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "edgelink-daemon")]
#[command(version, about = "edgelink daemon - HA edge tunnel connections")]
struct Args {
    /// Config file, layered over the global settings file
    #[arg(long, env = "EDGELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Number of edge connections to keep open
    #[arg(long, env = "EDGELINK_HA_CONNECTIONS")]
    ha_connections: Option<usize>,

    /// Retries per backoff cycle before falling back
    #[arg(long, env = "EDGELINK_RETRIES")]
    retries: Option<u32>,

    /// Transport protocol
    #[arg(long, env = "EDGELINK_PROTOCOL", value_parser = ["auto", "quic", "http2"])]
    protocol: Option<String>,

    /// Fixed edge address (`host:port`); repeat or comma-separate. Disables discovery.
    #[arg(long, env = "EDGELINK_EDGE", value_delimiter = ',')]
    edge: Vec<String>,

    /// Region prefix for edge discovery (e.g. "us")
    #[arg(long, env = "EDGELINK_REGION")]
    region: Option<String>,

    /// Edge IP family
    #[arg(long, env = "EDGELINK_EDGE_IP_VERSION", value_parser = ["auto", "4", "6"])]
    edge_ip_version: Option<String>,

    /// DNS domain the regional edge hostnames live under
    #[arg(long, default_value = DEFAULT_DISCOVERY_DOMAIN, env = "EDGELINK_DISCOVERY_DOMAIN")]
    discovery_domain: String,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "EDGELINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "EDGELINK_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags take precedence over every config layer.
    fn apply(&self, settings: &mut TunnelSettings) {
        if let Some(n) = self.ha_connections {
            settings.ha_connections = n;
        }
        if let Some(n) = self.retries {
            settings.retries = n;
        }
        if let Some(protocol) = &self.protocol {
            settings.protocol.clone_from(protocol);
        }
        if !self.edge.is_empty() {
            settings.edge_addrs.clone_from(&self.edge);
        }
        if self.region.is_some() {
            settings.region.clone_from(&self.region);
        }
        if let Some(version) = &self.edge_ip_version {
            settings.edge_ip_version.clone_from(version);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config.tunnel);
    config.tunnel.validate()?;
    if let Some(level) = &args.log_level {
        config.log.level.clone_from(level);
    }
    init_tracing(
        &default_filter(&config.log.level),
        args.log_json || config.log.json,
    );

    let settings = config.tunnel;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        ha_connections = settings.ha_connections,
        protocol = %settings.protocol,
        static_edge = !settings.edge_addrs.is_empty(),
        "Starting edgelink-daemon"
    );

    let cancel = CancellationToken::new();
    let edge = resolve_edge(&settings, &args.discovery_domain, &cancel).await?;
    let (region1, region2) = edge.available_per_region();
    info!(region1, region2, "Edge addresses resolved");

    let selector = new_protocol_selector(&settings.protocol, None, 0, PROTOCOL_REFRESH_TTL)?;
    let tunnel_config = TunnelConfig::from_settings(&settings);
    let grace_period = tunnel_config.grace_period;
    let connector = ReachConnector::new(settings.dial_timeout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(
        tunnel_config,
        Arc::new(connector),
        Arc::new(edge),
        selector,
        shutdown_rx,
    );
    let connected = ConnectedSignal::new();
    let mut run = tokio::spawn(supervisor.run(cancel.clone(), connected.clone()));

    let mut signals = ShutdownSignals::new()?;
    let mut ready = false;
    let mut grace_deadline: Option<Instant> = None;

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            () = connected.wait(), if !ready => {
                ready = true;
                info!("Tunnel connected");
                // Notify systemd that the daemon is ready (unix only)
                #[cfg(unix)]
                sd_notify::notify(false, &[sd_notify::NotifyState::Ready])?;
            }
            () = signals.recv() => {
                if grace_deadline.is_some() {
                    info!("Second shutdown signal, stopping connections now");
                    cancel.cancel();
                } else {
                    info!(?grace_period, "Starting graceful shutdown");
                    #[cfg(unix)]
                    sd_notify::notify(false, &[sd_notify::NotifyState::Stopping])?;
                    shutdown_tx.send_replace(true);
                    grace_deadline = Some(Instant::now() + grace_period);
                }
            }
            () = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                if grace_deadline.is_some() && !cancel.is_cancelled() =>
            {
                warn!("Grace period elapsed, stopping connections");
                cancel.cancel();
            }
        }
    };

    match result? {
        Ok(()) | Err(TunnelError::Cancelled | TunnelError::EarlyShutdown) => {
            info!("Daemon stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve the edge pool, retrying discovery failures with backoff.
async fn resolve_edge(
    settings: &TunnelSettings,
    discovery_domain: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<Edge> {
    let ip_version: ConfigIpVersion = settings.edge_ip_version.parse()?;
    let discovery = HostnameDiscovery::new(discovery_domain);
    let mut backoff = BackoffHandler::new(settings.retries, DEFAULT_BASE_TIME, false);

    loop {
        let attempt = if settings.edge_addrs.is_empty() {
            Edge::resolve(
                &discovery,
                settings.region.as_deref(),
                ip_version,
                settings.family_cooldown(),
            )
            .await
        } else {
            match resolve_addrs(&settings.edge_addrs).await {
                Ok(addrs) => Edge::static_edge(&addrs),
                Err(e) => Err(e),
            }
        };

        match attempt {
            Ok(edge) => return Ok(edge),
            // Retrying will not produce more regions
            Err(e @ EdgeError::TooFewRegions(_)) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, retries = backoff.retries(), "Failed to resolve edge addresses");
                if !backoff.backoff(cancel).await {
                    return Err(e.into());
                }
            }
        }
    }
}

/// Ctrl+C, plus SIGTERM on unix.
struct ShutdownSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            sigterm: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        let sigterm = self.sigterm.recv();
        #[cfg(not(unix))]
        let sigterm = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm => info!("Received SIGTERM shutdown signal"),
        }
    }
}
