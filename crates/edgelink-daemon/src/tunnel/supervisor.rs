//! HA connection supervisor.
//!
//! Starts the first connection, waits for it to register, then brings up the
//! remaining slots one registration interval apart. Afterwards it restarts
//! failed slots behind a shared backoff until cancelled or until every slot
//! has given up.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::error::TunnelError;
use super::fallback::ProtocolFallback;
use super::protocol::{Protocol, ProtocolSelector};
use super::server::{EdgeTunnelServer, Slot};
use super::session::{ReconnectSignal, SessionConnector, SessionError};
use super::signal::{ConnectedSignal, graceful_shutdown};
use super::tracker::ConnTracker;
use crate::edge::{Edge, EdgeError};

/// A slot's task finished.
struct TunnelExit {
    slot: Slot,
    result: Result<(), TunnelError>,
}

pub struct Supervisor<C> {
    config: TunnelConfig,
    connector: Arc<C>,
    edge: Arc<Edge>,
    selector: Arc<dyn ProtocolSelector>,
    tracker: Arc<ConnTracker>,
    reconnect: Option<mpsc::Receiver<ReconnectSignal>>,
    shutdown: watch::Receiver<bool>,
}

impl<C: SessionConnector> Supervisor<C> {
    pub fn new(
        config: TunnelConfig,
        connector: Arc<C>,
        edge: Arc<Edge>,
        selector: Arc<dyn ProtocolSelector>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            connector,
            edge,
            selector,
            tracker: Arc::new(ConnTracker::new()),
            reconnect: None,
            shutdown,
        }
    }

    /// Deliver reconnect requests to the running sessions.
    #[must_use]
    pub fn with_reconnect(mut self, rx: mpsc::Receiver<ReconnectSignal>) -> Self {
        self.reconnect = Some(rx);
        self
    }

    /// Live view of which slots are connected.
    pub fn tracker(&self) -> Arc<ConnTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run until cancelled or until no slot is left.
    ///
    /// Fails only if the first connection cannot be established, or once
    /// every slot has given up. `connected` fires when the first slot
    /// registers.
    pub async fn run(
        self,
        cancel: CancellationToken,
        connected: ConnectedSignal,
    ) -> Result<(), TunnelError> {
        let mut server = EdgeTunnelServer::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.edge),
            Arc::clone(&self.selector),
            Arc::clone(&self.tracker),
            self.shutdown.clone(),
        );
        if let Some(rx) = self.reconnect {
            server = server.with_reconnect(rx);
        }

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let mut run = SupervisorRun {
            config: self.config,
            server: Arc::new(server),
            edge: self.edge,
            selector: self.selector,
            tracker: self.tracker,
            shutdown: self.shutdown,
            // Lets startup abort slot 0 without touching the caller's token
            cancel: cancel.child_token(),
            exit_tx,
            exit_rx,
            connected_tx,
            connected_rx,
            connecting: HashSet::new(),
            active: 0,
        };

        run.initialize(&connected).await?;
        run.main_loop(&connected).await
    }
}

struct SupervisorRun<C> {
    config: TunnelConfig,
    server: Arc<EdgeTunnelServer<C>>,
    edge: Arc<Edge>,
    selector: Arc<dyn ProtocolSelector>,
    tracker: Arc<ConnTracker>,
    shutdown: watch::Receiver<bool>,
    cancel: CancellationToken,
    exit_tx: mpsc::UnboundedSender<TunnelExit>,
    exit_rx: mpsc::UnboundedReceiver<TunnelExit>,
    connected_tx: mpsc::UnboundedSender<usize>,
    connected_rx: mpsc::UnboundedReceiver<usize>,
    /// Restarted slots that have not registered yet.
    connecting: HashSet<usize>,
    active: usize,
}

impl<C: SessionConnector> SupervisorRun<C> {
    fn new_slot(&self, index: usize, protocol: Protocol) -> Slot {
        Slot::new(
            index,
            ProtocolFallback::new(self.config.slot_backoff(index), protocol),
            self.config.addr_handler(),
        )
    }

    async fn initialize(&mut self, connected: &ConnectedSignal) -> Result<(), TunnelError> {
        let available = self.edge.available_addrs();
        if available == 0 {
            return Err(EdgeError::NoAddressesLeft.into());
        }
        let ha_connections = if self.config.ha_connections > available {
            warn!(
                requested = self.config.ha_connections,
                available, "Requested more HA connections than there are edge addresses"
            );
            available
        } else {
            self.config.ha_connections
        };
        self.config.ha_connections = ha_connections;

        let first = self.new_slot(0, self.selector.current());
        self.start_slot(first, true);

        let mut shutdown = self.shutdown.clone();
        // A registration that races with the slot's exit still counts
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.drain().await;
                return Err(TunnelError::Cancelled);
            }
            Some(index) = self.connected_rx.recv() => {
                debug!(conn_index = index, "First connection registered");
                connected.notify();
            }
            () = graceful_shutdown(&mut shutdown) => {
                self.cancel.cancel();
                self.drain().await;
                return Err(TunnelError::EarlyShutdown);
            }
            Some(exit) = self.exit_rx.recv() => {
                self.active -= 1;
                return match exit.result {
                    Ok(()) if *self.shutdown.borrow() => Err(TunnelError::EarlyShutdown),
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(error = %e, "Failed to establish the first connection");
                        Err(e)
                    }
                };
            }
        }

        // Start the rest on whatever protocol the first one settled on
        let protocol = self
            .tracker
            .protocol_of(0)
            .unwrap_or_else(|| self.selector.current());
        for index in 1..ha_connections {
            let slot = self.new_slot(index, protocol);
            self.start_slot(slot, false);
            if index + 1 < ha_connections {
                tokio::select! {
                    () = tokio::time::sleep(self.config.registration_interval) => {}
                    () = self.cancel.cancelled() => break,
                }
            }
        }
        Ok(())
    }

    async fn main_loop(&mut self, connected: &ConnectedSignal) -> Result<(), TunnelError> {
        let mut backoff = self.config.supervisor_backoff();
        let mut backoff_deadline: Option<Instant> = None;
        let mut waiting: Vec<Slot> = Vec::new();
        let mut shutting_down = *self.shutdown.borrow();
        let mut last_error: Option<TunnelError> = None;
        let mut shutdown = self.shutdown.clone();

        loop {
            if self.active == 0 && waiting.is_empty() {
                return match last_error {
                    Some(e) => {
                        warn!(error = %e, "All connections gave up");
                        Err(e)
                    }
                    None => Ok(()),
                };
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.drain().await;
                    for slot in waiting.drain(..) {
                        self.edge.release(slot.index());
                    }
                    return Ok(());
                }
                Some(exit) = self.exit_rx.recv() => {
                    self.active -= 1;
                    let index = exit.slot.index();
                    self.connecting.remove(&index);
                    match exit.result {
                        Err(e) if e.is_reconnect() && !shutting_down => {
                            self.start_slot(exit.slot, false);
                        }
                        Err(e) if !shutting_down => {
                            warn!(conn_index = index, error = %e, "Tunnel disconnected due to error");
                            let preview = exit
                                .slot
                                .fallback
                                .backoff()
                                .max_backoff_duration(Instant::now(), &self.cancel);
                            if self.gives_up(&e) || preview.is_none() {
                                info!(conn_index = index, "Connection will not be retried");
                                self.edge.release(index);
                                last_error = Some(e);
                            } else {
                                waiting.push(exit.slot);
                                if backoff_deadline.is_none() {
                                    let wait = backoff.arm(Instant::now()).unwrap_or_default();
                                    debug!(?wait, "Armed restart backoff");
                                    backoff_deadline = Some(Instant::now() + wait);
                                }
                            }
                        }
                        Err(e) => {
                            debug!(conn_index = index, error = %e, "Connection ended during shutdown");
                            self.edge.release(index);
                        }
                        Ok(()) => {
                            debug!(conn_index = index, "Connection finished");
                            self.edge.release(index);
                            // A clean finish outranks slots that gave up earlier
                            last_error = None;
                        }
                    }
                }
                () = tokio::time::sleep_until(backoff_deadline.unwrap_or_else(Instant::now)),
                    if backoff_deadline.is_some() =>
                {
                    backoff_deadline = None;
                    for slot in waiting.drain(..) {
                        self.connecting.insert(slot.index());
                        self.start_slot(slot, false);
                    }
                }
                Some(index) = self.connected_rx.recv() => {
                    connected.notify();
                    self.connecting.remove(&index);
                    if self.connecting.is_empty() && waiting.is_empty() {
                        backoff.set_grace_period(Instant::now());
                    }
                }
                () = graceful_shutdown(&mut shutdown), if !shutting_down => {
                    info!("Graceful shutdown started, connections will not be retried");
                    shutting_down = true;
                    backoff_deadline = None;
                    for slot in waiting.drain(..) {
                        self.edge.release(slot.index());
                    }
                }
            }
        }
    }

    /// Errors after which a slot is dropped for good.
    const fn gives_up(&self, err: &TunnelError) -> bool {
        match err {
            TunnelError::FallbackExhausted(_) | TunnelError::Cancelled | TunnelError::EarlyShutdown => {
                true
            }
            TunnelError::Edge(EdgeError::NoAddressesLeft) => !self.config.static_edge,
            TunnelError::Edge(_) => true,
            TunnelError::Session(e) => matches!(
                e,
                SessionError::Unrecoverable(_)
                    | SessionError::ServerRegistration {
                        permanent: true,
                        ..
                    }
            ),
        }
    }

    /// Wait for every running slot to report back.
    async fn drain(&mut self) {
        while self.active > 0 {
            let Some(exit) = self.exit_rx.recv().await else {
                break;
            };
            self.active -= 1;
            self.edge.release(exit.slot.index());
        }
    }

    fn start_slot(&mut self, slot: Slot, first: bool) {
        self.active += 1;
        let static_edge = self.config.static_edge;
        let server = Arc::clone(&self.server);
        let cancel = self.cancel.clone();
        let exit_tx = self.exit_tx.clone();
        let connected_tx = self.connected_tx.clone();
        tokio::spawn(async move {
            let exit = run_slot(server, slot, cancel, connected_tx, first, static_edge).await;
            // Only fails if the supervisor is gone
            let _ = exit_tx.send(exit);
        });
    }
}

async fn run_slot<C: SessionConnector>(
    server: Arc<EdgeTunnelServer<C>>,
    mut slot: Slot,
    cancel: CancellationToken,
    connected_tx: mpsc::UnboundedSender<usize>,
    first: bool,
    static_edge: bool,
) -> TunnelExit {
    let index = slot.index();
    let registered = ConnectedSignal::new();
    let mut reported = false;

    loop {
        let result = {
            let serve = server.serve(&mut slot, &cancel, &registered);
            tokio::pin!(serve);
            loop {
                tokio::select! {
                    result = &mut serve => break result,
                    () = registered.wait(), if !reported => {
                        reported = true;
                        let _ = connected_tx.send(index);
                    }
                }
            }
        };
        if !reported && registered.is_notified() {
            reported = true;
            let _ = connected_tx.send(index);
        }

        // The first connection retries in place until it registers or hits
        // an error that should abort startup
        if !first
            || reported
            || cancel.is_cancelled()
            || !retry_first_in_place(&result, static_edge)
        {
            return TunnelExit { slot, result };
        }
        if backed_off_in_serve(&result) {
            if slot
                .fallback
                .backoff()
                .max_backoff_duration(Instant::now(), &cancel)
                .is_none()
            {
                return TunnelExit { slot, result };
            }
        } else {
            // Errors `serve` returns without waiting still spend a retry
            let Some(wait) = slot.fallback.backoff_mut().arm(Instant::now()) else {
                return TunnelExit { slot, result };
            };
            debug!(conn_index = index, ?wait, "Backing off before retrying first connection");
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return TunnelExit {
                        slot,
                        result: Err(TunnelError::Cancelled),
                    };
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
        debug!(conn_index = index, "Retrying first connection");
    }
}

/// Whether `serve` already slept on the slot's backoff before returning.
const fn backed_off_in_serve(result: &Result<(), TunnelError>) -> bool {
    match result {
        Err(TunnelError::Session(e)) => e.is_recoverable(),
        _ => false,
    }
}

fn retry_first_in_place(result: &Result<(), TunnelError>, static_edge: bool) -> bool {
    match result {
        Ok(()) => false,
        Err(TunnelError::Edge(EdgeError::NoAddressesLeft)) => static_edge,
        Err(TunnelError::Session(e)) => {
            e.is_unauthorized()
                || matches!(
                    e,
                    SessionError::DuplicateRegistration(_)
                        | SessionError::IdleTimeout(_)
                        | SessionError::EgressBlocked(_)
                        | SessionError::Dial(_)
                        | SessionError::Reconnect(_)
                )
        }
        Err(_) => false,
    }
}
