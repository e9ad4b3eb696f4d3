//! One slot's connection attempt and the retry decision that follows it.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::addr_handler::EdgeAddrHandler;
use super::error::TunnelError;
use super::fallback::ProtocolFallback;
use super::protocol::{Protocol, ProtocolSelector};
use super::session::{ReconnectSignal, SessionConnector, SessionError, SessionParams};
use super::signal::{ConnectedSignal, graceful_shutdown};
use super::tracker::ConnTracker;
use crate::edge::{Edge, EdgeAddr};

/// State a connection slot carries between attempts.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    pub fallback: ProtocolFallback,
    addr_handler: Box<dyn EdgeAddrHandler>,
}

impl Slot {
    pub fn new(
        index: usize,
        fallback: ProtocolFallback,
        addr_handler: Box<dyn EdgeAddrHandler>,
    ) -> Self {
        Self {
            index,
            fallback,
            addr_handler,
        }
    }

    pub const fn index(&self) -> usize {
        self.index
    }
}

type ReconnectReceiver = Arc<Mutex<mpsc::Receiver<ReconnectSignal>>>;

/// Runs sessions for slots against the shared edge pool.
pub struct EdgeTunnelServer<C> {
    connector: Arc<C>,
    edge: Arc<Edge>,
    selector: Arc<dyn ProtocolSelector>,
    tracker: Arc<ConnTracker>,
    reconnect: Option<ReconnectReceiver>,
    shutdown: watch::Receiver<bool>,
}

impl<C: SessionConnector> EdgeTunnelServer<C> {
    pub fn new(
        connector: Arc<C>,
        edge: Arc<Edge>,
        selector: Arc<dyn ProtocolSelector>,
        tracker: Arc<ConnTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            edge,
            selector,
            tracker,
            reconnect: None,
            shutdown,
        }
    }

    /// Restart whichever session picks up a signal from `rx`.
    #[must_use]
    pub fn with_reconnect(mut self, rx: mpsc::Receiver<ReconnectSignal>) -> Self {
        self.reconnect = Some(Arc::new(Mutex::new(rx)));
        self
    }

    /// Run one attempt for `slot` and decide how it should continue.
    ///
    /// `Ok(())` means the slot is done: the session stopped cleanly or a
    /// graceful shutdown began during backoff. Errors are handed to the
    /// supervisor, which restarts or drops the slot.
    pub async fn serve(
        &self,
        slot: &mut Slot,
        cancel: &CancellationToken,
        connected: &ConnectedSignal,
    ) -> Result<(), TunnelError> {
        let conn_index = slot.index;
        let addr = self.edge.get_addr(conn_index)?;
        let protocol = slot.fallback.protocol();

        let err = match self
            .serve_tunnel(slot, addr, protocol, cancel, connected)
            .await
        {
            Ok(()) => return Ok(()),
            Err(SessionError::Cancelled) => return Err(TunnelError::Cancelled),
            Err(SessionError::Reconnect(signal)) => {
                info!(conn_index, ip = %addr, delay = ?signal.delay, "Restarting connection due to reconnect signal");
                tokio::select! {
                    () = signal.delay_before_reconnect() => {}
                    () = cancel.cancelled() => return Err(TunnelError::Cancelled),
                }
                return Err(SessionError::Reconnect(signal).into());
            }
            Err(e) => e,
        };

        warn!(conn_index, ip = %addr, %protocol, error = %err, "Connection terminated");

        let recoverable = err.is_recoverable();
        if recoverable {
            match slot
                .fallback
                .backoff()
                .max_backoff_duration(Instant::now(), cancel)
            {
                Some(max_wait) => info!(conn_index, ?max_wait, "Retrying connection"),
                None if cancel.is_cancelled() => return Err(TunnelError::Cancelled),
                None => return Err(TunnelError::FallbackExhausted(err)),
            }
        }

        // Address rotation is independent of the backoff decision
        let decision = slot.addr_handler.should_get_new_address(Some(&err));
        if decision.needs_new_address {
            self.edge
                .get_different_addr(conn_index, decision.is_connectivity_error)?;
        }

        if !recoverable {
            return Err(err.into());
        }

        let Some(wait) = slot.fallback.backoff_mut().arm(Instant::now()) else {
            return Err(TunnelError::FallbackExhausted(err));
        };
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            () = graceful_shutdown(&mut shutdown) => return Ok(()),
            () = tokio::time::sleep(wait) => {}
        }

        // Someone is connected with the preferred protocol, so it works
        if self.tracker.has_connected_with(self.selector.current()) {
            return Err(err.into());
        }
        if !slot
            .fallback
            .select_next_protocol(self.selector.as_ref(), Some(&err), conn_index)
        {
            return Err(TunnelError::FallbackExhausted(err));
        }
        Err(err.into())
    }

    async fn serve_tunnel(
        &self,
        slot: &mut Slot,
        addr: EdgeAddr,
        protocol: Protocol,
        cancel: &CancellationToken,
        connected: &ConnectedSignal,
    ) -> Result<(), SessionError> {
        let conn_index = slot.index;
        let registered = ConnectedSignal::new();
        let session_cancel = cancel.child_token();
        let params = SessionParams {
            conn_index,
            addr,
            protocol,
            previous_attempts: slot.fallback.backoff().retries(),
            connected: registered.clone(),
            cancel: session_cancel.clone(),
            shutdown: self.shutdown.clone(),
        };

        // Own task so a panicking session cannot take the slot down
        let connector = Arc::clone(&self.connector);
        let mut session = tokio::spawn(async move { connector.serve(params).await });

        let mut forwarded = false;
        let result = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    session.abort();
                    let _ = (&mut session).await;
                    break Err(SessionError::Cancelled);
                }
                () = registered.wait(), if !forwarded => {
                    forwarded = true;
                    slot.fallback.reset();
                    self.tracker.on_connected(conn_index, protocol);
                    connected.notify();
                    info!(conn_index, ip = %addr, %protocol, "Registered tunnel connection");
                }
                joined = &mut session => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            Err(SessionError::Panicked(panic_message(&*e.into_panic())))
                        }
                        Err(_) => Err(SessionError::Cancelled),
                    };
                }
                signal = next_reconnect(self.reconnect.as_deref()) => {
                    debug!(conn_index, "Forcefully breaking connection");
                    session_cancel.cancel();
                    session.abort();
                    let _ = (&mut session).await;
                    break Err(SessionError::Reconnect(signal));
                }
            }
        };

        self.tracker.on_disconnected(conn_index);
        result
    }
}

async fn next_reconnect(rx: Option<&Mutex<mpsc::Receiver<ReconnectSignal>>>) -> ReconnectSignal {
    if let Some(rx) = rx {
        if let Some(signal) = rx.lock().await.recv().await {
            return signal;
        }
    }
    std::future::pending().await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::edge::ConfigIpVersion;
    use crate::retry::BackoffHandler;
    use crate::tunnel::addr_handler::addr_handler_for;
    use crate::tunnel::protocol::{AutoProtocolSelector, StaticProtocolSelector};

    /// Plays back one scripted outcome per call.
    #[derive(Default)]
    struct Script {
        outcomes: StdMutex<VecDeque<Result<(), SessionError>>>,
        protocols: StdMutex<Vec<Protocol>>,
    }

    impl Script {
        fn new(outcomes: impl IntoIterator<Item = Result<(), SessionError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into_iter().collect()),
                protocols: StdMutex::default(),
            })
        }
    }

    impl SessionConnector for Script {
        async fn serve(&self, params: SessionParams) -> Result<(), SessionError> {
            self.protocols.lock().unwrap().push(params.protocol);
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(Err(SessionError::Panicked(msg))) => panic!("{msg}"),
                Some(outcome) => outcome,
                None => {
                    params.connected.notify();
                    params.cancel.cancelled().await;
                    Ok(())
                }
            }
        }
    }

    fn edge() -> Arc<Edge> {
        let addrs: Vec<EdgeAddr> = (1..=4)
            .map(|n| EdgeAddr::new(format!("10.0.0.{n}:7844").parse().unwrap()))
            .collect();
        Arc::new(Edge::static_edge(&addrs).unwrap())
    }

    fn server(
        script: Arc<Script>,
        edge: Arc<Edge>,
        selector: Arc<dyn ProtocolSelector>,
    ) -> (EdgeTunnelServer<Script>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let server =
            EdgeTunnelServer::new(script, edge, selector, Arc::new(ConnTracker::new()), rx);
        (server, tx)
    }

    fn slot(max_retries: u32, protocol: Protocol, ip: ConfigIpVersion) -> Slot {
        let backoff = BackoffHandler::new(max_retries, Duration::from_millis(100), false);
        Slot::new(0, ProtocolFallback::new(backoff, protocol), addr_handler_for(ip))
    }

    fn auto() -> Arc<dyn ProtocolSelector> {
        Arc::new(AutoProtocolSelector::new(
            Protocol::Quic,
            0,
            None,
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn clean_stop_finishes_slot() {
        let script = Script::new([Ok(())]);
        let (server, _tx) = server(script, edge(), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_error_rotates_address_and_backs_off() {
        let edge = edge();
        let script = Script::new([Err(SessionError::Dial("refused".into()))]);
        let (server, _tx) = server(script, Arc::clone(&edge), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);

        let first = edge.get_addr(0).unwrap();
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(result, Err(TunnelError::Session(SessionError::Dial("refused".into()))));
        assert_ne!(edge.get_addr(0).unwrap(), first);
        assert_eq!(slot.fallback.backoff().retries(), 1);
        assert_eq!(slot.fallback.protocol(), Protocol::Quic);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_skips_backoff() {
        let edge = edge();
        let script = Script::new([Err(SessionError::DuplicateRegistration("taken".into()))]);
        let (server, _tx) = server(script, Arc::clone(&edge), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Ipv4Only);

        let first = edge.get_addr(0).unwrap();
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert!(matches!(
            result,
            Err(TunnelError::Session(SessionError::DuplicateRegistration(_)))
        ));
        assert_ne!(edge.get_addr(0).unwrap(), first);
        assert_eq!(slot.fallback.backoff().retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_on_quic_falls_back() {
        let script = Script::new([Err(SessionError::IdleTimeout("quiet".into()))]);
        let (server, _tx) = server(script, edge(), auto());
        let mut slot = slot(5, Protocol::Quic, ConfigIpVersion::Auto);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert!(result.is_err());
        assert_eq!(slot.fallback.protocol(), Protocol::Http2);
        assert!(slot.fallback.in_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_without_fallback_gives_up() {
        let selector: Arc<dyn ProtocolSelector> =
            Arc::new(StaticProtocolSelector::new(Protocol::Http2));
        let script = Script::new([Err(SessionError::Transport("reset".into()))]);
        let (server, _tx) = server(script, edge(), selector);
        let mut slot = slot(1, Protocol::Http2, ConfigIpVersion::Auto);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert!(matches!(result, Err(TunnelError::FallbackExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_contained() {
        let script = Script::new([Err(SessionError::Panicked("kaboom".into()))]);
        let (server, _tx) = server(script, edge(), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(
            result,
            Err(TunnelError::Session(SessionError::Panicked("kaboom".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_during_backoff_is_clean() {
        let script = Script::new([Err(SessionError::Transport("reset".into()))]);
        let (server, tx) = server(script, edge(), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);
        tx.send_replace(true);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_session_resets_backoff_and_notifies() {
        let script = Script::new([]);
        let (server, _tx) = server(script, edge(), auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);
        slot.fallback.backoff_mut().arm(Instant::now());

        let cancel = CancellationToken::new();
        let connected = ConnectedSignal::new();
        let canceller = {
            let cancel = cancel.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                connected.wait().await;
                cancel.cancel();
            })
        };
        let result = server.serve(&mut slot, &cancel, &connected).await;
        canceller.await.unwrap();

        assert_eq!(result, Err(TunnelError::Cancelled));
        assert!(connected.is_notified());
        assert!(slot.fallback.backoff().reset_deadline().is_some());
        assert!(!server.tracker.has_connected_with(Protocol::Quic));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_signal_restarts_session() {
        let script = Script::new([]);
        let (server, _tx) = server(script, edge(), auto());
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let server = server.with_reconnect(reconnect_rx);
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);

        let signal = ReconnectSignal::new(Duration::from_secs(2));
        reconnect_tx.send(signal).await.unwrap();
        let start = Instant::now();
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(result, Err(TunnelError::Session(SessionError::Reconnect(signal))));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_is_reported() {
        let edge = Arc::new(
            Edge::static_edge(&[EdgeAddr::new("10.0.0.1:7844".parse().unwrap())]).unwrap(),
        );
        edge.get_addr(5).unwrap();
        let script = Script::new([]);
        let (server, _tx) = server(script, edge, auto());
        let mut slot = slot(3, Protocol::Quic, ConfigIpVersion::Auto);
        let result = server
            .serve(&mut slot, &CancellationToken::new(), &ConnectedSignal::new())
            .await;
        assert_eq!(
            result,
            Err(TunnelError::Edge(crate::edge::EdgeError::NoAddressesLeft))
        );
    }
}
