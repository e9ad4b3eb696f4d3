//! Session implementation that only checks edge reachability.
//!
//! Http2 sessions hold a TCP connection open until the edge closes it.
//! Quic sessions exchange small keepalive datagrams and treat a silent peer
//! as an idle timeout. Neither speaks the real tunnel protocol; the daemon
//! uses this to exercise the supervisor against live addresses.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::tunnel::signal::graceful_shutdown;
use crate::tunnel::{Protocol, SessionConnector, SessionError, SessionParams};

const PING: &[u8] = b"edgelink-ping";

#[derive(Debug, Clone)]
pub struct ReachConnector {
    dial_timeout: Duration,
    keepalive: Duration,
    idle_timeout: Duration,
}

impl ReachConnector {
    pub const fn new(dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            keepalive: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub const fn with_keepalive(mut self, keepalive: Duration, idle_timeout: Duration) -> Self {
        self.keepalive = keepalive;
        self.idle_timeout = idle_timeout;
        self
    }

    async fn serve_stream(&self, mut params: SessionParams) -> Result<(), SessionError> {
        let addr = params.addr.tcp;
        let mut stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SessionError::Dial(e.to_string())),
            Err(_) => {
                return Err(SessionError::Dial(format!(
                    "timed out after {:?}",
                    self.dial_timeout
                )));
            }
        };
        params.connected.notify();
        info!(conn_index = params.conn_index, ip = %addr, protocol = %Protocol::Http2, "Edge reachable");

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                () = params.cancel.cancelled() => return Err(SessionError::Cancelled),
                () = graceful_shutdown(&mut params.shutdown) => return Ok(()),
                read = stream.read(&mut buf) => match read {
                    Ok(0) => return Err(SessionError::Transport("edge closed the connection".into())),
                    Ok(n) => debug!(conn_index = params.conn_index, bytes = n, "Discarding edge data"),
                    Err(e) => return Err(SessionError::Transport(e.to_string())),
                },
            }
        }
    }

    async fn serve_datagram(&self, mut params: SessionParams) -> Result<(), SessionError> {
        let addr = params.addr.udp;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(dial_error)?;
        socket.connect(addr).await.map_err(dial_error)?;

        let mut buf = [0u8; 64];
        loop {
            socket.send(PING).await.map_err(datagram_error)?;
            tokio::select! {
                () = params.cancel.cancelled() => return Err(SessionError::Cancelled),
                () = graceful_shutdown(&mut params.shutdown) => return Ok(()),
                recv = tokio::time::timeout(self.idle_timeout, socket.recv(&mut buf)) => match recv {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(datagram_error(e)),
                    Err(_) => {
                        return Err(SessionError::IdleTimeout(format!(
                            "no reply from {addr} within {:?}",
                            self.idle_timeout
                        )));
                    }
                },
            }
            if params.connected.notify() {
                info!(conn_index = params.conn_index, ip = %addr, protocol = %Protocol::Quic, "Edge reachable");
            }

            tokio::select! {
                () = params.cancel.cancelled() => return Err(SessionError::Cancelled),
                () = graceful_shutdown(&mut params.shutdown) => return Ok(()),
                () = tokio::time::sleep(self.keepalive) => {}
            }
        }
    }
}

impl SessionConnector for ReachConnector {
    async fn serve(&self, params: SessionParams) -> Result<(), SessionError> {
        match params.protocol {
            Protocol::Http2 => self.serve_stream(params).await,
            Protocol::Quic => self.serve_datagram(params).await,
        }
    }
}

/// Failures setting up the datagram socket.
fn dial_error(e: io::Error) -> SessionError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => SessionError::EgressBlocked(e.to_string()),
        _ => SessionError::Dial(e.to_string()),
    }
}

/// Local firewalls reject datagrams with `PermissionDenied`.
fn datagram_error(e: io::Error) -> SessionError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => SessionError::EgressBlocked(e.to_string()),
        io::ErrorKind::ConnectionRefused => SessionError::IdleTimeout(e.to_string()),
        io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::AddrNotAvailable => SessionError::Dial(e.to_string()),
        _ => SessionError::Transport(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::edge::EdgeAddr;
    use crate::tunnel::ConnectedSignal;
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    fn params(
        addr: SocketAddr,
        protocol: Protocol,
    ) -> (SessionParams, CancellationToken, watch::Sender<bool>) {
        let cancel = CancellationToken::new();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let params = SessionParams {
            conn_index: 0,
            addr: EdgeAddr::new(addr),
            protocol,
            previous_attempts: 0,
            connected: ConnectedSignal::new(),
            cancel: cancel.clone(),
            shutdown,
        };
        (params, cancel, shutdown_tx)
    }

    fn connector() -> ReachConnector {
        ReachConnector::new(Duration::from_secs(2))
            .with_keepalive(Duration::from_millis(50), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn refused_stream_is_a_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (params, _cancel, _shutdown) = params(addr, Protocol::Http2);
        let err = connector().serve(params).await.unwrap_err();
        assert!(matches!(err, SessionError::Dial(_)), "{err:?}");
    }

    #[tokio::test]
    async fn stream_closed_by_edge_after_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (params, _cancel, _shutdown) = params(addr, Protocol::Http2);
        let connected = params.connected.clone();
        let err = connector().serve(params).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)), "{err:?}");
        assert!(connected.is_notified());
    }

    #[tokio::test]
    async fn stream_stops_cleanly_on_graceful_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let (params, _cancel, shutdown) = params(addr, Protocol::Http2);
        let connected = params.connected.clone();
        let session = tokio::spawn(async move { connector().serve(params).await });
        connected.wait().await;
        shutdown.send_replace(true);
        assert_eq!(session.await.unwrap(), Ok(()));
        holder.abort();
    }

    #[tokio::test]
    async fn datagram_echo_registers_and_cancels() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..n], peer).await.unwrap();
            }
        });

        let (params, cancel, _shutdown) = params(addr, Protocol::Quic);
        let connected = params.connected.clone();
        let session = tokio::spawn(async move { connector().serve(params).await });
        connected.wait().await;
        cancel.cancel();
        assert_eq!(session.await.unwrap(), Err(SessionError::Cancelled));
    }

    #[tokio::test]
    async fn silent_datagram_peer_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let (params, _cancel, _shutdown) = params(addr, Protocol::Quic);
        let connected = params.connected.clone();
        let err = connector().serve(params).await.unwrap_err();
        assert!(err.is_network_activity_timeout(), "{err:?}");
        assert!(!connected.is_notified());
        drop(silent);
    }

    #[test]
    fn permission_denied_means_egress_blocked() {
        let err = datagram_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, SessionError::EgressBlocked(_)));
        let err = dial_error(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, SessionError::EgressBlocked(_)));
    }

    #[test]
    fn unreachable_datagram_path_is_a_dial_error() {
        for kind in [
            io::ErrorKind::NetworkUnreachable,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::AddrNotAvailable,
        ] {
            let err = datagram_error(io::Error::from(kind));
            assert!(matches!(err, SessionError::Dial(_)), "{kind:?}: {err:?}");
        }
        let err = dial_error(io::Error::from(io::ErrorKind::AddrNotAvailable));
        assert!(matches!(err, SessionError::Dial(_)));
    }

    #[tokio::test]
    async fn unroutable_datagram_address_is_a_dial_error() {
        // An IPv6 destination from an IPv4-only socket cannot be connected
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = socket
            .connect("[::1]:7844")
            .await
            .map_err(dial_error)
            .unwrap_err();
        assert!(
            matches!(err, SessionError::Dial(_) | SessionError::EgressBlocked(_)),
            "{err:?}"
        );
    }
}
