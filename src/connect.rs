//! Non-blocking connection establishment.
//!
//! [`Listener`] and [`Connector`] are polled until they resolve into a
//! running [`Endpoint`]. Both take an [`EndpointFactory`] so the
//! application's packet and error callbacks are attached atomically with
//! endpoint creation - data can never arrive before a handler exists.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointConfig, EndpointHandler};
use crate::error::{Result, TransportError};

/// Connection establishment deadline for [`Connector`].
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces the handler for a new connection. Called exactly once per
/// connection, before the endpoint's threads start.
pub trait EndpointFactory: Send + Sync {
    fn handler_for(&self, peer: SocketAddr) -> Arc<dyn EndpointHandler>;
}

impl<F> EndpointFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn EndpointHandler> + Send + Sync,
{
    fn handler_for(&self, peer: SocketAddr) -> Arc<dyn EndpointHandler> {
        self(peer)
    }
}

/// Non-blocking accept loop; each `poll` yields at most one endpoint.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<Listener> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one pending connection if there is one. `Ok(None)` means
    /// nothing is pending yet.
    pub fn poll(
        &self,
        factory: &dyn EndpointFactory,
        config: &EndpointConfig,
    ) -> Result<Option<Endpoint>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                // The accepted socket inherits non-blocking mode on some
                // platforms; the endpoint threads need blocking I/O.
                stream.set_nonblocking(false)?;
                let _ = stream.set_nodelay(true);
                let endpoint = Endpoint::spawn(stream, factory.handler_for(peer), config.clone())?;
                Ok(Some(endpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Socket(e)),
        }
    }
}

/// In-progress outbound connection. The TCP handshake runs on a
/// background thread so `poll` never blocks the caller.
pub struct Connector {
    outcome: Arc<Mutex<Option<std::io::Result<TcpStream>>>>,
    thread: Option<JoinHandle<()>>,
    resolved: bool,
}

impl Connector {
    pub fn start(addr: SocketAddr) -> Connector {
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let thread = std::thread::spawn(move || {
            let result = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT);
            *slot.lock() = Some(result);
        });
        Connector {
            outcome,
            thread: Some(thread),
            resolved: false,
        }
    }

    /// `Ok(None)` while the handshake is still in flight, `Ok(Some)`
    /// once it completes, `Err` if it failed. Resolves at most once;
    /// polling after resolution reports the connector as spent.
    pub fn poll(
        &mut self,
        factory: &dyn EndpointFactory,
        config: &EndpointConfig,
    ) -> Result<Option<Endpoint>> {
        if self.resolved {
            return Err(TransportError::EndpointClosed);
        }
        let result = match self.outcome.lock().take() {
            None => return Ok(None),
            Some(result) => result,
        };
        self.resolved = true;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let stream = result?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        debug!("connected to {peer}");
        let endpoint = Endpoint::spawn(stream, factory.handler_for(peer), config.clone())?;
        Ok(Some(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use parking_lot::Mutex;
    use std::time::Instant;

    struct SilentHandler;
    impl EndpointHandler for SilentHandler {
        fn on_packet(&self, _packet: Vec<u8>) {}
        fn on_error(&self, _error: &TransportError) {}
    }

    struct Sink {
        packets: Mutex<Vec<Vec<u8>>>,
    }
    impl EndpointHandler for Sink {
        fn on_packet(&self, packet: Vec<u8>) {
            self.packets.lock().push(packet);
        }
        fn on_error(&self, _error: &TransportError) {}
    }

    fn silent_factory() -> impl EndpointFactory {
        |_peer: SocketAddr| Arc::new(SilentHandler) as Arc<dyn EndpointHandler>
    }

    fn quiet_config() -> EndpointConfig {
        EndpointConfig {
            keepalive_interval: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn listener_poll_returns_none_when_idle() {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let got = listener.poll(&silent_factory(), &quiet_config()).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn connector_and_listener_resolve_into_talking_endpoints() {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_sink = Arc::new(Sink {
            packets: Mutex::new(Vec::new()),
        });
        let sink = server_sink.clone();
        let server_factory = move |_peer: SocketAddr| sink.clone() as Arc<dyn EndpointHandler>;

        let mut connector = Connector::start(addr);
        let config = quiet_config();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut client = None;
        let mut server = None;
        while (client.is_none() || server.is_none()) && Instant::now() < deadline {
            if client.is_none() {
                client = connector.poll(&silent_factory(), &config).unwrap();
            }
            if server.is_none() {
                server = listener.poll(&server_factory, &config).unwrap();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let client = client.expect("connector resolved");
        let _server = server.expect("listener produced endpoint");

        client.send(b"hello").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server_sink.packets.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server_sink.packets.lock().as_slice(), &[b"hello".to_vec()]);
    }

    #[test]
    fn connector_reports_refused_connection() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let sock = TcpListener::bind("127.0.0.1:0").unwrap();
            let p = sock.local_addr().unwrap().port();
            drop(sock);
            p
        };
        let mut connector = Connector::start(format!("127.0.0.1:{port}").parse().unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match connector.poll(&silent_factory(), &quiet_config()) {
                Ok(None) => {
                    assert!(Instant::now() < deadline, "connect never resolved");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(Some(_)) => panic!("connected to a dead port"),
                Err(TransportError::Socket(_)) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }
}
