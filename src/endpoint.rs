//! Framed TCP endpoint: one reliable, ordered packet channel.
//!
//! An [`Endpoint`] owns exactly one background sender thread and one
//! background receiver thread over a blocking `TcpStream`. Callers
//! enqueue outbound frames from any thread; complete inbound packets are
//! delivered to the registered [`EndpointHandler`] on the receiver
//! thread. Wire format: `i32 length (LE)` followed by that many payload
//! bytes, with [`KEEPALIVE_SENTINEL`](crate::protocol::KEEPALIVE_SENTINEL)
//! marking zero-payload liveness probes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::{Result, TransportError};
use crate::protocol::{
    frame_header, keepalive_frame, parse_frame_header, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN,
};

/// How often the receiver wakes from a blocked read to check the
/// shutdown flag and the idle deadline.
const READ_TICK: Duration = Duration::from_millis(100);

/// Callbacks wired to an endpoint before its threads start, so no data
/// can arrive without a handler attached.
///
/// Both callbacks run on the endpoint's receiver thread. They must not
/// call [`Endpoint::release`] on their own endpoint (release joins the
/// receiver thread and would deadlock); calling `send` is fine.
pub trait EndpointHandler: Send + Sync {
    /// A complete inbound packet. Ownership transfers to the handler.
    fn on_packet(&self, packet: Vec<u8>);

    /// Fires exactly once, when the endpoint enters its terminal error
    /// state. After this, every `send` fails fast.
    fn on_error(&self, error: &TransportError);
}

/// Per-endpoint configuration. Replaces the process-global timeout
/// toggles of older transports with values scoped to one connection.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Synthesize a keepalive frame after this long with nothing sent.
    /// Zero disables keepalive generation.
    pub keepalive_interval: Duration,
    /// Put the endpoint into `ConnectionTimedOut` after this long with
    /// no inbound bytes. Zero disables timeout monitoring.
    pub idle_timeout: Duration,
    /// Upper bound on an inbound frame's declared payload length.
    pub max_frame_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// State shared between the caller, sender thread and receiver thread.
/// The outbound queue is the only cross-thread mutable state; everything
/// else is atomics.
struct Shared {
    /// Complete frames (header already prefixed), oldest first.
    queue: Mutex<VecDeque<Vec<u8>>>,
    /// Signaled on enqueue and on shutdown.
    send_signal: Condvar,
    /// Both threads exit when set.
    shutdown: AtomicBool,
    /// An error or timeout has been observed.
    dead: AtomicBool,
    /// Guarantees the error callback fires at most once.
    error_fired: AtomicBool,
}

impl Shared {
    /// Move the endpoint into its terminal error state. Safe to call
    /// from either thread; only the first caller reports.
    fn fail(&self, handler: &dyn EndpointHandler, stream: &TcpStream, err: TransportError) {
        self.dead.store(true, Ordering::SeqCst);
        if !self.error_fired.swap(true, Ordering::SeqCst) {
            error!("endpoint entering error state: {err}");
            handler.on_error(&err);
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.send_signal.notify_all();
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// One TCP connection with framed, ordered packet delivery and liveness
/// monitoring. Destroyed only after both its threads have terminated.
pub struct Endpoint {
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
    /// Kept only to force-unblock the threads on release.
    stream: TcpStream,
    sender: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Wrap an established connection, attach the handler, and start the
    /// sender and receiver threads. The handler is in place before the
    /// receiver thread reads its first byte.
    pub fn spawn(
        stream: TcpStream,
        handler: Arc<dyn EndpointHandler>,
        config: EndpointConfig,
    ) -> std::io::Result<Endpoint> {
        let peer_addr = stream.peer_addr()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            send_signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            error_fired: AtomicBool::new(false),
        });

        let send_stream = stream.try_clone()?;
        if !config.idle_timeout.is_zero() {
            send_stream.set_write_timeout(Some(config.idle_timeout))?;
        }
        let recv_stream = stream.try_clone()?;
        recv_stream.set_read_timeout(Some(READ_TICK))?;

        let sender = {
            let shared = shared.clone();
            let handler = handler.clone();
            let keepalive = config.keepalive_interval;
            std::thread::Builder::new()
                .name(format!("filecast-send-{peer_addr}"))
                .spawn(move || sender_loop(send_stream, shared, handler, keepalive))?
        };
        let receiver = {
            let shared = shared.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("filecast-recv-{peer_addr}"))
                .spawn(move || receiver_loop(recv_stream, shared, handler, config))?
        };

        Ok(Endpoint {
            peer_addr,
            shared,
            stream,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True until an error or timeout has been observed by either
    /// background thread, or the endpoint was released.
    pub fn is_alive(&self) -> bool {
        !self.shared.dead.load(Ordering::SeqCst) && !self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Enqueue one length-prefixed frame and return immediately.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_batch(&[payload])
    }

    /// Concatenate `chunks` into a single frame (one length prefix for
    /// the total) and enqueue it.
    pub fn send_batch(&self, chunks: &[&[u8]]) -> Result<()> {
        if !self.is_alive() {
            return Err(TransportError::EndpointClosed);
        }
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + total);
        frame.extend_from_slice(&frame_header(total));
        for chunk in chunks {
            frame.extend_from_slice(chunk);
        }

        let mut queue = self.shared.queue.lock();
        // Re-check under the lock: a frame must never be queued after
        // teardown started, or it would leak past the drain.
        if self.shared.shutdown.load(Ordering::SeqCst) || self.shared.dead.load(Ordering::SeqCst) {
            return Err(TransportError::EndpointClosed);
        }
        queue.push_back(frame);
        drop(queue);
        self.shared.send_signal.notify_one();
        Ok(())
    }

    /// Signal both background threads to stop, join them, and discard
    /// any frames still queued. Safe to call while the packet callback
    /// is executing on the receiver thread: the join blocks until the
    /// callback returns. Must not be called from the endpoint's own
    /// callbacks.
    pub fn release(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.send_signal.notify_all();
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(h) = self.sender.lock().take() {
            let _ = h.join();
        }
        if let Some(h) = self.receiver.lock().take() {
            let _ = h.join();
        }
        self.shared.queue.lock().clear();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sender thread: waits for {shutdown, data ready, keepalive interval},
/// writes exactly one frame at a time.
fn sender_loop(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    handler: Arc<dyn EndpointHandler>,
    keepalive: Duration,
) {
    loop {
        let frame = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(frame) = queue.pop_front() {
                    break frame;
                }
                if keepalive.is_zero() {
                    shared.send_signal.wait(&mut queue);
                } else {
                    let timed_out = shared
                        .send_signal
                        .wait_for(&mut queue, keepalive)
                        .timed_out();
                    if timed_out && queue.is_empty() && !shared.shutdown.load(Ordering::SeqCst) {
                        // Nothing sent within the interval: probe liveness.
                        break keepalive_frame().to_vec();
                    }
                }
            }
        };

        // One write_all per frame; the next frame is not dequeued until
        // this one has been handed to the kernel in full.
        if let Err(e) = stream.write_all(&frame) {
            if shared.shutdown.load(Ordering::SeqCst) {
                // Release tore the socket down under us; not an error.
                return;
            }
            let err = if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                TransportError::ConnectionTimedOut
            } else {
                TransportError::Socket(e)
            };
            shared.fail(handler.as_ref(), &stream, err);
            return;
        }
        trace!("sent frame of {} bytes", frame.len());
    }
}

/// Outcome of one resumable exact-read.
enum ReadOutcome {
    /// Buffer filled.
    Done,
    /// Shutdown flag observed while waiting.
    Exit,
}

/// Receiver thread: two-phase reads (4-byte length, then payload),
/// resuming partial reads, with idle-timeout monitoring between ticks.
fn receiver_loop(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    handler: Arc<dyn EndpointHandler>,
    config: EndpointConfig,
) {
    let mut last_rx = Instant::now();
    loop {
        // Phase 1: frame length.
        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_exact_resumable(&mut stream, &mut header, &shared, &config, &mut last_rx) {
            Ok(ReadOutcome::Done) => {}
            Ok(ReadOutcome::Exit) => return,
            Err(err) => {
                shared.fail(handler.as_ref(), &stream, err);
                return;
            }
        }
        let len = match parse_frame_header(header, config.max_frame_size) {
            // Keepalive: liveness observed (last_rx already advanced),
            // nothing to deliver.
            Ok(None) => {
                trace!("keepalive from {:?}", stream.peer_addr());
                continue;
            }
            Ok(Some(len)) => len,
            Err(err) => {
                shared.fail(handler.as_ref(), &stream, err);
                return;
            }
        };

        // Phase 2: payload.
        let mut payload = vec![0u8; len];
        match read_exact_resumable(&mut stream, &mut payload, &shared, &config, &mut last_rx) {
            Ok(ReadOutcome::Done) => {}
            Ok(ReadOutcome::Exit) => return,
            Err(err) => {
                shared.fail(handler.as_ref(), &stream, err);
                return;
            }
        }
        debug!("packet of {len} bytes ready");
        handler.on_packet(payload);
    }
}

/// Read exactly `buf.len()` bytes, tracking bytes-received-so-far so a
/// partial read is resumed, not restarted. Read-timeout ticks are used
/// to observe the shutdown flag and enforce the idle deadline.
fn read_exact_resumable(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shared: &Shared,
    config: &EndpointConfig,
    last_rx: &mut Instant,
) -> Result<ReadOutcome> {
    let mut got = 0;
    while got < buf.len() {
        if shared.shutdown.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::Exit);
        }
        match stream.read(&mut buf[got..]) {
            Ok(0) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return Ok(ReadOutcome::Exit);
                }
                return Err(TransportError::Socket(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                )));
            }
            Ok(n) => {
                got += n;
                *last_rx = Instant::now();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if !config.idle_timeout.is_zero() && last_rx.elapsed() >= config.idle_timeout {
                    return Err(TransportError::ConnectionTimedOut);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return Ok(ReadOutcome::Exit);
                }
                return Err(TransportError::Socket(e));
            }
        }
    }
    Ok(ReadOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    /// Collects packets and counts error callbacks.
    pub(crate) struct RecordingHandler {
        pub packets: Mutex<Vec<Vec<u8>>>,
        pub errors: AtomicUsize,
        pub timeouts: AtomicUsize,
    }

    impl RecordingHandler {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(Vec::new()),
                errors: AtomicUsize::new(0),
                timeouts: AtomicUsize::new(0),
            })
        }

        fn wait_for_packets(&self, n: usize, deadline: Duration) -> bool {
            let start = Instant::now();
            while start.elapsed() < deadline {
                if self.packets.lock().len() >= n {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    impl EndpointHandler for RecordingHandler {
        fn on_packet(&self, packet: Vec<u8>) {
            self.packets.lock().push(packet);
        }
        fn on_error(&self, error: &TransportError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            if matches!(error, TransportError::ConnectionTimedOut) {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn quiet_config() -> EndpointConfig {
        EndpointConfig {
            keepalive_interval: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_preserves_order_and_content() {
        let (a, b) = loopback_pair();
        let tx_handler = RecordingHandler::new();
        let rx_handler = RecordingHandler::new();
        let tx = Endpoint::spawn(a, tx_handler, quiet_config()).unwrap();
        let _rx_hold = Endpoint::spawn(b, rx_handler.clone(), quiet_config()).unwrap();

        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; (i as usize) * 37 + 1]).collect();
        for p in &payloads {
            tx.send(p).unwrap();
        }
        assert!(rx_handler.wait_for_packets(payloads.len(), Duration::from_secs(5)));
        assert_eq!(*rx_handler.packets.lock(), payloads);
        assert!(tx.is_alive());
    }

    #[test]
    fn send_batch_concatenates_into_one_packet() {
        let (a, b) = loopback_pair();
        let rx_handler = RecordingHandler::new();
        let tx = Endpoint::spawn(a, RecordingHandler::new(), quiet_config()).unwrap();
        let _rx = Endpoint::spawn(b, rx_handler.clone(), quiet_config()).unwrap();

        tx.send_batch(&[b"abc", b"", b"defg"]).unwrap();
        assert!(rx_handler.wait_for_packets(1, Duration::from_secs(5)));
        assert_eq!(rx_handler.packets.lock()[0], b"abcdefg");
    }

    #[test]
    fn keepalives_are_invisible_to_the_packet_callback() {
        let (a, b) = loopback_pair();
        let rx_handler = RecordingHandler::new();
        let tx_cfg = EndpointConfig {
            keepalive_interval: Duration::from_millis(10),
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        let tx = Endpoint::spawn(a, RecordingHandler::new(), tx_cfg).unwrap();
        let _rx = Endpoint::spawn(b, rx_handler.clone(), quiet_config()).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert!(rx_handler.packets.lock().is_empty());

        // Real data still frames correctly between keepalives.
        tx.send(b"payload").unwrap();
        assert!(rx_handler.wait_for_packets(1, Duration::from_secs(5)));
        assert_eq!(rx_handler.packets.lock()[0], b"payload");
    }

    #[test]
    fn idle_timeout_fires_error_exactly_once() {
        let (a, b) = loopback_pair();
        let handler = RecordingHandler::new();
        let cfg = EndpointConfig {
            keepalive_interval: Duration::ZERO,
            idle_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let ep = Endpoint::spawn(a, handler.clone(), cfg).unwrap();
        // Peer stays completely silent.
        let _silent = b;

        std::thread::sleep(Duration::from_millis(900));
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 1);
        assert!(!ep.is_alive());
        assert!(matches!(
            ep.send(b"too late"),
            Err(TransportError::EndpointClosed)
        ));
    }

    #[test]
    fn peer_disconnect_is_a_socket_error() {
        let (a, b) = loopback_pair();
        let handler = RecordingHandler::new();
        let ep = Endpoint::spawn(a, handler.clone(), quiet_config()).unwrap();
        drop(b);

        let start = Instant::now();
        while ep.is_alive() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!ep.is_alive());
        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_joins_threads_and_fails_later_sends() {
        let (a, _b) = loopback_pair();
        let ep = Endpoint::spawn(a, RecordingHandler::new(), quiet_config()).unwrap();
        ep.send(b"queued").unwrap();
        ep.release();
        assert!(!ep.is_alive());
        assert!(matches!(ep.send(b"x"), Err(TransportError::EndpointClosed)));
        // Idempotent.
        ep.release();
    }
}
