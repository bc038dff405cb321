//! Shared test helpers: a recording handler, tracing setup, and a pump that
//! drives a reactor from the test thread.
//!
//! Use TEST_LOG environment variable to control tracing verbosity:
//!
//! ```bash
//! TEST_LOG=2 cargo test --test reactor -- --nocapture
//! ```

#![allow(dead_code)]

use rustmux::prelude::*;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("rustmux={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Recording Handler
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Message(ConnectionId, Vec<u8>),
}

/// What the recorder does in response to a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only record.
    Record,
    /// Send the bytes back to the sender.
    Echo,
    /// `broadcast_except` the bytes to everyone but the sender.
    Relay,
    /// Close the sender's connection.
    Kick,
}

pub struct Recorder {
    pub mode: Mode,
    pub events: Vec<Observed>,
    /// Recipient counts returned by every relay broadcast.
    pub broadcast_results: Vec<usize>,
    /// Peer address as seen from inside `on_client_disconnected`.
    pub peer_addrs_on_disconnect: Vec<Option<SocketAddr>>,
    /// Connected count and `broadcast_except` result seen from inside
    /// `on_client_disconnected`.
    pub reach_on_disconnect: Vec<(usize, usize)>,
}

impl Recorder {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            events: Vec::new(),
            broadcast_results: Vec::new(),
            peer_addrs_on_disconnect: Vec::new(),
            reach_on_disconnect: Vec::new(),
        }
    }

    pub fn connected(&self) -> Vec<ConnectionId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Observed::Connected(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn disconnected(&self) -> Vec<ConnectionId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Observed::Disconnected(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn chunks_from(&self, id: ConnectionId) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Observed::Message(from, data) if *from == id => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn received_from(&self, id: ConnectionId) -> Vec<u8> {
        self.chunks_from(id).concat()
    }

    pub fn message_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Observed::Message(..)))
            .count()
    }
}

impl Handler for Recorder {
    fn on_client_connected(&mut self, _ctx: &mut Context<'_>, id: ConnectionId) {
        self.events.push(Observed::Connected(id));
    }

    fn on_client_disconnected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        self.events.push(Observed::Disconnected(id));
        self.peer_addrs_on_disconnect.push(ctx.peer_addr(id));
        let reached = ctx.broadcast_except(id, b"");
        self.reach_on_disconnect
            .push((ctx.connection_count(), reached));
    }

    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        self.events.push(Observed::Message(id, data.to_vec()));
        match self.mode {
            Mode::Record => {}
            Mode::Echo => {
                ctx.send_to(id, data).expect("echo failed");
            }
            Mode::Relay => {
                let reached = ctx.broadcast_except(id, data);
                self.broadcast_results.push(reached);
            }
            Mode::Kick => ctx.disconnect(id),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn new_reactor(mode: Mode) -> (Reactor<Recorder>, SocketAddr) {
    init_tracing();
    let mut reactor = Reactor::new(ListenerConfig::new("127.0.0.1", 0), Recorder::new(mode))
        .expect("Failed to create reactor");
    let addr = reactor.init().expect("Failed to init reactor");
    (reactor, addr)
}

/// Runs reactor iterations on the current thread until `done` holds.
pub fn pump_until<H, F>(reactor: &mut Reactor<H>, mut done: F)
where
    H: Handler,
    F: FnMut(&H) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(reactor.handler()) {
        assert!(Instant::now() < deadline, "Timed out waiting for reactor");
        reactor
            .run_once(Some(Duration::from_millis(20)))
            .expect("run_once failed");
    }
}

/// Connects a client and pumps until the reactor has accepted it.
pub fn connect(reactor: &mut Reactor<Recorder>, addr: SocketAddr) -> (TcpStream, ConnectionId) {
    let before = reactor.handler().connected().len();
    let stream = TcpStream::connect(addr).expect("Failed to connect");
    pump_until(reactor, |h| h.connected().len() > before);
    let id = *reactor.handler().connected().last().expect("No connection");
    (stream, id)
}

/// Reads exactly `len` bytes or panics after a timeout.
pub fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("Failed to read");
    buf
}

/// Asserts that nothing arrives on `stream` within a short window.
pub fn assert_nothing_received(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .expect("Failed to set read timeout");
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(n) => panic!("Unexpectedly received {n} bytes"),
        Err(err) => assert!(
            matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            "Unexpected error: {err}"
        ),
    }
}

/// Asserts that the server closed `stream`.
pub fn assert_closed_by_server(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set read timeout");
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::ConnectionReset => return,
            Err(err) => panic!("Expected EOF, got {err}"),
        }
    }
}
