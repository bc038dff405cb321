//! The event loop.
//!
//! A [`Reactor`] owns one listening socket, one readiness registry and the
//! table of accepted connections, and drives them from a single thread:
//!
//! ```text
//! wait ──> listener ready ──> accept ──> register ──> table.add ──> on_client_connected
//!     └──> client ready   ──> read ─┬─> n > 0  ──> on_message_received
//!                                   └─> 0/err  ──> on_client_disconnected
//!                                                  ──> unregister ──> table.remove ──> close
//! ```
//!
//! Readiness is edge-triggered. Accepting therefore drains the whole backlog
//! per event, while reading takes exactly one buffer per connection per
//! iteration and schedules a continuation read for the next iteration when
//! more data may be queued.

use crate::config::ListenerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionTable};
use crate::error::Error;
use crate::handler::{Context, Handler};
use crate::registry::ReadinessRegistry;
use crate::socket::{create_listener, ListeningSocket};

use mio::net::TcpStream;
use mio::{Interest, Token, Waker};
use std::collections::{HashSet, VecDeque};
use std::io::{ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for token assignment
const LISTENER_ID: usize = 0;
const WAKE_ID: usize = 1;
const CONNECTION_ID_RANGE_START: usize = 1000;

const SOCKET_INTEREST: Interest = Interest::READABLE.add(Interest::WRITABLE);
const MAX_SPURIOUS_WAKEUPS: usize = 10;

/// Lifecycle of a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    /// Created; the listener is not open yet.
    Initializing,
    /// Listening and dispatching events.
    Running,
    /// Closing the remaining connections and the listener.
    Draining,
    /// Everything is closed. The reactor cannot be restarted.
    Stopped,
}

/// Stops a running [`Reactor`] from any thread.
///
/// Sets the stop flag and wakes the reactor's readiness wait, so a reactor
/// blocked without a timeout still notices the request promptly.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake()?;
        Ok(())
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Single-threaded TCP connection multiplexer.
///
/// # Example
///
/// ```no_run
/// use rustmux::{ConnectionId, Context, Handler, ListenerConfig, Reactor};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
///         let _ = ctx.send_to(id, data);
///     }
/// }
///
/// let mut reactor = Reactor::new(ListenerConfig::new("127.0.0.1", 9000), Echo)?;
/// reactor.init()?;
/// let stop = reactor.stop_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     let _ = stop.stop();
/// });
/// reactor.run()?;
/// # Ok::<(), rustmux::Error>(())
/// ```
pub struct Reactor<H> {
    config: ListenerConfig,
    handler: H,
    state: ReactorState,
    registry: ReadinessRegistry,
    listener: Option<ListeningSocket>,
    local_addr: Option<SocketAddr>,
    connections: ConnectionTable,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    read_buf: Vec<u8>,
    // Connections to read again next iteration, with whether the peer has
    // already signalled a close.
    continued_reads: VecDeque<(ConnectionId, bool)>,
    // The backlog may still hold connections after a hard accept error.
    retry_accept: bool,
    pending_closes: Vec<ConnectionId>,
    next_id: usize,
    spurious_wakeups: usize,
}

// ============================================================================
// Constructors and Accessors
// ============================================================================

impl<H: Handler> Reactor<H> {
    /// Creates the readiness registry and the stop waker. The listener is
    /// opened by [`init()`](Self::init).
    pub fn new(config: ListenerConfig, handler: H) -> Result<Self, Error> {
        config.validate()?;
        let mut registry = ReadinessRegistry::new(config.max_events())?;
        let waker = Arc::new(registry.waker(Token(WAKE_ID))?);
        let read_buf = vec![0; config.max_read_size()];

        Ok(Self {
            config,
            handler,
            state: ReactorState::Initializing,
            registry,
            listener: None,
            local_addr: None,
            connections: ConnectionTable::new(),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            read_buf,
            continued_reads: VecDeque::new(),
            retry_accept: false,
            pending_closes: Vec::new(),
            next_id: CONNECTION_ID_RANGE_START,
            spurious_wakeups: 0,
        })
    }

    pub fn state(&self) -> ReactorState {
        self.state
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// The bound listener address, once [`init()`](Self::init) succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl<H: Handler> Reactor<H> {
    /// Opens the listening socket and registers it.
    ///
    /// On failure the reactor moves to [`ReactorState::Stopped`] and the
    /// startup error is returned.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<SocketAddr, Error> {
        if self.state != ReactorState::Initializing {
            return Err(Error::InvalidState { state: self.state });
        }

        match self.open_listener() {
            Ok(local_addr) => {
                self.state = ReactorState::Running;
                Ok(local_addr)
            }
            Err(err) => {
                error!(?err, "Failed to initialize listener");
                self.state = ReactorState::Stopped;
                Err(err)
            }
        }
    }

    /// Runs the event loop until a stop is requested through a
    /// [`StopHandle`], then closes every connection and the listener.
    ///
    /// Calls [`init()`](Self::init) first if that has not happened yet.
    /// Errors after startup are logged and do not end the loop.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), Error> {
        match self.state {
            ReactorState::Initializing => {
                self.init()?;
            }
            ReactorState::Running => {}
            state => return Err(Error::InvalidState { state }),
        }

        info!(local_addr = ?self.local_addr, "Reactor running");
        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.turn(self.config.poll_timeout()) {
                error!(?err, "Error waiting for events");
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Performs a single wait-and-dispatch iteration.
    ///
    /// For driving the reactor from an outer loop. The wait is bounded by
    /// `timeout` and returns early when continuation reads are pending.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.state != ReactorState::Running {
            return Err(Error::InvalidState { state: self.state });
        }
        self.turn(timeout)
    }

    /// Closes every remaining connection, firing `on_client_disconnected` for
    /// each, then closes the listener. Idempotent.
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) {
        if self.state == ReactorState::Stopped {
            return;
        }
        self.state = ReactorState::Draining;

        let ids = self.connections.ids();
        debug!(count = ids.len(), "Draining connections");
        for id in ids {
            self.disconnect(id);
        }

        if let Some(mut listener) = self.listener.take() {
            if let Err(err) = self.registry.unregister(&mut listener, Token(LISTENER_ID)) {
                warn!(?err, "Failed to unregister listener");
            }
            info!(local_addr = %listener.local_addr(), "Closed listener");
        }

        self.continued_reads.clear();
        self.retry_accept = false;
        self.state = ReactorState::Stopped;
        info!("Reactor stopped");
    }
}

// ============================================================================
// Internal Event Processing
// ============================================================================

impl<H: Handler> Reactor<H> {
    fn open_listener(&mut self) -> Result<SocketAddr, Error> {
        let mut listener = create_listener(&self.config)?;
        self.registry
            .register(&mut listener, Token(LISTENER_ID), SOCKET_INTEREST)?;
        let local_addr = listener.local_addr();
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    fn turn(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = if self.continued_reads.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let events = self.registry.wait(timeout)?;
        trace!(count = events.len(), "Fetched readiness events");

        let continued: Vec<_> = self.continued_reads.drain(..).collect();
        let mut read_this_turn = HashSet::new();
        let mut accepted_this_turn = false;

        for event in &events {
            match event.token() {
                Token(LISTENER_ID) => {
                    accepted_this_turn = true;
                    self.accept_connections();
                }
                Token(WAKE_ID) => trace!("Woken up"),
                Token(id) => {
                    let id = ConnectionId::new(id);
                    if !event.wants_read() {
                        trace!(%id, "Writable");
                        continue;
                    }
                    if read_this_turn.insert(id) {
                        let peer_closed = event.is_read_closed() || event.is_error();
                        self.read_connection(id, peer_closed, false);
                    }
                }
            }
        }

        // Unlike continued reads, a pending accept retry does not shorten
        // the wait.
        if self.retry_accept && !accepted_this_turn {
            debug!("Retrying accept");
            self.accept_connections();
        }

        for (id, peer_closed) in continued {
            if read_this_turn.insert(id) {
                self.read_connection(id, peer_closed, true);
            }
        }

        Ok(())
    }

    fn bound_addr(&self) -> SocketAddr {
        self.local_addr
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }
}

// ============================================================================
// Internal Connection I/O
// ============================================================================

impl<H: Handler> Reactor<H> {
    #[instrument(skip(self))]
    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let local_addr = listener.local_addr();
        self.retry_accept = false;

        // Collect first, then admit, so the listener borrow ends before the
        // handler runs.
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => accepted.push((stream, peer_addr)),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, %local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, %local_addr, "Error accepting connection, retrying next turn");
                        self.retry_accept = true;
                        break;
                    }
                },
            }
        }

        // A wake with nothing to accept is harmless.
        self.track_spurious_wakeup(accepted.is_empty());

        for (stream, peer_addr) in accepted {
            self.admit(stream, peer_addr);
        }
    }

    fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(self.config.no_delay()) {
            warn!(%peer_addr, ?err, "Failed to set TCP_NODELAY");
        }

        let connection = match Connection::new(stream, peer_addr) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(%peer_addr, ?err, "Dropping connection without local address");
                return;
            }
        };

        let id = self.next_connection_id();
        if let Err(err) = self.connections.add(id, connection) {
            error!(%id, %peer_addr, ?err, "Failed to add connection");
            return;
        }

        let registered = match self.connections.get_mut(id) {
            Some(connection) => {
                self.registry
                    .register(connection.stream_mut(), id.token(), SOCKET_INTEREST)
            }
            None => return,
        };
        if let Err(err) = registered {
            // Roll back: an unregistered connection would never be served.
            error!(%id, %peer_addr, ?err, "Failed to register connection, dropping it");
            self.connections.remove(id);
            return;
        }

        info!(%id, %peer_addr, "Accepted connection");

        let local_addr = self.bound_addr();
        let mut ctx = Context::new(&mut self.connections, &mut self.pending_closes, local_addr);
        self.handler.on_client_connected(&mut ctx, id);
        self.flush_pending_closes();
    }

    #[instrument(skip(self))]
    fn read_connection(&mut self, id: ConnectionId, peer_closed: bool, continuation: bool) {
        let local_addr = self.bound_addr();

        let Some(connection) = self.connections.get_mut(id) else {
            trace!("Event for a connection that is already gone");
            return;
        };
        if connection.is_closing() {
            return;
        }
        let peer_addr = connection.peer_addr();

        let result = loop {
            match connection.stream_mut().read(&mut self.read_buf) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) => {
                info!(%peer_addr, "Connection closed by peer");
                self.disconnect(id);
            }
            Ok(sz) => {
                trace!(len = sz, %peer_addr, "Read data from socket");
                self.track_spurious_wakeup(false);

                // Edge-triggered readiness will not fire again for data that
                // is already queued, nor for a close that was already seen.
                if sz == self.read_buf.len() || peer_closed {
                    self.continued_reads.push_back((id, peer_closed));
                }

                let mut ctx =
                    Context::new(&mut self.connections, &mut self.pending_closes, local_addr);
                self.handler
                    .on_message_received(&mut ctx, id, &self.read_buf[..sz]);
                self.flush_pending_closes();
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if !continuation {
                    self.track_spurious_wakeup(true);
                }
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::BrokenPipe => warn!(%peer_addr, "Broken pipe"),
                    ErrorKind::ConnectionReset => warn!(%peer_addr, "Connection reset"),
                    _ => error!(%peer_addr, ?err, "Error reading from socket"),
                }
                self.disconnect(id);
            }
        }
    }

    // Tears down one connection and every close the handler requested while
    // reacting to it.
    fn disconnect(&mut self, id: ConnectionId) {
        self.close_connection(id);
        self.flush_pending_closes();
    }

    fn flush_pending_closes(&mut self) {
        // Closing may queue further closes from the disconnect callbacks.
        while !self.pending_closes.is_empty() {
            for id in std::mem::take(&mut self.pending_closes) {
                self.close_connection(id);
            }
        }
    }

    // Order: callback, unregister, remove, close. The callback runs while the
    // connection is still in the table so the handler can look it up.
    fn close_connection(&mut self, id: ConnectionId) {
        match self.connections.get_mut(id) {
            Some(connection) if !connection.is_closing() => connection.mark_closing(),
            _ => return,
        }

        let local_addr = self.bound_addr();
        let mut ctx = Context::new(&mut self.connections, &mut self.pending_closes, local_addr);
        self.handler.on_client_disconnected(&mut ctx, id);

        if let Some(mut connection) = self.connections.remove(id) {
            if let Err(err) = self.registry.unregister(connection.stream_mut(), id.token()) {
                warn!(%id, ?err, "Failed to unregister connection");
            }
            let peer_addr = connection.peer_addr();
            drop(connection);
            info!(%id, %peer_addr, "Closed connection");
        }

        self.continued_reads.retain(|&(pending, _)| pending != id);
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl<H: Handler> Reactor<H> {
    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        loop {
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(CONNECTION_ID_RANGE_START);
            if !self.connections.contains(ConnectionId::new(self.next_id)) {
                break;
            }
        }
        id
    }

    fn track_spurious_wakeup(&mut self, is_spurious: bool) {
        if is_spurious {
            self.spurious_wakeups += 1;
            debug!(count = self.spurious_wakeups, "Spurious wakeup");
            if self.spurious_wakeups == MAX_SPURIOUS_WAKEUPS {
                warn!(count = self.spurious_wakeups, "Repeated spurious wakeups");
            }
        } else {
            self.spurious_wakeups = 0;
        }
    }
}
