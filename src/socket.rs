//! Listening socket setup.
//!
//! The listener is created step by step with socket2 rather than through
//! `TcpListener::bind`, so that each failing step maps to its own error and the
//! backlog can be set to the platform maximum.

use crate::config::ListenerConfig;
use crate::error::Error;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, info, instrument};

#[cfg(unix)]
const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;
// SOMAXCONN on Windows
#[cfg(not(unix))]
const LISTEN_BACKLOG: i32 = 0x7fff_ffff;

/// The non-blocking listening socket of one reactor.
///
/// Owns the OS handle; dropping it closes the socket.
#[derive(Debug)]
pub struct ListeningSocket {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl ListeningSocket {
    /// The address actually bound, which differs from the configured one when
    /// port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one pending connection. Returns `WouldBlock` when the backlog
    /// is empty.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }
}

impl Source for ListeningSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// Resolves the configured bind address to the first matching socket address.
pub fn resolve_bind_addr(config: &ListenerConfig) -> Result<SocketAddr, Error> {
    let invalid = |source| Error::InvalidAddress {
        address: format!("{}:{}", config.bind_address(), config.bind_port()),
        source,
    };
    (config.bind_address(), config.bind_port())
        .to_socket_addrs()
        .map_err(invalid)?
        .next()
        .ok_or_else(|| {
            invalid(io::Error::new(
                io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })
}

/// Creates a non-blocking stream socket bound to the configured address and
/// puts it into listening mode.
#[instrument(skip(config), fields(address = config.bind_address(), port = config.bind_port()))]
pub fn create_listener(config: &ListenerConfig) -> Result<ListeningSocket, Error> {
    let addr = resolve_bind_addr(config)?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::SocketCreate)?;
    socket.set_nonblocking(true).map_err(Error::SocketCreate)?;
    // Lets a restarted server rebind while old connections sit in TIME_WAIT.
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(Error::SocketCreate)?;

    socket
        .bind(&addr.into())
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| Error::Listen { addr, source })?;
    debug!(backlog = LISTEN_BACKLOG, "Socket listening");

    let inner = TcpListener::from_std(socket.into());
    let local_addr = inner.local_addr()?;
    info!(%local_addr, "Created listener");

    Ok(ListeningSocket { inner, local_addr })
}
