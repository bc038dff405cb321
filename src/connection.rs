//! Connection table and the outbound send path.
//!
//! The table owns every accepted [`TcpStream`]. A connection is present iff its
//! stream is open and registered with the readiness registry; removing the
//! entry and dropping it closes the socket.

use crate::error::Error;

use mio::net::TcpStream;
use mio::Token;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Identifies one accepted client connection.
///
/// The value doubles as the token the connection is registered under, so it is
/// unique among live connections, the listener and the waker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn new(id: usize) -> Self {
        ConnectionId(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ConnectionId> for usize {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// One accepted client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    // Set once teardown has started; the connection no longer takes part in
    // broadcasts and ignores further reads.
    closing: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            local_addr,
            closing: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
    }

    // Writes as much of `data` as the socket takes without blocking and
    // returns the number of bytes written.
    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => break,
                Ok(sz) => {
                    written += sz;
                    trace!(len = sz, remaining = data.len() - written, peer_addr = %self.peer_addr, "Wrote to socket");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }
}

/// The set of currently accepted client connections.
///
/// Iteration follows [`ConnectionId`] order, which is accept order because ids
/// are handed out monotonically.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly accepted connection.
    ///
    /// Adding an id that is already present is a programming error: it panics
    /// in debug builds and returns [`Error::InvariantViolation`] otherwise,
    /// leaving the existing entry untouched.
    pub fn add(&mut self, id: ConnectionId, connection: Connection) -> Result<(), Error> {
        if self.connections.contains_key(&id) {
            debug_assert!(false, "connection {id} added twice");
            return Err(Error::InvariantViolation(format!(
                "connection {id} added twice"
            )));
        }
        self.connections.insert(id, connection);
        Ok(())
    }

    /// Removes a connection and hands ownership of its stream back to the
    /// caller. Returns `None` if the id is not present.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_none() {
            warn!(%id, "Connection not found when removing connection");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Ids of every connection in the table, including ones being torn down.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Calls `f` for every live connection whose id is not in `exclude`.
    /// Connections that are being torn down are skipped.
    pub fn for_each_except<F>(&mut self, exclude: &[ConnectionId], mut f: F)
    where
        F: FnMut(ConnectionId, &mut Connection),
    {
        for (&id, connection) in self.connections.iter_mut() {
            if connection.closing || exclude.contains(&id) {
                continue;
            }
            f(id, connection);
        }
    }

    // ============================================================================
    // Outbound Send API
    // ============================================================================

    /// Sends `data` to one connection without blocking.
    ///
    /// Returns the number of bytes written, which always equals `data.len()`
    /// on success. If the socket stops accepting data part way through, the
    /// remainder is dropped and [`Error::ShortWrite`] reports how much went
    /// out.
    pub fn send_to(&mut self, id: ConnectionId, data: &[u8]) -> Result<usize, Error> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(Error::ConnectionNotFound { id: id.as_usize() })?;
        let written = connection.write_nonblocking(data)?;
        if written < data.len() {
            return Err(Error::ShortWrite {
                id: id.as_usize(),
                written,
                len: data.len(),
            });
        }
        debug!(%id, len = written, "Sent data");
        Ok(written)
    }

    /// Sends `data` to every live connection except `sender` and returns how
    /// many recipients got the complete payload.
    pub fn broadcast_except(&mut self, sender: ConnectionId, data: &[u8]) -> usize {
        self.broadcast_except_many(&[sender], data)
    }

    /// Sends `data` to every live connection.
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        self.broadcast_except_many(&[], data)
    }

    /// Sends `data` to every live connection not listed in `except`.
    ///
    /// Failures are logged per recipient and do not stop the broadcast.
    pub fn broadcast_except_many(&mut self, except: &[ConnectionId], data: &[u8]) -> usize {
        let mut delivered = 0;
        self.for_each_except(except, |id, connection| {
            let peer_addr = connection.peer_addr;
            match connection.write_nonblocking(data) {
                Ok(written) if written == data.len() => delivered += 1,
                Ok(written) => {
                    warn!(%id, %peer_addr, written, len = data.len(), "Short write during broadcast");
                }
                Err(err) => {
                    warn!(%id, %peer_addr, ?err, "Error writing during broadcast");
                }
            }
        });
        debug!(
            except_count = except.len(),
            len = data.len(),
            delivered,
            "Broadcast data"
        );
        delivered
    }
}
