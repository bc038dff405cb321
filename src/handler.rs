//! Lifecycle callbacks and the context they run in.

use crate::connection::{ConnectionId, ConnectionTable};
use crate::error::Error;

use std::net::SocketAddr;
use tracing::debug;

/// Application hooks invoked by the [`Reactor`](crate::Reactor).
///
/// Every method defaults to a no-op. Callbacks run synchronously on the
/// reactor thread, so a slow callback stalls every connection.
///
/// # Example
///
/// ```no_run
/// use rustmux::{ConnectionId, Context, Handler};
///
/// struct Chat;
///
/// impl Handler for Chat {
///     fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
///         ctx.broadcast_except(id, data);
///     }
/// }
/// ```
pub trait Handler {
    /// A client was accepted and registered.
    fn on_client_connected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        let _ = (ctx, id);
    }

    /// A client is about to be removed. Its metadata is still available
    /// through `ctx`, but it no longer receives broadcasts.
    fn on_client_disconnected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        let _ = (ctx, id);
    }

    /// Bytes arrived from a client. `data` holds exactly what one receive
    /// returned and may be any fragment of the peer's stream.
    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        let _ = (ctx, id, data);
    }
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn on_client_connected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        (**self).on_client_connected(ctx, id)
    }

    fn on_client_disconnected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        (**self).on_client_disconnected(ctx, id)
    }

    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        (**self).on_message_received(ctx, id, data)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn on_client_connected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        (**self).on_client_connected(ctx, id)
    }

    fn on_client_disconnected(&mut self, ctx: &mut Context<'_>, id: ConnectionId) {
        (**self).on_client_disconnected(ctx, id)
    }

    fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
        (**self).on_message_received(ctx, id, data)
    }
}

/// Access to the outbound send API from inside a callback.
///
/// Only reachable while a callback runs, which keeps every socket on the
/// reactor thread.
pub struct Context<'a> {
    connections: &'a mut ConnectionTable,
    pending_closes: &'a mut Vec<ConnectionId>,
    local_addr: SocketAddr,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        connections: &'a mut ConnectionTable,
        pending_closes: &'a mut Vec<ConnectionId>,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            connections,
            pending_closes,
            local_addr,
        }
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    /// Sends `data` to one client. See [`ConnectionTable::send_to`].
    pub fn send_to(&mut self, id: ConnectionId, data: &[u8]) -> Result<usize, Error> {
        self.connections.send_to(id, data)
    }

    /// Sends `data` to every connected client except `sender`. Returns the
    /// number of clients that received the full payload.
    pub fn broadcast_except(&mut self, sender: ConnectionId, data: &[u8]) -> usize {
        self.connections.broadcast_except(sender, data)
    }

    /// Sends `data` to every connected client except those in `except`.
    pub fn broadcast_except_many(&mut self, except: &[ConnectionId], data: &[u8]) -> usize {
        self.connections.broadcast_except_many(except, data)
    }

    /// Sends `data` to every connected client.
    pub fn broadcast(&mut self, data: &[u8]) -> usize {
        self.connections.broadcast(data)
    }

    // ============================================================================
    // Connection Management
    // ============================================================================

    /// Requests that the server close a connection.
    ///
    /// The close happens once the current callback returns and goes through
    /// the normal teardown, so `on_client_disconnected` fires for it exactly
    /// once. Unknown ids are ignored.
    pub fn disconnect(&mut self, id: ConnectionId) {
        debug!(%id, "Disconnect requested");
        if !self.pending_closes.contains(&id) {
            self.pending_closes.push(id);
        }
    }

    /// Whether `id` is connected and not being torn down.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|connection| !connection.is_closing())
    }

    /// Ids of all connected clients, in accept order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .ids()
            .into_iter()
            .filter(|&id| self.is_connected(id))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connection_ids().len()
    }

    /// Peer address of a client. Still available inside
    /// `on_client_disconnected`.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id).map(|connection| connection.peer_addr())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
