//! rustmux - a single-threaded TCP connection multiplexer
//!
//! rustmux listens on one address, accepts any number of clients and drives
//! all of their I/O from one thread through a single readiness mechanism
//! (epoll, kqueue or IOCP via mio). Applications plug in a [`Handler`] that is
//! told when clients connect, send bytes, and disconnect, and that can answer
//! through the send and broadcast calls on [`Context`].
//!
//! The core performs no framing: every receive is handed to the handler as is.
//!
//! ```no_run
//! use rustmux::prelude::*;
//!
//! struct Relay;
//!
//! impl Handler for Relay {
//!     fn on_message_received(&mut self, ctx: &mut Context<'_>, id: ConnectionId, data: &[u8]) {
//!         ctx.broadcast_except(id, data);
//!     }
//! }
//!
//! let mut reactor = Reactor::new(ListenerConfig::new("127.0.0.1", 9000), Relay)?;
//! reactor.init()?;
//! reactor.run()?;
//! # Ok::<(), rustmux::Error>(())
//! ```

pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod handler;
pub(crate) mod reactor;
pub(crate) mod registry;
pub(crate) mod socket;

// These are the intended public API
pub use crate::config::{ListenerConfig, DEFAULT_BIND_ADDRESS, DEFAULT_MAX_EVENTS, DEFAULT_MAX_READ_SIZE};
pub use connection::{Connection, ConnectionId, ConnectionTable};
pub use error::Error;
pub use handler::{Context, Handler};
pub use reactor::{Reactor, ReactorState, StopHandle};
pub use registry::{Event, ReadinessRegistry};
pub use socket::{create_listener, resolve_bind_addr, ListeningSocket};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::ListenerConfig;
    pub use crate::connection::ConnectionId;
    pub use crate::error::Error;
    pub use crate::handler::{Context, Handler};
    pub use crate::reactor::{Reactor, ReactorState, StopHandle};
}
