use crate::reactor::ReactorState;
use std::net::SocketAddr;
use thiserror::Error;

/// The error type for rustmux operations.
///
/// Errors raised while the reactor is starting up (socket creation, bind,
/// listen, registering the listener) are returned from
/// [`Reactor::init()`](crate::Reactor::init) and abort startup. Once the
/// reactor is running, per-connection failures are contained: they are logged
/// and the affected connection is dropped, while every other connection keeps
/// being served.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Socket Setup Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bind address could not be parsed or resolved.
    #[error("Invalid bind address '{address}': {source}")]
    InvalidAddress {
        /// The address as it was configured.
        address: String,
        source: std::io::Error,
    },

    /// The operating system could not allocate a stream socket.
    #[error("Failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    /// The address/port is unavailable (in use, not local, or privileged).
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The bound socket could not be switched to listening mode.
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: std::io::Error,
    },

    // ============================================================================
    // Readiness Registry Errors
    // ============================================================================

    /// Registering or unregistering a descriptor with the readiness registry
    /// failed at the OS level.
    #[error("Failed to update registration for token {token}: {source}")]
    Registration {
        token: usize,
        source: std::io::Error,
    },

    /// Waiting for readiness events failed.
    ///
    /// The reactor treats this as transient: it is logged and the loop
    /// continues with the next iteration.
    #[error("Readiness wait failed: {0}")]
    Wait(#[source] std::io::Error),

    // ============================================================================
    // Connection Errors
    // ============================================================================

    /// Attempted to operate on a connection ID that doesn't exist.
    #[error("Connection {id} not found")]
    ConnectionNotFound {
        /// The connection ID that was not found.
        id: usize,
    },

    /// The socket accepted fewer bytes than requested without blocking
    /// further. The remainder was not sent and is not retried.
    #[error("Short write on connection {id}: {written} of {len} bytes sent")]
    ShortWrite {
        id: usize,
        written: usize,
        len: usize,
    },

    /// Internal bookkeeping was asked to do something that can only happen
    /// through a programming error, such as adding the same connection twice.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The reactor is not in a state that allows the requested operation.
    #[error("Operation not allowed while reactor is {state:?}")]
    InvalidState { state: ReactorState },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is out of its accepted range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
