//! Readiness registry.
//!
//! Wraps one mio [`Poll`] instance together with its event buffer and the
//! bookkeeping of which tokens are currently registered. Each reactor owns its
//! own registry, so several independent reactors can live in one process.

use crate::error::Error;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{trace, warn};

/// A readiness notification for one registered token.
///
/// Decoupled from [`mio::event::Event`] so events can be collected out of the
/// poll buffer and dispatched while the registry is mutated.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Event {
    token: Token,
    readable: bool,
    writable: bool,
    read_closed: bool,
    error: bool,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token.0)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("read_closed", &self.read_closed)
            .field("error", &self.error)
            .finish()
    }
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Whether a receive attempt can make progress or observe a close.
    pub fn wants_read(&self) -> bool {
        self.readable || self.read_closed || self.error
    }
}

impl From<&mio::event::Event> for Event {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// Owns the OS readiness-notification context.
///
/// Invariant: a token is present in `interests` iff the matching source is
/// registered with `poll`.
pub struct ReadinessRegistry {
    poll: Poll,
    events: Events,
    interests: HashMap<Token, Interest>,
}

impl fmt::Debug for ReadinessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessRegistry")
            .field("capacity", &self.events.capacity())
            .field("registered", &self.interests.len())
            .finish()
    }
}

impl ReadinessRegistry {
    /// Creates a registry that returns at most `max_events` events per wait.
    pub fn new(max_events: usize) -> Result<Self, Error> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
            interests: HashMap::new(),
        })
    }

    /// Registers `source` under `token`.
    ///
    /// Registering a token that is already present is a programming error.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        if self.interests.contains_key(&token) {
            return Err(Error::InvariantViolation(format!(
                "token {} registered twice",
                token.0
            )));
        }
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|source| Error::Registration {
                token: token.0,
                source,
            })?;
        self.interests.insert(token, interest);
        trace!(token = token.0, ?interest, "Registered");
        Ok(())
    }

    /// Unregisters `source`. Unknown tokens are ignored, so a second
    /// unregister of the same descriptor is harmless.
    pub fn unregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        if !self.interests.contains_key(&token) {
            warn!(token = token.0, "Token not registered when unregistering");
            return Ok(());
        }
        self.poll
            .registry()
            .deregister(source)
            .map_err(|source| Error::Registration {
                token: token.0,
                source,
            })?;
        self.interests.remove(&token);
        trace!(token = token.0, "Unregistered");
        Ok(())
    }

    /// Creates a waker bound to `token`, used to interrupt a blocked
    /// [`wait()`](Self::wait) from another thread.
    ///
    /// The returned `Waker` must outlive every `wait` that should observe it.
    /// Dropping it closes the wake descriptor, while the token stays reserved
    /// here.
    pub fn waker(&mut self, token: Token) -> Result<Waker, Error> {
        if self.interests.contains_key(&token) {
            return Err(Error::InvariantViolation(format!(
                "token {} registered twice",
                token.0
            )));
        }
        let waker = Waker::new(self.poll.registry(), token).map_err(|source| {
            Error::Registration {
                token: token.0,
                source,
            }
        })?;
        self.interests.insert(token, Interest::READABLE);
        Ok(waker)
    }

    /// Blocks until at least one registered descriptor is ready, or until
    /// `timeout` elapses. Returns an empty batch on timeout and on an
    /// interrupted wait.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>, Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                trace!("Wait interrupted");
                return Ok(Vec::new());
            }
            Err(err) => return Err(Error::Wait(err)),
        }
        Ok(self.events.iter().map(Event::from).collect())
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.interests.contains_key(&token)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.interests.get(&token).copied()
    }

    /// Number of registered tokens, including the listener and the waker.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }
}
