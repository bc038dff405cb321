//! Listener configuration.
//!
//! A [`ListenerConfig`] can be built directly in code or read from a
//! [`config::Config`] with namespaced keys, so several reactors in one process
//! can share a configuration file.

use crate::error::Error;
use ::config::{Config, ConfigError};
use std::time::Duration;

/// Default number of readiness events fetched per wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;
/// Default size of the per-read receive buffer.
pub const DEFAULT_MAX_READ_SIZE: usize = 4096;
/// Default bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Immutable configuration of one listening reactor.
///
/// # Configuration Keys
///
/// | Key | Type | Default |
/// |---|---|---|
/// | `bind_address` | string | `127.0.0.1` |
/// | `bind_port` | integer, 0-65535 | `0` (OS-assigned) |
/// | `max_events` | positive integer | `64` |
/// | `max_read_size` | positive integer | `4096` |
/// | `no_delay` | bool | `true` |
/// | `poll_timeout_ms` | integer | unset (wait indefinitely) |
///
/// # Example
///
/// ```toml
/// # Global default
/// bind_address = "0.0.0.0"
///
/// # Specific to the "chat" instance
/// [chat]
/// bind_port = 9000
/// max_events = 256
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    bind_address: String,
    bind_port: u16,
    max_events: usize,
    max_read_size: usize,
    no_delay: bool,
    poll_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Creates a configuration for `address:port` with default limits.
    pub fn new(bind_address: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            bind_port,
            max_events: DEFAULT_MAX_EVENTS,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            no_delay: true,
            poll_timeout: None,
        }
    }

    /// Reads the configuration from un-namespaced keys.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the configuration with namespacing.
    ///
    /// Lookup order for every key:
    /// 1. `{name}.{key}` (e.g. `chat.bind_port`)
    /// 2. `{key}` (e.g. `bind_port`)
    /// 3. Built-in default
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let bind_address = optional(get_namespaced_string(config, name, "bind_address"))?
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let bind_port = optional(get_namespaced_usize(config, name, "bind_port"))?.unwrap_or(0);
        let bind_port = u16::try_from(bind_port)
            .map_err(|_| Error::InvalidConfig(format!("bind_port {bind_port} out of range")))?;

        let mut listener_config = Self::new(bind_address, bind_port);
        if let Some(max_events) = optional(get_namespaced_usize(config, name, "max_events"))? {
            listener_config.max_events = max_events;
        }
        if let Some(max_read_size) = optional(get_namespaced_usize(config, name, "max_read_size"))? {
            listener_config.max_read_size = max_read_size;
        }
        if let Some(no_delay) = optional(get_namespaced_bool(config, name, "no_delay"))? {
            listener_config.no_delay = no_delay;
        }
        if let Some(ms) = optional(get_namespaced_u64(config, name, "poll_timeout_ms"))? {
            listener_config.poll_timeout = Some(Duration::from_millis(ms));
        }

        listener_config.validate()?;
        Ok(listener_config)
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_max_read_size(mut self, max_read_size: usize) -> Self {
        self.max_read_size = max_read_size;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Bounds every readiness wait. `None` blocks until an event or a stop
    /// request arrives.
    pub fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Checks the numeric limits. Called by the reactor before it allocates
    /// anything.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_events == 0 {
            return Err(Error::InvalidConfig("max_events must be positive".into()));
        }
        if self.max_read_size == 0 {
            return Err(Error::InvalidConfig("max_read_size must be positive".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDRESS, 0)
    }
}

// ============================================================================
// Namespaced Lookup Helpers
// ============================================================================

// Missing keys fall back to defaults; malformed values are reported.
fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        match getter(config, &format!("{name}.{key}")) {
            Err(ConfigError::NotFound(_)) => getter(config, key),
            other => other,
        }
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}
