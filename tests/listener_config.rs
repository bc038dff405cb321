//! ListenerConfig construction and namespaced loading.

use config::Config;
use rustmux::{Error, ListenerConfig, DEFAULT_BIND_ADDRESS, DEFAULT_MAX_EVENTS, DEFAULT_MAX_READ_SIZE};
use std::time::Duration;

#[test]
fn test_defaults() {
    let config = ListenerConfig::new("0.0.0.0", 9000);
    assert_eq!(config.bind_address(), "0.0.0.0");
    assert_eq!(config.bind_port(), 9000);
    assert_eq!(config.max_events(), DEFAULT_MAX_EVENTS);
    assert_eq!(config.max_read_size(), DEFAULT_MAX_READ_SIZE);
    assert!(config.no_delay());
    assert_eq!(config.poll_timeout(), None);
    assert!(config.validate().is_ok());

    let config = ListenerConfig::default();
    assert_eq!(config.bind_address(), DEFAULT_BIND_ADDRESS);
    assert_eq!(config.bind_port(), 0);
}

#[test]
fn test_builder_setters() {
    let config = ListenerConfig::new("127.0.0.1", 0)
        .with_max_events(8)
        .with_max_read_size(512)
        .with_no_delay(false)
        .with_poll_timeout(Some(Duration::from_millis(250)));
    assert_eq!(config.max_events(), 8);
    assert_eq!(config.max_read_size(), 512);
    assert!(!config.no_delay());
    assert_eq!(config.poll_timeout(), Some(Duration::from_millis(250)));
}

#[test]
fn test_validate_rejects_zero_limits() {
    let config = ListenerConfig::new("127.0.0.1", 0).with_max_events(0);
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

    let config = ListenerConfig::new("127.0.0.1", 0).with_max_read_size(0);
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = Config::builder().build().expect("Failed to build config");
    let listener_config = ListenerConfig::from_config(&config).expect("Failed to load");
    assert_eq!(listener_config, ListenerConfig::default());
}

#[test]
fn test_from_config() {
    let config = Config::builder()
        .set_default("bind_address", "0.0.0.0")
        .and_then(|b| b.set_default("bind_port", 9000_i64))
        .and_then(|b| b.set_default("max_events", 16_i64))
        .and_then(|b| b.set_default("max_read_size", 1024_i64))
        .and_then(|b| b.set_default("no_delay", false))
        .and_then(|b| b.set_default("poll_timeout_ms", 100_i64))
        .and_then(|b| b.build())
        .expect("Failed to build config");

    let listener_config = ListenerConfig::from_config(&config).expect("Failed to load");
    assert_eq!(listener_config.bind_address(), "0.0.0.0");
    assert_eq!(listener_config.bind_port(), 9000);
    assert_eq!(listener_config.max_events(), 16);
    assert_eq!(listener_config.max_read_size(), 1024);
    assert!(!listener_config.no_delay());
    assert_eq!(listener_config.poll_timeout(), Some(Duration::from_millis(100)));
}

#[test]
fn test_namespaced_keys_override_global_keys() {
    let config = Config::builder()
        .set_default("bind_address", "0.0.0.0")
        .and_then(|b| b.set_default("bind_port", 9000_i64))
        .and_then(|b| b.set_default("max_events", 16_i64))
        .and_then(|b| b.set_default("chat.bind_port", 9100_i64))
        .and_then(|b| b.set_default("chat.max_events", 256_i64))
        .and_then(|b| b.build())
        .expect("Failed to build config");

    let chat = ListenerConfig::from_config_named(&config, "chat").expect("Failed to load");
    assert_eq!(chat.bind_port(), 9100);
    assert_eq!(chat.max_events(), 256);
    // Falls back to the global key
    assert_eq!(chat.bind_address(), "0.0.0.0");
    // Falls back to the built-in default
    assert_eq!(chat.max_read_size(), DEFAULT_MAX_READ_SIZE);

    let other = ListenerConfig::from_config_named(&config, "other").expect("Failed to load");
    assert_eq!(other.bind_port(), 9000);
    assert_eq!(other.max_events(), 16);
}

#[test]
fn test_port_out_of_range() {
    let config = Config::builder()
        .set_default("bind_port", 70000_i64)
        .and_then(|b| b.build())
        .expect("Failed to build config");
    assert!(matches!(
        ListenerConfig::from_config(&config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_zero_max_events_in_config() {
    let config = Config::builder()
        .set_default("max_events", 0_i64)
        .and_then(|b| b.build())
        .expect("Failed to build config");
    assert!(matches!(
        ListenerConfig::from_config(&config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_malformed_value_is_reported() {
    let config = Config::builder()
        .set_default("max_events", "many")
        .and_then(|b| b.build())
        .expect("Failed to build config");
    assert!(matches!(
        ListenerConfig::from_config(&config),
        Err(Error::Config(_))
    ));
}
