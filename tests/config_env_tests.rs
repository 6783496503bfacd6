//! Environment-driven configuration
//!
//! These tests mutate process environment variables and run serially.

mod common;

use std::env;
use std::path::PathBuf;

use common::serial;
use tensorforge::logging::{LogFormat, LogLevel, LoggingConfig};
use tensorforge::memory::AllocatorKind;
use tensorforge::{ForgeError, RuntimeConfig};

const RUNTIME_VARS: [&str; 5] = [
    "TFORGE_DEVICES",
    "TFORGE_ARENA_FRACTION",
    "TFORGE_ALLOCATOR",
    "TFORGE_KERNEL_CACHE_DIR",
    "TFORGE_PREWARM",
];

fn clear_runtime_vars() {
    for var in RUNTIME_VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_runtime_vars();
    let config = RuntimeConfig::from_env().unwrap();
    assert_eq!(config, RuntimeConfig::default());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_runtime_vars();
    env::set_var("TFORGE_DEVICES", "0, 2,3");
    env::set_var("TFORGE_ARENA_FRACTION", "0.75");
    env::set_var("TFORGE_ALLOCATOR", "direct");
    env::set_var("TFORGE_KERNEL_CACHE_DIR", "/var/cache/tensorforge");
    env::set_var("TFORGE_PREWARM", "true");

    let config = RuntimeConfig::from_env().unwrap();
    clear_runtime_vars();

    assert_eq!(config.devices, vec![0, 2, 3]);
    assert_eq!(config.arena_fraction, 0.75);
    assert_eq!(config.allocator, AllocatorKind::Direct);
    assert_eq!(
        config.kernel_cache_dir,
        Some(PathBuf::from("/var/cache/tensorforge"))
    );
    assert!(config.prewarm);
}

#[test]
#[serial]
fn test_from_env_prewarm_off_values() {
    clear_runtime_vars();
    for value in ["0", "false", "FALSE"] {
        env::set_var("TFORGE_PREWARM", value);
        assert!(!RuntimeConfig::from_env().unwrap().prewarm, "{}", value);
    }
    env::set_var("TFORGE_KERNEL_CACHE_DIR", "");
    assert!(RuntimeConfig::from_env().unwrap().kernel_cache_dir.is_none());
    clear_runtime_vars();
}

#[test]
#[serial]
fn test_from_env_rejects_bad_values() {
    let cases = [
        ("TFORGE_DEVICES", "0,gpu1"),
        ("TFORGE_DEVICES", "1,1"),
        ("TFORGE_DEVICES", ""),
        ("TFORGE_ARENA_FRACTION", "most"),
        ("TFORGE_ARENA_FRACTION", "1.5"),
        ("TFORGE_ALLOCATOR", "slab"),
    ];
    for (var, value) in cases {
        clear_runtime_vars();
        env::set_var(var, value);
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(
            matches!(err, ForgeError::InvalidConfiguration(_)),
            "{}={} gave {:?}",
            var,
            value,
            err
        );
    }
    clear_runtime_vars();
}

#[test]
#[serial]
fn test_logging_config_from_env() {
    env::set_var("TFORGE_LOG_LEVEL", "debug");
    env::set_var("TFORGE_LOG_FORMAT", "json");
    let config = LoggingConfig::from_env().unwrap();
    env::remove_var("TFORGE_LOG_LEVEL");
    env::remove_var("TFORGE_LOG_FORMAT");

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);

    env::set_var("TFORGE_LOG_LEVEL", "chatty");
    assert!(LoggingConfig::from_env().is_err());
    env::remove_var("TFORGE_LOG_LEVEL");
}
