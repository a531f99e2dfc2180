use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use conductor::config::{Config, DEFAULT_INITIAL_STATE, DEFAULT_QUEUE_CAPACITY, Overrides};
use secrecy::ExposeSecret;

// Tests in this file share the process environment.
static ENV: Mutex<()> = Mutex::new(());

const VARS: [&str; 8] = [
    "CONDUCTOR_NAME",
    "CONDUCTOR_BROKERS",
    "CONDUCTOR_DATA_DIR",
    "CONDUCTOR_QUEUE_CAPACITY",
    "CONDUCTOR_INITIAL_STATE",
    "CONDUCTOR_VISIBILITY_TIMEOUT_SECS",
    "CONDUCTOR_SASL_USERNAME",
    "CONDUCTOR_SASL_PASSWORD",
];

fn clear_env() {
    for var in VARS {
        unsafe { std::env::remove_var(var) };
    }
}

#[test]
fn config_from_env_loads_required_fields() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("CONDUCTOR_NAME", "cluster-a");
        std::env::set_var("CONDUCTOR_BROKERS", "localhost:9092");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.name, "cluster-a");
    assert_eq!(config.brokers, "localhost:9092");
    assert_eq!(config.data_dir, PathBuf::from("./data"));
    assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    assert_eq!(config.initial_state, DEFAULT_INITIAL_STATE);
    assert!(config.visibility_timeout.is_none());
    assert!(config.sasl_password.is_none());
    assert!(!config.log_level.is_empty());
    assert_eq!(config.store_dir(), PathBuf::from("./data/cluster-a"));

    clear_env();
}

#[test]
fn config_from_env_fails_without_required() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe { std::env::set_var("CONDUCTOR_NAME", "cluster-a") };

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("CONDUCTOR_BROKERS"));

    clear_env();
}

#[test]
fn config_parses_optional_fields() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("CONDUCTOR_NAME", "cluster-a");
        std::env::set_var("CONDUCTOR_BROKERS", "b1:9092,b2:9092");
        std::env::set_var("CONDUCTOR_DATA_DIR", "/var/lib/conductor");
        std::env::set_var("CONDUCTOR_QUEUE_CAPACITY", "64");
        std::env::set_var("CONDUCTOR_INITIAL_STATE", "new");
        std::env::set_var("CONDUCTOR_VISIBILITY_TIMEOUT_SECS", "30");
        std::env::set_var("CONDUCTOR_SASL_USERNAME", "svc");
        std::env::set_var("CONDUCTOR_SASL_PASSWORD", "hunter2");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.data_dir, PathBuf::from("/var/lib/conductor"));
    assert_eq!(config.queue_capacity, 64);
    assert_eq!(config.initial_state, "new");
    assert_eq!(config.visibility_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.sasl_username.as_deref(), Some("svc"));
    assert_eq!(
        config.sasl_password.as_ref().map(|p| p.expose_secret()),
        Some("hunter2")
    );
    assert!(!format!("{config:?}").contains("hunter2"));

    clear_env();
}

#[test]
fn config_rejects_malformed_numbers() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("CONDUCTOR_NAME", "cluster-a");
        std::env::set_var("CONDUCTOR_BROKERS", "localhost:9092");
        std::env::set_var("CONDUCTOR_QUEUE_CAPACITY", "lots");
    }

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("CONDUCTOR_QUEUE_CAPACITY"));

    clear_env();
}

#[test]
fn overrides_take_precedence_over_env() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe { std::env::set_var("CONDUCTOR_NAME", "from-env") };

    let config = Config::from_env_with(Overrides {
        name: Some("from-flag".to_string()),
        brokers: Some("flag:9092".to_string()),
        data_dir: Some(PathBuf::from("/tmp/flag")),
    })
    .unwrap();
    assert_eq!(config.name, "from-flag");
    assert_eq!(config.brokers, "flag:9092");
    assert_eq!(config.store_dir(), PathBuf::from("/tmp/flag/from-flag"));

    clear_env();
}

#[test]
fn local_config_needs_no_environment() {
    let config = Config::local("dev", "/tmp/conductor");
    assert_eq!(config.name, "dev");
    assert!(config.brokers.is_empty());
    assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
}
