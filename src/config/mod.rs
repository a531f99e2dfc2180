//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Log credentials are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrets::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_INITIAL_STATE: &str = "pending";

#[derive(Debug)]
pub struct Config {
    /// Cluster name: log topic, consumer group and store sub-directory.
    pub name: String,
    /// Comma-separated log broker list.
    pub brokers: String,
    /// Root directory; the store lives in `<data_dir>/<name>/`.
    pub data_dir: PathBuf,
    /// Delivery buffer size of every queue.
    pub queue_capacity: usize,
    /// State used for replayed jobs that carry none.
    pub initial_state: String,
    /// Requeue checked-out jobs after this long. `None` disables it.
    pub visibility_timeout: Option<Duration>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(Overrides::default())
    }

    /// Like [`from_env`](Self::from_env), with explicit values (e.g. CLI
    /// flags) taking precedence over the environment.
    pub fn from_env_with(overrides: Overrides) -> Result<Self> {
        Ok(Self {
            name: overrides
                .name
                .map_or_else(|| required_var("CONDUCTOR_NAME"), Ok)?,
            brokers: overrides
                .brokers
                .map_or_else(|| required_var("CONDUCTOR_BROKERS"), Ok)?,
            data_dir: overrides.data_dir.unwrap_or_else(data_dir_from_env),
            queue_capacity: parsed_var("CONDUCTOR_QUEUE_CAPACITY")?
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            initial_state: std::env::var("CONDUCTOR_INITIAL_STATE")
                .unwrap_or_else(|_| DEFAULT_INITIAL_STATE.to_string()),
            visibility_timeout: parsed_var::<u64>("CONDUCTOR_VISIBILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            sasl_username: std::env::var("CONDUCTOR_SASL_USERNAME").ok(),
            sasl_password: std::env::var("CONDUCTOR_SASL_PASSWORD")
                .ok()
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Configuration for a local, log-less setup rooted at `data_dir`.
    pub fn local(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            brokers: String::new(),
            data_dir: data_dir.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_state: DEFAULT_INITIAL_STATE.to_string(),
            visibility_timeout: None,
            sasl_username: None,
            sasl_password: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }

    /// Directory holding this cluster's store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }
}

/// Values that replace their environment counterparts.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub brokers: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// `CONDUCTOR_DATA_DIR`, or `./data`.
pub fn data_dir_from_env() -> PathBuf {
    std::env::var("CONDUCTOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
