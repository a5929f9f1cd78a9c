use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::OperatingWindow;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid operating window {open}:00-{close}:00 (need open < close <= 24)")]
    InvalidWindow { open: u32, close: u32 },
}

/// Server settings, read from `ROOMCAL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends since the last compaction before the log is rewritten.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub window: OperatingWindow,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roomcal".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            window: OperatingWindow::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Values that fail to parse keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let open = parse_or(&lookup, "ROOMCAL_OPEN_HOUR", defaults.window.open_hour);
        let close = parse_or(&lookup, "ROOMCAL_CLOSE_HOUR", defaults.window.close_hour);
        let window = OperatingWindow::new(open, close)
            .ok_or(ConfigError::InvalidWindow { open, close })?;

        Ok(Self {
            port: parse_or(&lookup, "ROOMCAL_PORT", defaults.port),
            bind: lookup("ROOMCAL_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ROOMCAL_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("ROOMCAL_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "ROOMCAL_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "ROOMCAL_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: parse_opt(&lookup, "ROOMCAL_METRICS_PORT"),
            window,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomcal.wal")
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse_opt(lookup, key).unwrap_or(default)
}

/// `None` when unset or unparsable; the latter is logged.
fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}
