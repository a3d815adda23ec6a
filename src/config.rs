use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::model::Ms;

/// Runtime settings, read from `COURTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub lock_ttl: Duration,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    /// Prometheus exporter port; unset disables it.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            lock_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
            request_timeout: Duration::from_millis(2000),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("COURTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            lock_ttl: parsed(&lookup, "COURTBOOK_LOCK_TTL_SECS")
                .filter(|&s: &u64| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            sweep_interval: parsed(&lookup, "COURTBOOK_SWEEP_INTERVAL_SECS")
                .filter(|&s: &u64| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            request_timeout: parsed(&lookup, "COURTBOOK_REQUEST_TIMEOUT_MS")
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            compact_threshold: parsed(&lookup, "COURTBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "COURTBOOK_METRICS_PORT"),
        }
    }

    pub fn lock_ttl_ms(&self) -> Ms {
        self.lock_ttl.as_millis() as Ms
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtbook.wal")
    }
}
