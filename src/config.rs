//! Configuration loading from environment variables.

use std::path::PathBuf;

const WAL_FILE: &str = "printbay.wal";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// Prometheus exporter port; no exporter when unset.
    pub metrics_port: Option<u16>,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Active-reservation limit used until an administrator persists one.
    pub default_max_active: u32,
}

impl Config {
    /// Load configuration from environment variables. All optional:
    /// - `PRINTBAY_DATA_DIR` (default: ./data)
    /// - `PRINTBAY_METRICS_PORT` (default: disabled)
    /// - `PRINTBAY_COMPACT_THRESHOLD` (default: 1000)
    /// - `PRINTBAY_DEFAULT_MAX_ACTIVE` (default: 2)
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("PRINTBAY_DATA_DIR").unwrap_or_else(|_| "./data".into());

        let metrics_port = match std::env::var("PRINTBAY_METRICS_PORT") {
            Ok(s) => Some(s.parse::<u16>().map_err(|_| {
                ConfigError::Invalid("PRINTBAY_METRICS_PORT", "must be a valid port number")
            })?),
            Err(_) => None,
        };

        let compact_threshold: u64 = std::env::var("PRINTBAY_COMPACT_THRESHOLD")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("PRINTBAY_COMPACT_THRESHOLD", "must be a non-negative integer")
            })?;

        let default_max_active: u32 = std::env::var("PRINTBAY_DEFAULT_MAX_ACTIVE")
            .unwrap_or_else(|_| "2".into())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "PRINTBAY_DEFAULT_MAX_ACTIVE",
                "must be a positive integer",
            ))?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            metrics_port,
            compact_threshold,
            default_max_active,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
