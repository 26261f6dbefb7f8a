//! Transport configuration loading.
//!
//! [`TransportConfig`] carries the buffer sizes, water marks and server
//! settings shared by every socket, transport and stream created from it.
//! Values come from the built-in defaults, optionally a JSON file named by
//! `UDSIO_CONFIG`, then `UDSIO_*` environment overrides.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_FILE_ENV, DEFAULT_ACCEPT_RETRY_DELAY, DEFAULT_BACKLOG, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_READ_LIMIT, DEFAULT_WRITE_HIGH_WATER, DEFAULT_WRITE_LOW_WATER,
};
use crate::error::{Result, TransportError};

/// Settings for servers, transports and streams.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Listen backlog for servers.
    pub backlog: u32,
    /// Stream reader limit in bytes.
    pub read_limit: usize,
    /// Maximum bytes requested from the OS per `recv`.
    pub read_chunk_size: usize,
    /// Write buffer size that pauses the producer.
    pub write_high_water: usize,
    /// Write buffer size at which `drain()` returns.
    pub write_low_water: usize,
    /// Milliseconds to wait before retrying a failed `accept`.
    pub accept_retry_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            read_limit: DEFAULT_READ_LIMIT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            write_high_water: DEFAULT_WRITE_HIGH_WATER,
            write_low_water: DEFAULT_WRITE_LOW_WATER,
            accept_retry_delay_ms: DEFAULT_ACCEPT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl TransportConfig {
    /// Loads configuration from `UDSIO_CONFIG` (if set), then applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| TransportError::at_path(e, path))?;
        Self::from_json(&content)
    }

    /// Parses a JSON configuration document. Missing keys keep their defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| TransportError::InvalidConfig(format!("malformed JSON: {e}")))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(backlog) = env_parse::<u32>("UDSIO_BACKLOG") {
            self.backlog = backlog;
        }
        if let Some(limit) = env_parse::<usize>("UDSIO_READ_LIMIT") {
            self.read_limit = limit;
        }
        if let Some(chunk) = env_parse::<usize>("UDSIO_READ_CHUNK_SIZE") {
            self.read_chunk_size = chunk;
        }
        if let Some(high) = env_parse::<usize>("UDSIO_WRITE_HIGH_WATER") {
            self.write_high_water = high;
        }
        if let Some(low) = env_parse::<usize>("UDSIO_WRITE_LOW_WATER") {
            self.write_low_water = low;
        }
        if let Some(delay) = env_parse::<u64>("UDSIO_ACCEPT_RETRY_DELAY_MS") {
            self.accept_retry_delay_ms = delay;
        }
    }

    /// Checks that the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.backlog == 0 {
            return Err(TransportError::InvalidConfig("backlog must be positive".into()));
        }
        if self.read_limit == 0 {
            return Err(TransportError::InvalidConfig("read_limit must be positive".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(TransportError::InvalidConfig(
                "read_chunk_size must be positive".into(),
            ));
        }
        check_water_marks(self.write_high_water, self.write_low_water)
    }

    /// Accept retry delay as a [`Duration`].
    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    /// Returns a copy with different write water marks.
    ///
    /// `low` defaults to a quarter of `high`.
    pub fn with_write_limits(mut self, high: usize, low: Option<usize>) -> Result<Self> {
        let low = low.unwrap_or(high / 4);
        check_water_marks(high, low)?;
        self.write_high_water = high;
        self.write_low_water = low;
        Ok(self)
    }
}

/// Shared rule for transport and config water marks.
pub(crate) fn check_water_marks(high: usize, low: usize) -> Result<()> {
    if high < low {
        return Err(TransportError::InvalidConfig(format!(
            "write high-water mark ({high}) must be >= low-water mark ({low})"
        )));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring unparsable {key}={raw}");
            None
        }
    }
}
