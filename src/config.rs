//! # Engine Configuration
//!
//! Settings are grouped by the component that reads them and loaded from a
//! TOML file. Every field has a default, so an empty file (or
//! [`EngineConfig::default`]) is a valid configuration.
//!
//! ```toml
//! [database]
//! path = "/var/lib/dyntable/tables.db"
//!
//! [rows]
//! default_per_page = 25
//!
//! [geocoder]
//! endpoint = "https://maps.example.com/geocode/json"
//! timeout_ms = 3000
//! ```
//!
//! A few settings can be overridden from the environment, which wins over the
//! file:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `DYNTABLE_DATABASE_PATH` | `database.path` |
//! | `DYNTABLE_GEOCODER_ENDPOINT` | `geocoder.endpoint` |
//! | `DYNTABLE_GEOCODER_API_KEY` | `geocoder.api_key` |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseSettings,
    pub rows: RowSettings,
    pub import: ImportSettings,
    pub geocoder: GeocoderSettings,
}

/// Where the catalog and every backing table live.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RowSettings {
    /// Page size used when a listing doesn't ask for one.
    pub default_per_page: u32,
}

impl Default for RowSettings {
    fn default() -> Self {
        Self {
            default_per_page: default_per_page(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    /// How many leading rows the type guesser looks at.
    pub sample_rows: usize,
    /// Timeout for downloading a URL import, in milliseconds.
    pub fetch_timeout_ms: u64,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            sample_rows: default_sample_rows(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl ImportSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Geocoding service settings.
///
/// Without an `endpoint` the engine runs with a geocoder that never resolves
/// anything, and address roles produce null points.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocoderSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Attempts per address, first one included.
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    pub backoff_ms: u64,
    /// Entries kept in the address cache. Zero disables caching.
    pub cache_capacity: usize,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: default_geocoder_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl GeocoderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_per_page() -> u32 {
    10
}

fn default_sample_rows() -> usize {
    1000
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_geocoder_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_cache_capacity() -> usize {
    1024
}

impl EngineConfig {
    /// Loads configuration from a TOML file, applies environment overrides,
    /// and validates the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from TOML text. No environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    /// Applies `DYNTABLE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        use std::env;

        if let Ok(path) = env::var("DYNTABLE_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Ok(endpoint) = env::var("DYNTABLE_GEOCODER_ENDPOINT") {
            self.geocoder.endpoint = Some(endpoint);
        }
        if let Ok(key) = env::var("DYNTABLE_GEOCODER_API_KEY") {
            self.geocoder.api_key = Some(key);
        }
    }

    /// Rejects settings the engine can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.rows.default_per_page == 0 {
            return Err(Error::Config("rows.default_per_page must be at least 1".into()));
        }
        if self.import.sample_rows == 0 {
            return Err(Error::Config("import.sample_rows must be at least 1".into()));
        }
        if self.geocoder.max_attempts == 0 {
            return Err(Error::Config("geocoder.max_attempts must be at least 1".into()));
        }
        if let Some(endpoint) = &self.geocoder.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "geocoder.endpoint must be an http(s) URL, got '{endpoint}'"
                )));
            }
        }
        Ok(())
    }
}
