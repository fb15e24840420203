//! Configuration for the time-series store and the core identity API.
//!
//! Loaded from a TOML file, then overridden by environment variables (a `.env`
//! file is honoured). Example:
//!
//! ```toml
//! [influx2]
//! url = "http://localhost:8086"
//! org = "cotons"
//! token = "..."
//! bucket = "cotons_vet"
//!
//! [core-api]
//! url = "https://core.example.com"
//! client_id = "..."
//! client_secret = "..."
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ReconcileError;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "data_counter.toml";

pub const DEFAULT_BUCKET: &str = "cotons_vet";

/// Bound on every external call (store query, token issue, device lookup).
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub influx2: InfluxConfig,
    #[serde(default, rename = "core-api")]
    pub core_api: CoreApiConfig,
}

/// InfluxDB v2 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            org: String::new(),
            token: String::new(),
            bucket: default_bucket(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Core API (device -> device user lookup) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreApiConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CoreApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ReconcileError> {
        toml::from_str(content).map_err(|e| ReconcileError::Config(format!("invalid TOML: {}", e)))
    }

    /// Read `path` if it exists, then apply environment overrides.
    ///
    /// A missing file is not an error: everything can come from the
    /// environment. An explicitly requested file that is missing is.
    pub fn load(path: Option<&Path>) -> Result<Self, ReconcileError> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&content)?
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    let content = std::fs::read_to_string(default_path).map_err(|e| {
                        ReconcileError::Config(format!("cannot read {}: {}", DEFAULT_CONFIG_PATH, e))
                    })?;
                    Self::from_toml_str(&content)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override file values with non-empty variables returned by `lookup`.
    ///
    /// A timeout that is not a whole number of seconds is a config error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ReconcileError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("INFLUXDB_V2_URL") {
            self.influx2.url = v;
        }
        if let Some(v) = get("INFLUXDB_V2_ORG") {
            self.influx2.org = v;
        }
        if let Some(v) = get("INFLUXDB_V2_TOKEN") {
            self.influx2.token = v;
        }
        if let Some(v) = get("INFLUXDB_V2_BUCKET") {
            self.influx2.bucket = v;
        }
        if let Some(v) = get("INFLUXDB_V2_TIMEOUT") {
            self.influx2.timeout_secs = parse_secs("INFLUXDB_V2_TIMEOUT", &v)?;
        }
        if let Some(v) = get("CORE_API_URL") {
            self.core_api.url = v;
        }
        if let Some(v) = get("CORE_API_CLIENT_ID") {
            self.core_api.client_id = v;
        }
        if let Some(v) = get("CORE_API_CLIENT_SECRET") {
            self.core_api.client_secret = v;
        }
        if let Some(v) = get("CORE_API_TIMEOUT") {
            self.core_api.timeout_secs = parse_secs("CORE_API_TIMEOUT", &v)?;
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, ReconcileError> {
    value.trim().parse().map_err(|e| {
        ReconcileError::Config(format!("{}: invalid seconds '{}': {}", key, value, e))
    })
}

impl InfluxConfig {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        require("influx2.url", &self.url)?;
        require("influx2.org", &self.org)?;
        require("influx2.token", &self.token)?;
        require("influx2.bucket", &self.bucket)?;
        Ok(())
    }
}

impl CoreApiConfig {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        require("core-api.url", &self.url)?;
        require("core-api.client_id", &self.client_id)?;
        require("core-api.client_secret", &self.client_secret)?;
        Ok(())
    }
}

fn require(name: &str, value: &str) -> Result<(), ReconcileError> {
    if value.trim().is_empty() {
        return Err(ReconcileError::Config(format!("{} is not set", name)));
    }
    Ok(())
}
