//! Configuration management for the tally system
//!
//! Loads backend selection, transport limits and the candidate roster from
//! environment variables with validation.

use crate::types::Roster;
use crate::{Error, Result, config_error};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default connectivity probe timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of optimistic transaction attempts before giving up
const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 25;

/// Default first delay before re-opening a dropped subscription stream
const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;

/// Default location of the per-device local record
const DEFAULT_STATE_PATH: &str = "tally-state.json";

/// Which shared-store backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe the live store, fall back to the in-memory simulation
    Auto,
    /// Live store only; unreachable store is a startup error
    Live,
    /// In-memory simulation only
    Memory,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "live" => Ok(Self::Live),
            "memory" => Ok(Self::Memory),
            other => Err(config_error!("Invalid TALLY_BACKEND {:?}", other)),
        }
    }
}

/// Shared-store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: BackendKind,

    /// Root URL of the realtime database (e.g. `https://example.firebaseio.com`)
    pub database_url: Option<String>,

    /// Optional auth token passed as the `auth` query parameter
    pub auth_token: Option<String>,

    /// Connectivity probe timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Transaction attempts before reporting a conflict as exhausted
    pub max_transaction_retries: u32,

    /// First delay before re-opening a dropped subscription; doubles per failed attempt
    pub reconnect_delay_ms: u64,
}

impl StoreConfig {
    /// Load store configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("TALLY_BACKEND")
            .unwrap_or_else(|_| "auto".to_string())
            .parse()?;

        let database_url = std::env::var("TALLY_DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let auth_token = std::env::var("TALLY_DATABASE_AUTH")
            .ok()
            .filter(|s| !s.is_empty());

        let connect_timeout_ms = std::env::var("TALLY_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_CONNECT_TIMEOUT_MS.to_string())
            .parse()
            .map_err(|_| config_error!("Invalid TALLY_CONNECT_TIMEOUT_MS"))?;

        let max_transaction_retries = std::env::var("TALLY_MAX_TRANSACTION_RETRIES")
            .unwrap_or_else(|_| DEFAULT_MAX_TRANSACTION_RETRIES.to_string())
            .parse()
            .map_err(|_| config_error!("Invalid TALLY_MAX_TRANSACTION_RETRIES"))?;

        let reconnect_delay_ms = std::env::var("TALLY_RECONNECT_DELAY_MS")
            .unwrap_or_else(|_| DEFAULT_RECONNECT_DELAY_MS.to_string())
            .parse()
            .map_err(|_| config_error!("Invalid TALLY_RECONNECT_DELAY_MS"))?;

        let config = Self {
            backend,
            database_url,
            auth_token,
            connect_timeout_ms,
            max_transaction_retries,
            reconnect_delay_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_url: None,
            auth_token: None,
            connect_timeout_ms: 200, // Fail fast in tests
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            reconnect_delay_ms: 20,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Live && self.database_url.is_none() {
            return Err(config_error!(
                "TALLY_DATABASE_URL is required when TALLY_BACKEND=live"
            ));
        }

        if let Some(url) = &self.database_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(config_error!("TALLY_DATABASE_URL must be an http(s) URL"));
            }
        }

        if self.reconnect_delay_ms == 0 {
            return Err(config_error!("TALLY_RECONNECT_DELAY_MS must be at least 1"));
        }

        if self.max_transaction_retries == 0 {
            return Err(config_error!("TALLY_MAX_TRANSACTION_RETRIES must be at least 1"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub roster: Roster,

    /// File holding this device's id and vote record
    pub state_path: PathBuf,
}

impl Config {
    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let store = StoreConfig::from_env()?;

        let logging = LoggingConfig {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
        };

        let roster = match std::env::var("TALLY_ROSTER_PATH") {
            Ok(path) => Roster::from_json_file(path)?,
            Err(_) => Roster::builtin(),
        };

        let state_path = std::env::var("TALLY_STATE_PATH")
            .unwrap_or_else(|_| DEFAULT_STATE_PATH.to_string())
            .into();

        Ok(Self {
            store,
            logging,
            roster,
            state_path,
        })
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        };

        Self {
            store: StoreConfig::for_testing(),
            logging,
            roster: Roster::builtin(),
            state_path: std::env::temp_dir().join(DEFAULT_STATE_PATH),
        }
    }
}
