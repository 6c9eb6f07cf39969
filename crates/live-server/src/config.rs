//! Configuration for the live engine and its TCP server.
//!
//! Every field has a default. Override them either through a TOML file
//! (`EngineConfig::from_file`) or environment variables
//! (`EngineConfig::from_env`):
//!
//! - `LIVE_BIND_ADDR`             (default: "0.0.0.0")
//! - `LIVE_PORT`                  (default: "9000")
//! - `LIVE_MAX_CONNECTIONS`       (default: "1024")
//! - `LIVE_OUTBOUND_CAPACITY`     (default: "16")
//! - `LIVE_SEND_BUDGET_MS`        (default: "5000")
//! - `LIVE_WRITE_TIMEOUT_MS`      (default: "5000")
//! - `LIVE_MAX_MESSAGE_SIZE`      (default: "32768")
//! - `LIVE_BROADCAST_INTERVAL_MS` (default: "100")
//! - `LIVE_BROADCAST_BURST`       (default: "8")
//! - `LIVE_STATE_TTL_SECS`        (default: "120")
//! - `LIVE_JANITOR_INTERVAL_MS`   (default: "5000")
//! - `LIVE_MAX_UPLOAD_SIZE`       (default: "104857600")
//! - `LIVE_UPLOAD_STAGING_DIR`    (default: the OS temp dir)

use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Engine and server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,

    /// Per-connection outbound queue length.
    pub outbound_capacity: usize,

    /// How long a producer may wait on a full outbound queue before the
    /// client is declared too slow and disconnected.
    pub send_budget_ms: u64,

    /// Upper bound for writing one frame to the transport.
    pub write_timeout_ms: u64,

    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,

    /// Broadcast rate limit: one token per interval...
    pub broadcast_interval_ms: u64,

    /// ...with this many tokens of burst.
    pub broadcast_burst: u32,

    /// Lifetime of parked socket state.
    pub state_ttl_secs: u64,

    /// Sweep period of the state store.
    pub janitor_interval_ms: u64,

    /// Engine-wide ceiling applied to every upload field's `max_size`.
    pub max_upload_size: u64,

    /// Root under which each session gets an upload staging directory.
    pub upload_staging_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            max_connections: 1024,
            outbound_capacity: 16,
            send_budget_ms: 5000,
            write_timeout_ms: 5000,
            max_message_size: 32 * 1024,
            broadcast_interval_ms: 100,
            broadcast_burst: 8,
            state_ttl_secs: 120,
            janitor_interval_ms: 5000,
            max_upload_size: 100 * 1024 * 1024,
            upload_staging_dir: env::temp_dir(),
        }
    }
}

impl EngineConfig {
    /// Construct a config from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            bind_addr: env::var("LIVE_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: read_env_or_default("LIVE_PORT", defaults.port)?,
            max_connections: read_env_or_default("LIVE_MAX_CONNECTIONS", defaults.max_connections)?,
            outbound_capacity: read_env_or_default(
                "LIVE_OUTBOUND_CAPACITY",
                defaults.outbound_capacity,
            )?,
            send_budget_ms: read_env_or_default("LIVE_SEND_BUDGET_MS", defaults.send_budget_ms)?,
            write_timeout_ms: read_env_or_default("LIVE_WRITE_TIMEOUT_MS", defaults.write_timeout_ms)?,
            max_message_size: read_env_or_default("LIVE_MAX_MESSAGE_SIZE", defaults.max_message_size)?,
            broadcast_interval_ms: read_env_or_default(
                "LIVE_BROADCAST_INTERVAL_MS",
                defaults.broadcast_interval_ms,
            )?,
            broadcast_burst: read_env_or_default("LIVE_BROADCAST_BURST", defaults.broadcast_burst)?,
            state_ttl_secs: read_env_or_default("LIVE_STATE_TTL_SECS", defaults.state_ttl_secs)?,
            janitor_interval_ms: read_env_or_default(
                "LIVE_JANITOR_INTERVAL_MS",
                defaults.janitor_interval_ms,
            )?,
            max_upload_size: read_env_or_default("LIVE_MAX_UPLOAD_SIZE", defaults.max_upload_size)?,
            upload_staging_dir: env::var_os("LIVE_UPLOAD_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_staging_dir),
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn send_budget(&self) -> Duration {
        Duration::from_millis(self.send_budget_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }
}

fn read_env_or_default<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnv {
            key,
            reason: e.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
