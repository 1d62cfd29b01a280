//! Pool settings and `pgview.toml` parsing.
//!
//! [`PoolConfig`] is the runtime configuration handed to
//! [`ConnectionPool::new`](crate::pool::ConnectionPool::new). It is fixed for
//! the lifetime of a pool. [`PgViewConfig`] is the on-disk TOML
//! representation read by the `pgview` binary.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::descriptor::ConnectionRecord;
use crate::driver::postgres::PgDriverConfig;

/// Default idle threshold after which a handle is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration for the connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Handles unused for longer than this are reaped (default: 30m).
    pub idle_timeout: Duration,
    /// How often the idle reaper sweeps the pool (default: 5m).
    pub sweep_interval: Duration,
    /// Run `SELECT 1` against a freshly opened handle before caching it (default: true).
    pub probe_on_connect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            probe_on_connect: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PgViewConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub usage: UsageSection,
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    pub idle_timeout: Option<String>,
    pub sweep_interval: Option<String>,
    pub probe_on_connect: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverSection {
    pub max_connections: Option<u32>,
    pub connect_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionSection {
    /// Environment variable holding the 64-hex-char master key.
    pub key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSection {
    /// Application database holding the connection records. Usage
    /// bookkeeping is disabled when unset.
    pub database_url: Option<String>,
}

/// Environment variable read for the master key when `encryption.key_env` is unset.
pub const DEFAULT_KEY_ENV: &str = "PGVIEW_ENCRYPTION_KEY";

impl PgViewConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: PgViewConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let defaults = PoolConfig::default();
        Ok(PoolConfig {
            idle_timeout: duration_or(self.pool.idle_timeout.as_deref(), defaults.idle_timeout)?,
            sweep_interval: duration_or(
                self.pool.sweep_interval.as_deref(),
                defaults.sweep_interval,
            )?,
            probe_on_connect: self.pool.probe_on_connect.unwrap_or(defaults.probe_on_connect),
        })
    }

    pub fn driver_config(&self) -> anyhow::Result<PgDriverConfig> {
        let defaults = PgDriverConfig::default();
        Ok(PgDriverConfig {
            max_connections: self.driver.max_connections.unwrap_or(defaults.max_connections),
            connect_timeout: duration_or(
                self.driver.connect_timeout.as_deref(),
                defaults.connect_timeout,
            )?,
        })
    }

    pub fn key_env(&self) -> &str {
        self.encryption.key_env.as_deref().unwrap_or(DEFAULT_KEY_ENV)
    }

    pub fn connection(&self, id: i64) -> Option<&ConnectionRecord> {
        self.connections.iter().find(|c| c.id == id)
    }
}

fn duration_or(value: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) => match parse_duration(s) {
            Some(d) if !d.is_zero() => Ok(d),
            Some(_) => bail!("duration must be non-zero: {s:?}"),
            None => bail!("invalid duration: {s:?}"),
        },
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
