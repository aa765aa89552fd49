//! TOML configuration for the watchkeeper daemon.
//!
//! Lookup order: an explicit path, the `WATCHKEEPER_CONFIG` environment
//! variable, `/etc/watchkeeper/watchkeeper.toml`, then compiled-in defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::WatchdogOptions;

pub const CONFIG_ENV: &str = "WATCHKEEPER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/watchkeeper/watchkeeper.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicit path must load; the fallbacks only warn.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "WATCHKEEPER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Render as TOML, e.g. for `config show`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the HTTP control plane.
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How long shutdown waits for in-flight handlers.
    pub drain_timeout_ms: u64,
    pub components: BucketConfig,
    pub monitorings: BucketConfig,
    pub tasks: BucketConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
            components: BucketConfig::default(),
            monitorings: BucketConfig {
                failed_interval_ms: 10_000,
                ..BucketConfig::default()
            },
            tasks: BucketConfig {
                // Failed tasks are only retried on request.
                failed_interval_ms: 0,
                ..BucketConfig::default()
            },
        }
    }
}

impl WatchdogConfig {
    pub fn options(&self, bucket: &BucketConfig) -> WatchdogOptions {
        WatchdogOptions {
            pending_interval: Duration::from_millis(bucket.pending_interval_ms),
            running_interval: Duration::from_millis(bucket.running_interval_ms),
            failed_interval: Duration::from_millis(bucket.failed_interval_ms),
            max_workers: bucket.max_workers,
            queue_capacity: bucket.queue_capacity,
            operation_timeout: Duration::from_millis(bucket.operation_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

/// Poll cadence and worker bounds for one entity kind. A zero interval
/// disables that status bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub pending_interval_ms: u64,
    pub running_interval_ms: u64,
    pub failed_interval_ms: u64,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Zero disables the per-handler deadline.
    pub operation_timeout_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            pending_interval_ms: 5_000,
            running_interval_ms: 5_000,
            failed_interval_ms: 5_000,
            max_workers: 8,
            queue_capacity: 256,
            operation_timeout_ms: 60_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_ms: u64,
    /// Accept hosts with no pinned fingerprint. Do not enable in production.
    pub accept_unknown_hosts: bool,
    /// `"host:port"` to `"SHA256:..."` fingerprint.
    pub known_hosts: HashMap<String, String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            accept_unknown_hosts: false,
            known_hosts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metrics API root, without the trailing `/query`.
    pub api_url: String,
    pub default_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://prometheus:9090/api/v1".to_string(),
            default_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub simulated_delay_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            simulated_delay_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}
