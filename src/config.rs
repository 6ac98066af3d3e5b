use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::shutdown::ShutdownPriority;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub monitor: MonitorConfig,
    pub eviction: EvictionConfig,
    pub shutdown: ShutdownConfig,
}

/// Which listener the daemon binds.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportPreference {
    /// Unix socket, falling back to loopback HTTP when the socket cannot be bound.
    Auto,
    Socket,
    Http,
}

impl std::str::FromStr for TransportPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "socket" => Ok(Self::Socket),
            "http" => Ok(Self::Http),
            _ => Err(format!("unknown transport: {s}")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportPreference,
    pub socket_name: String,
    pub http_port: u16,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub grace_period_ms: u64,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: String,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Fraction of a limit at which a `warning` alert is raised; `error` is raised at the limit.
    pub warning_ratio: f64,
    pub alert_cooldown_ms: u64,
    pub episode_cache_limit: usize,
    pub embedding_cache_limit: usize,
    pub trajectory_cache_limit: usize,
    pub total_overhead_limit_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EvictionConfig {
    pub warning_evict_percent: f64,
    pub error_evict_percent: f64,
    pub handler_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub global_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub debounce_ms: u64,
    pub exit_process: bool,
    pub tier_timeouts_ms: TierTimeouts,
}

/// Optional per-tier default handler timeouts. Unset tiers use `handler_timeout_ms`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TierTimeouts {
    pub critical: Option<u64>,
    pub high: Option<u64>,
    pub normal: Option<u64>,
    pub low: Option<u64>,
    pub cleanup: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Auto,
            socket_name: "memoryd.sock".into(),
            http_port: 3737,
            max_connections: 100,
            max_frame_bytes: 10 * 1024 * 1024,
            grace_period_ms: 5_000,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_memoryd_dir().to_string_lossy().into_owned(),
            flush_interval_ms: 5_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            warning_ratio: 0.8,
            alert_cooldown_ms: 60_000,
            episode_cache_limit: 10_000,
            embedding_cache_limit: 5_000,
            trajectory_cache_limit: 1_000,
            total_overhead_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            warning_evict_percent: 0.2,
            error_evict_percent: 0.4,
            handler_timeout_ms: 10_000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            global_timeout_ms: 30_000,
            handler_timeout_ms: 5_000,
            debounce_ms: 1_000,
            exit_process: false,
            tier_timeouts_ms: TierTimeouts::default(),
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl StorageConfig {
    /// Resolve the storage directory, expanding `~` if needed.
    pub fn resolved_dir(&self) -> PathBuf {
        expand_tilde(&self.dir)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl ShutdownConfig {
    /// Default timeout for a handler at `priority` that carries no override of its own.
    pub fn tier_timeout(&self, priority: ShutdownPriority) -> Duration {
        let tier = match priority {
            ShutdownPriority::Critical => self.tier_timeouts_ms.critical,
            ShutdownPriority::High => self.tier_timeouts_ms.high,
            ShutdownPriority::Normal => self.tier_timeouts_ms.normal,
            ShutdownPriority::Low => self.tier_timeouts_ms.low,
            ShutdownPriority::Cleanup => self.tier_timeouts_ms.cleanup,
        };
        Duration::from_millis(tier.unwrap_or(self.handler_timeout_ms))
    }
}

/// Returns `~/.memoryd/`
pub fn default_memoryd_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".memoryd")
}

/// Returns the default config file path: `~/.memoryd/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memoryd_dir().join("config.toml")
}

impl DaemonConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            DaemonConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MEMORYD_DIR, MEMORYD_LOG_LEVEL,
    /// MEMORYD_TRANSPORT, MEMORYD_HTTP_PORT, MEMORYD_MAX_CONNECTIONS).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORYD_DIR") {
            self.storage.dir = val;
        }
        if let Ok(val) = std::env::var("MEMORYD_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEMORYD_TRANSPORT") {
            match val.parse() {
                Ok(transport) => self.server.transport = transport,
                Err(e) => tracing::warn!(error = %e, "ignoring MEMORYD_TRANSPORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMORYD_HTTP_PORT") {
            match val.parse() {
                Ok(port) => self.server.http_port = port,
                Err(e) => tracing::warn!(error = %e, "ignoring MEMORYD_HTTP_PORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMORYD_MAX_CONNECTIONS") {
            match val.parse() {
                Ok(max) => self.server.max_connections = max,
                Err(e) => tracing::warn!(error = %e, "ignoring MEMORYD_MAX_CONNECTIONS"),
            }
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.transport, TransportPreference::Auto);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.eviction.warning_evict_percent, 0.2);
        assert_eq!(config.eviction.error_evict_percent, 0.4);
        assert_eq!(config.shutdown.global_timeout_ms, 30_000);
        assert!(config.storage.dir.ends_with(".memoryd"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
transport = "http"
http_port = 9000

[storage]
dir = "/tmp/memoryd-test"

[shutdown]
global_timeout_ms = 1000

[shutdown.tier_timeouts_ms]
critical = 250
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.transport, TransportPreference::Http);
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.storage.dir, "/tmp/memoryd-test");
        assert_eq!(config.shutdown.global_timeout_ms, 1000);
        // defaults still apply for unset fields
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.storage.flush_interval_ms, 5_000);
    }

    #[test]
    fn tier_timeouts_fall_back_to_handler_default() {
        let mut config = ShutdownConfig::default();
        config.tier_timeouts_ms.critical = Some(250);

        assert_eq!(
            config.tier_timeout(ShutdownPriority::Critical),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.tier_timeout(ShutdownPriority::Cleanup),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = DaemonConfig::default();
        std::env::set_var("MEMORYD_DIR", "/tmp/override");
        std::env::set_var("MEMORYD_LOG_LEVEL", "trace");
        std::env::set_var("MEMORYD_TRANSPORT", "socket");
        std::env::set_var("MEMORYD_HTTP_PORT", "not-a-port");

        config.apply_env_overrides();

        assert_eq!(config.storage.dir, "/tmp/override");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.server.transport, TransportPreference::Socket);
        // unparsable values are ignored
        assert_eq!(config.server.http_port, 3737);

        // Clean up
        std::env::remove_var("MEMORYD_DIR");
        std::env::remove_var("MEMORYD_LOG_LEVEL");
        std::env::remove_var("MEMORYD_TRANSPORT");
        std::env::remove_var("MEMORYD_HTTP_PORT");
    }
}
