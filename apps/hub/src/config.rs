//! Hub configuration management.
//!
//! Configuration is stored as TOML. The path comes from
//! `FLEETLINK_HUB_CONFIG` when set, otherwise:
//! - Linux: `~/.config/fleetlink/hub.toml`
//! - Windows: `%APPDATA%/fleetlink/hub.toml`
//!
//! A missing file is not an error; defaults are written back so the
//! operator has something to edit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetlink_dispatch::DispatcherConfig;
use fleetlink_hub_server::{HubTuning, ServerConfig};
use fleetlink_liveness::TimeoutConfig;
use fleetlink_registry::ReconcilerConfig;

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket listen address for agents and observers.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// HTTP listen address for the polling-fallback status endpoint.
    #[serde(default = "default_http_bind")]
    pub http_bind: SocketAddr,

    /// Path of the JSON device store.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Base inactivity timeout in seconds before latency adjustment.
    #[serde(default = "default_timeout_base_secs")]
    pub timeout_base_secs: u64,

    /// Lower clamp for the adaptive timeout, in seconds.
    #[serde(default = "default_timeout_min_secs")]
    pub timeout_min_secs: u64,

    /// Upper clamp for the adaptive timeout, in seconds.
    #[serde(default = "default_timeout_max_secs")]
    pub timeout_max_secs: u64,

    /// Per-device ceiling on verification pings per minute.
    #[serde(default = "default_max_probes_per_min")]
    pub max_probes_per_min: usize,

    /// Deferral window in seconds for offline reports from the bulk
    /// channel.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// Period of the full-fleet liveness sweep, in seconds.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,

    /// Idle ceiling in seconds for every connection.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Heartbeat interval in seconds; silence past twice this tears a
    /// link down.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Health score below which a device is reported unhealthy.
    #[serde(default = "default_health_threshold")]
    pub health_alert_threshold: f64,
}

fn default_bind() -> SocketAddr {
    ([0, 0, 0, 0], 9300).into()
}

fn default_http_bind() -> SocketAddr {
    ([0, 0, 0, 0], 9301).into()
}

fn default_store_path() -> String {
    "fleetlink-devices.json".into()
}

fn default_timeout_base_secs() -> u64 {
    90
}

fn default_timeout_min_secs() -> u64 {
    30
}

fn default_timeout_max_secs() -> u64 {
    300
}

fn default_max_probes_per_min() -> usize {
    6
}

fn default_grace_secs() -> u64 {
    45
}

fn default_sweep_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_health_threshold() -> f64 {
    0.5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_bind: default_http_bind(),
            store_path: default_store_path(),
            timeout_base_secs: default_timeout_base_secs(),
            timeout_min_secs: default_timeout_min_secs(),
            timeout_max_secs: default_timeout_max_secs(),
            max_probes_per_min: default_max_probes_per_min(),
            grace_secs: default_grace_secs(),
            sweep_secs: default_sweep_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            health_alert_threshold: default_health_threshold(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Liveness and queue tuning derived from the config.
    pub fn tuning(&self) -> HubTuning {
        HubTuning {
            reconciler: ReconcilerConfig {
                timeout: TimeoutConfig {
                    base: Duration::from_secs(self.timeout_base_secs),
                    min: Duration::from_secs(self.timeout_min_secs),
                    max: Duration::from_secs(self.timeout_max_secs),
                },
                max_probes_per_minute: self.max_probes_per_min,
                grace: Duration::from_secs(self.grace_secs),
            },
            dispatcher: DispatcherConfig::default(),
            sweep_period: Duration::from_secs(self.sweep_secs),
            health_threshold: self.health_alert_threshold,
            ..HubTuning::default()
        }
    }

    /// WebSocket server settings derived from the config.
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            heartbeat_period: Duration::from_secs(self.heartbeat_secs),
        }
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FLEETLINK_HUB_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("fleetlink")
            .join("hub.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("fleetlink").join("hub.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/fleetlink/hub.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.bind.port(), 9300);
        assert_eq!(config.http_bind.port(), 9301);
        assert_eq!(config.timeout_base_secs, 90);
        assert_eq!(config.max_probes_per_min, 6);
        assert_eq!(config.grace_secs, 45);
    }

    #[test]
    fn config_partial_toml() {
        // Only override the bind; everything else keeps defaults.
        let toml_str = r#"bind = "127.0.0.1:9999""#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bind.port(), 9999);
        assert_eq!(config.sweep_secs, 10);
        assert_eq!(config.health_alert_threshold, 0.5);
        assert_eq!(config.heartbeat_secs, 30);
    }

    #[test]
    fn server_settings_carry_heartbeat() {
        let config = Config {
            heartbeat_secs: 15,
            ..Config::default()
        };
        let server = config.server();
        assert_eq!(server.heartbeat_period, Duration::from_secs(15));
        assert_eq!(server.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            store_path: "/var/lib/fleetlink/devices.json".into(),
            grace_secs: 60,
            ..Config::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.store_path, "/var/lib/fleetlink/devices.json");
        assert_eq!(parsed.grace_secs, 60);
    }

    #[test]
    fn tuning_carries_timeout_bounds() {
        let config = Config {
            timeout_base_secs: 120,
            timeout_min_secs: 45,
            timeout_max_secs: 600,
            ..Config::default()
        };
        let tuning = config.tuning();
        assert_eq!(tuning.reconciler.timeout.base, Duration::from_secs(120));
        assert_eq!(tuning.reconciler.timeout.min, Duration::from_secs(45));
        assert_eq!(tuning.reconciler.timeout.max, Duration::from_secs(600));
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hub.toml");

        let config = Config {
            grace_secs: 90,
            ..Config::default()
        };
        let content = toml::to_string_pretty(&config).unwrap();
        std::fs::write(&path, &content).unwrap();

        let loaded_content = std::fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&loaded_content).unwrap();
        assert_eq!(loaded.grace_secs, 90);
    }
}
