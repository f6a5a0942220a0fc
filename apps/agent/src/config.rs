//! Agent configuration management.
//!
//! Configuration is stored as TOML. The path comes from
//! `FLEETLINK_AGENT_CONFIG` when set, otherwise:
//! - Linux: `~/.config/fleetlink/agent.toml`
//! - Windows: `%APPDATA%/fleetlink/agent.toml`
//!
//! The device identifier is generated once on first run and written
//! back, so a device keeps its identity across restarts and reinstalls
//! of the same config file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetlink_agent_client::AgentConfig;
use fleetlink_lifecycle::BackoffConfig;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket URL of the hub.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Stable device identifier (generated on first run).
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Display name of this device (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Heartbeat period in seconds while idle.
    #[serde(default = "default_idle_heartbeat_secs")]
    pub idle_heartbeat_secs: u64,

    /// Heartbeat period in seconds while actively in use.
    #[serde(default = "default_active_heartbeat_secs")]
    pub active_heartbeat_secs: u64,

    /// Consecutive failed dials before an extended cooldown.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Extended pause in seconds after the attempt ceiling.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:9300".into()
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "FleetLink device".into())
}

fn default_idle_heartbeat_secs() -> u64 {
    60
}

fn default_active_heartbeat_secs() -> u64 {
    15
}

fn default_max_reconnect_attempts() -> u32 {
    20
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            device_id: default_device_id(),
            name: default_name(),
            idle_heartbeat_secs: default_idle_heartbeat_secs(),
            active_heartbeat_secs: default_active_heartbeat_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    ///
    /// Always saves after loading so a freshly generated `device_id`
    /// sticks.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        config.save()?;
        Ok(config)
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

    /// Session settings derived from the config.
    pub fn session(&self) -> AgentConfig {
        let mut session = AgentConfig::new(
            self.hub_url.clone(),
            self.device_id.clone(),
            self.name.clone(),
        );
        session.idle_heartbeat = Duration::from_secs(self.idle_heartbeat_secs);
        session.active_heartbeat = Duration::from_secs(self.active_heartbeat_secs);
        session.backoff = BackoffConfig {
            max_attempts: self.max_reconnect_attempts,
            cooldown: Duration::from_secs(self.cooldown_secs),
            ..BackoffConfig::default()
        };
        session
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FLEETLINK_AGENT_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("fleetlink")
            .join("agent.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("fleetlink").join("agent.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/fleetlink/agent.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.name.is_empty());
        assert!(!config.device_id.is_empty());
        assert_eq!(config.idle_heartbeat_secs, 60);
        assert_eq!(config.active_heartbeat_secs, 15);
        assert_eq!(config.max_reconnect_attempts, 20);
    }

    #[test]
    fn generated_device_ids_differ() {
        assert_ne!(Config::default().device_id, Config::default().device_id);
    }

    #[test]
    fn config_partial_toml_keeps_device_id() {
        let toml_str = r#"
            hub_url = "ws://hub.local:9300"
            device_id = "workshop-tablet-3"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hub_url, "ws://hub.local:9300");
        assert_eq!(config.device_id, "workshop-tablet-3");
        assert_eq!(config.idle_heartbeat_secs, 60);
    }

    #[test]
    fn session_reflects_heartbeat_settings() {
        let config = Config {
            idle_heartbeat_secs: 120,
            active_heartbeat_secs: 10,
            max_reconnect_attempts: 5,
            ..Config::default()
        };
        let session = config.session();
        assert_eq!(session.idle_heartbeat, Duration::from_secs(120));
        assert_eq!(session.active_heartbeat, Duration::from_secs(10));
        assert_eq!(session.backoff.max_attempts, 5);
    }

    #[test]
    fn config_roundtrip_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");

        let config = Config {
            name: "Bench phone".into(),
            ..Config::default()
        };
        let content = toml::to_string_pretty(&config).unwrap();
        std::fs::write(&path, &content).unwrap();

        let loaded_content = std::fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&loaded_content).unwrap();
        assert_eq!(loaded.name, "Bench phone");
        assert_eq!(loaded.device_id, config.device_id);
    }
}
