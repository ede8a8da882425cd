//! Configuration management
//!
//! Handles:
//! - MQTT broker settings
//! - Agent loop tuning (retry period, property backoff, run-once)
//! - Provisioning identity
//! - Initial state for the device model (free-form `[InitialState]` table)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::initial_state::{ConfigSource, INITIAL_STATE_SECTION};

pub const CONFIG_ENV_VAR: &str = "TWINLINK_CONFIG";
const LOCAL_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub agent: LoopConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Section name -> key/value map, consumed by the initial state loader
    #[serde(rename = "InitialState", default, skip_serializing_if = "toml::Table::is_empty")]
    pub initial_state: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub base_topic: String,
    /// How long to wait for the broker to accept the connection
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Exit after a single telemetry + property sync iteration
    pub run_once: bool,
    pub telemetry_retry_secs: u64,
    pub property_backoff_initial_secs: u64,
    pub property_backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub source: String,
    pub device_id: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            base_topic: "twinlink/devices".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            run_once: false,
            telemetry_retry_secs: 60,
            property_backoff_initial_secs: 60,
            property_backoff_cap_secs: 24 * 60 * 60,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            source: "static".to_string(),
            device_id: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            agent: LoopConfig::default(),
            provisioning: ProvisioningConfig::default(),
            initial_state: toml::Table::new(),
        }
    }
}

impl LoopConfig {
    pub fn telemetry_retry(&self) -> Duration {
        Duration::from_secs(self.telemetry_retry_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_secs(self.property_backoff_initial_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.property_backoff_cap_secs)
    }
}

impl AgentConfig {
    /// Load config from the first existing location, or defaults
    pub async fn load() -> Result<Self, ConfigError> {
        match Self::resolve_path() {
            Some(path) => Self::load_from(&path).await,
            None => {
                tracing::warn!("Config: no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Config: loaded {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// `TWINLINK_CONFIG`, then `./config.toml`, then the OS config directory
    pub fn resolve_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }

        Self::config_file_path().filter(|p| p.exists())
    }

    /// OS-specific config file path
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("twinlink");
        path.push(LOCAL_CONFIG_FILE);
        Some(path)
    }

    /// Client id, defaulting to one derived from the device id
    pub fn client_id(&self, device_id: &str) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("twinlink-{}", device_id))
    }
}

/// Initial state is looked up under `InitialState:<section>`
impl ConfigSource for AgentConfig {
    fn section_exists(&self, path: &str) -> bool {
        match strip_initial_state(path) {
            Some("") => !self.initial_state.is_empty(),
            Some(rest) => self.initial_state.section_exists(rest),
            None => false,
        }
    }

    fn children(&self, path: &str) -> std::collections::HashMap<String, String> {
        match strip_initial_state(path) {
            Some(rest) => self.initial_state.children(rest),
            None => Default::default(),
        }
    }
}

fn strip_initial_state(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(INITIAL_STATE_SECTION)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.provisioning.source, "static");
        assert_eq!(config.agent.backoff_initial(), Duration::from_secs(60));
        assert_eq!(config.agent.backoff_cap(), Duration::from_secs(86400));
        assert!(!config.agent.run_once);
    }

    #[test]
    fn test_config_file_path() {
        if let Some(path) = AgentConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("twinlink"));
            assert!(path.to_string_lossy().contains("config.toml"));
        }
    }

    #[test]
    fn test_parse_partial_config() {
        let config = AgentConfig::parse(
            r#"
            [mqtt]
            broker_host = "broker.local"

            [agent]
            run_once = true

            [provisioning]
            device_id = "dev-01"

            [InitialState.Root]
            SerialNumber = "42"
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.broker_host, "broker.local");
        assert_eq!(config.mqtt.broker_port, 1883);
        assert!(config.agent.run_once);
        assert_eq!(config.provisioning.device_id.as_deref(), Some("dev-01"));
        assert_eq!(config.client_id("dev-01"), "twinlink-dev-01");

        assert!(config.section_exists("InitialState"));
        assert!(config.section_exists("InitialState:Root"));
        assert!(!config.section_exists("InitialState:thermostat1"));
        assert_eq!(config.children("InitialState:Root")["SerialNumber"], "42");
    }

    #[test]
    fn test_empty_initial_state_is_missing() {
        let config = AgentConfig::parse("").unwrap();
        assert!(!config.section_exists("InitialState"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[agent]\ntelemetry_retry_secs = 5\n").await.unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();
        assert_eq!(config.agent.telemetry_retry(), Duration::from_secs(5));

        tokio::fs::write(&path, "[agent\n").await.unwrap();
        assert!(matches!(AgentConfig::load_from(&path).await, Err(ConfigError::Parse { .. })));
    }
}
