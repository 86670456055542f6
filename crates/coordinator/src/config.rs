//! Coordinator configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub coordinator: CoordinatorSettings,
    pub devices: DeviceSettings,
    /// Transfer queue limits
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Event delivery configuration
    #[serde(default)]
    pub events: EventSettings,
    /// Session modelling
    #[serde(default)]
    pub sessions: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Origin every session and grant belongs to
    pub origin: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// VID:PID patterns of devices the host layer may report (empty = all)
    pub filters: Vec<String>,
}

/// Transfer scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Maximum transfers queued or in flight per open handle
    #[serde(default = "SchedulerSettings::default_max_pending")]
    pub max_pending_transfers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_pending_transfers: Self::default_max_pending(),
        }
    }
}

impl SchedulerSettings {
    fn default_max_pending() -> usize {
        256
    }
}

/// Event delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "EventSettings::default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: Self::default_buffer_capacity(),
        }
    }
}

impl EventSettings {
    fn default_buffer_capacity() -> usize {
        64
    }
}

/// How ports connected to one shared worker map onto sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedWorkerPorts {
    /// Every port is its own session
    #[default]
    Independent,
    /// Ports of one named shared worker share a session, each on its own flow
    Coalesced,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub shared_worker_ports: SharedWorkerPorts,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSettings {
                origin: "https://localhost".to_string(),
                log_level: "info".to_string(),
            },
            devices: DeviceSettings {
                filters: Vec::new(),
            },
            scheduler: SchedulerSettings::default(),
            events: EventSettings::default(),
            sessions: SessionSettings::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-coordinator/coordinator.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CoordinatorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a user-supplied path (`~` is expanded)
    pub fn load_from(path: &str) -> Result<Self> {
        let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(path_buf))
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-coordinator").join("coordinator.toml")
        } else {
            PathBuf::from(".config/usb-coordinator/coordinator.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.coordinator.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.coordinator.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.coordinator.origin.trim().is_empty() {
            return Err(anyhow!("Origin must not be empty"));
        }

        for filter in &self.devices.filters {
            Self::validate_filter(filter)?;
        }

        if self.scheduler.max_pending_transfers == 0 {
            return Err(anyhow!("max_pending_transfers must be greater than 0"));
        }
        if self.events.buffer_capacity == 0 {
            return Err(anyhow!("buffer_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.coordinator.log_level, "info");
        assert!(config.devices.filters.is_empty());
        assert_eq!(config.scheduler.max_pending_transfers, 256);
        assert_eq!(config.events.buffer_capacity, 64);
        assert_eq!(
            config.sessions.shared_worker_ports,
            SharedWorkerPorts::Independent
        );
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(CoordinatorConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(CoordinatorConfig::validate_filter("0x1234:*").is_ok());
        assert!(CoordinatorConfig::validate_filter("*:0x5678").is_ok());
        assert!(CoordinatorConfig::validate_filter("*:*").is_ok());
        assert!(CoordinatorConfig::validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(CoordinatorConfig::validate_filter("1234:5678").is_err());
        assert!(CoordinatorConfig::validate_filter("0x1234").is_err());
        assert!(CoordinatorConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(CoordinatorConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(CoordinatorConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = CoordinatorConfig::default();
        config.sessions.shared_worker_ports = SharedWorkerPorts::Coalesced;
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("shared_worker_ports = \"coalesced\""));

        let parsed: CoordinatorConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.coordinator.origin, parsed.coordinator.origin);
        assert_eq!(parsed.sessions.shared_worker_ports, SharedWorkerPorts::Coalesced);
    }

    #[test]
    fn test_validate_limits() {
        let mut config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());

        config.coordinator.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
        config.coordinator.log_level = "debug".to_string();
        assert!(config.validate().is_ok());

        config.scheduler.max_pending_transfers = 0;
        assert!(config.validate().is_err());
        config.scheduler.max_pending_transfers = 1;

        config.events.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }
}
