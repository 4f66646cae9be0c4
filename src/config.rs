use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SensorError};

/// Top-level sensor configuration, loaded from YAML.
///
/// Every section has usable defaults so an empty (or missing) config file
/// produces a working sensor on a typical home network.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub network: NetworkConfig,
    pub decoys: DecoyConfig,
    pub scouts: ScoutConfig,
    pub home_assistant: HomeAssistantConfig,
    pub classifier: ClassifierConfig,
    pub alerts: AlertConfig,
    pub canary: CanaryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub name: String,
    pub data_dir: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: "SquirrelOps".to_string(),
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR subnet to scan, or "auto" to detect the local /24.
    pub subnet: String,
    pub interface: String,
    /// Seconds between scan cycles.
    pub scan_interval: u64,
    /// Ports checked during Phase 2. Empty means the built-in default list.
    pub scan_ports: Vec<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: "auto".to_string(),
            interface: "eth0".to_string(),
            scan_interval: 300,
            scan_ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoyConfig {
    pub max_decoys: usize,
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self { max_decoys: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub max_mimic_decoys: usize,
    pub max_concurrent_probes: usize,
    /// Host-number offsets within the subnet reserved for virtual IPs.
    pub virtual_ip_range_start: u8,
    pub virtual_ip_range_end: u8,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            max_mimic_decoys: 10,
            max_concurrent_probes: 20,
            virtual_ip_range_start: 200,
            virtual_ip_range_end: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub enabled: bool,
    pub url: String,
    pub token: String,
}

impl HomeAssistantConfig {
    /// True only when the integration is switched on and fully configured.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.url.is_empty() && !self.token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClassifierConfig {
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub slack_webhook_url: Option<String>,
    pub slack_min_severity: String,
    pub log_min_severity: String,
    pub push_relay_url: Option<String>,
    pub push_relay_token: Option<String>,
    pub push_device_token: Option<String>,
    pub push_min_severity: String,
    pub retention_days: u32,
    pub incident_window_minutes: i64,
    pub incident_close_window_minutes: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: None,
            slack_min_severity: "medium".to_string(),
            log_min_severity: "low".to_string(),
            push_relay_url: None,
            push_relay_token: None,
            push_device_token: None,
            push_min_severity: "high".to_string(),
            retention_days: 90,
            incident_window_minutes: 15,
            incident_close_window_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Apex domain for canary hostnames ({32-hex}.canary.{apex}).
    pub apex_domain: String,
    pub poll_interval_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            apex_domain: "squirrelops.io".to_string(),
            poll_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults;
    /// a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            log::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| SensorError::Config(e.to_string()))
    }
}
