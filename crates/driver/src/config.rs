//! Driver configuration management

use crate::power::DEFAULT_POOL_SIZE;
use crate::session::SessionOptions;
use crate::state::MuxConfig;
use anyhow::{Context, Result, anyhow};
use protocol::MAX_DLCI;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub mux: MuxSettings,
    #[serde(default)]
    pub power: PowerSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
    /// Name the upper layer knows the device by
    pub port_name: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            port_name: "modem0".to_string(),
        }
    }
}

/// Which USB device to drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Vendor ID, e.g. "0x05c6"
    pub vendor_id: String,
    /// Product ID, e.g. "0x9025"
    pub product_id: String,
    /// Logical interface this instance serves
    #[serde(default)]
    pub interface_number: u8,
    /// Interface of the underlying USB function (differs for MUX channels)
    #[serde(default)]
    pub physical_interface_number: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: "0x05c6".to_string(),
            product_id: "0x9025".to_string(),
            interface_number: 0,
            physical_interface_number: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "MuxSettings::default_control_dlci")]
    pub control_dlci: u8,
    #[serde(default = "MuxSettings::default_data_dlci")]
    pub data_dlci: u8,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            control_dlci: Self::default_control_dlci(),
            data_dlci: Self::default_data_dlci(),
        }
    }
}

impl MuxSettings {
    fn default_control_dlci() -> u8 {
        1
    }

    fn default_data_dlci() -> u8 {
        2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSettings {
    /// Allow selective suspend while no client is attached
    #[serde(default = "PowerSettings::default_selective_suspend")]
    pub selective_suspend: bool,
    /// Idle time before selective suspend (0 = never)
    #[serde(default = "PowerSettings::default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Slots for self-originated power requests
    #[serde(default = "PowerSettings::default_pool")]
    pub power_request_pool: usize,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            selective_suspend: Self::default_selective_suspend(),
            idle_timeout_secs: Self::default_idle_timeout(),
            power_request_pool: Self::default_pool(),
        }
    }
}

impl PowerSettings {
    fn default_selective_suspend() -> bool {
        true
    }

    fn default_idle_timeout() -> u64 {
        5
    }

    fn default_pool() -> usize {
        DEFAULT_POOL_SIZE
    }
}

/// Persistent key-value store location
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreSettings {
    /// TOML file; `~` is expanded. Unset keeps values in memory only.
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreSettings {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-modem-driver/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
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
            config_dir.join("usb-modem-driver").join("driver.toml")
        } else {
            PathBuf::from(".config/usb-modem-driver/driver.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.port_name.is_empty() {
            return Err(anyhow!("Empty port_name"));
        }

        Self::parse_hex_id(&self.device.vendor_id, "vendor_id")?;
        Self::parse_hex_id(&self.device.product_id, "product_id")?;

        for (name, dlci) in [
            ("control_dlci", self.mux.control_dlci),
            ("data_dlci", self.mux.data_dlci),
        ] {
            if dlci == 0 || dlci > MAX_DLCI {
                return Err(anyhow!(
                    "Invalid {} {}, must be 1-{}",
                    name,
                    dlci,
                    MAX_DLCI
                ));
            }
        }
        if self.mux.control_dlci == self.mux.data_dlci {
            return Err(anyhow!(
                "control_dlci and data_dlci must differ (both {})",
                self.mux.data_dlci
            ));
        }

        if self.power.power_request_pool == 0 {
            return Err(anyhow!("power_request_pool must be at least 1"));
        }

        Ok(())
    }

    /// Parse a hex ID such as "0x05c6"
    pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
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
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }

    pub fn vendor_id(&self) -> Result<u16> {
        Self::parse_hex_id(&self.device.vendor_id, "vendor_id")
    }

    pub fn product_id(&self) -> Result<u16> {
        Self::parse_hex_id(&self.device.product_id, "product_id")
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            enabled: self.mux.enabled,
            control_dlci: self.mux.control_dlci,
            data_dlci: self.mux.data_dlci,
            physical_interface: self.device.physical_interface_number,
            interface_number: self.device.interface_number,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            port_name: self.driver.port_name.clone(),
            mux: self.mux_config(),
            selective_suspend: self.power.selective_suspend,
            idle_timeout: (self.power.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.power.idle_timeout_secs)),
            power_request_pool: self.power.power_request_pool,
            ..Default::default()
        }
    }
}
