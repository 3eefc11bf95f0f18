//! Configuration file support for usbd
//!
//! Loads and validates usbd configuration from TOML files.
//! Default location: /etc/usbd/usbd.conf

use crate::error::{Result, UsbError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbd/usbd.conf";

/// Upper bound for `partner_wait_timeout_ms` (one hour).
pub const MAX_PARTNER_WAIT_TIMEOUT_MS: u64 = 3_600_000;

/// Hardware node locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Type-C class directory holding one symlink per port and partner
    #[serde(default = "default_typec_class")]
    pub typec_class: PathBuf,

    /// High-speed i2c bus directory scanned for the TCPC client
    #[serde(default = "default_hsi2c")]
    pub hsi2c: PathBuf,

    /// Expected content of the TCPC client's `name` node
    #[serde(default = "default_tcpc_device_name")]
    pub tcpc_device_name: String,

    /// i2c client address of the TCPC
    #[serde(default = "default_i2c_client_id")]
    pub i2c_client_id: String,

    /// Gadget UDC binding node
    #[serde(default = "default_gadget_pullup")]
    pub gadget_pullup: PathBuf,

    /// UDC name bound to the gadget when data is enabled
    #[serde(default = "default_gadget_name")]
    pub gadget_name: String,

    /// OTG ID pin override node
    #[serde(default = "default_host_mode_id")]
    pub host_mode_id: PathBuf,

    /// OTG B-session (VBUS) node
    #[serde(default = "default_vbus_session")]
    pub vbus_session: PathBuf,

    /// USB connection notification enable node
    #[serde(default = "default_usb_data_enabled")]
    pub usb_data_enabled: PathBuf,

    /// Dock hub-active signal
    #[serde(default = "default_dock_usb_active")]
    pub dock_usb_active: PathBuf,

    /// Dock "move data to USB" control node
    #[serde(default = "default_dock_move_data_to_usb")]
    pub dock_move_data_to_usb: PathBuf,

    /// Power supply USB type node
    #[serde(default = "default_power_supply_usb_type")]
    pub power_supply_usb_type: PathBuf,

    /// USB port cooling device statistics directory
    #[serde(default = "default_overheat_stats")]
    pub overheat_stats: PathBuf,

    /// Plug thermistor temperature node, in millidegrees Celsius
    #[serde(default = "default_plug_temperature")]
    pub plug_temperature: PathBuf,
}

/// Role switch timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bounded wait for a partner-attach confirmation after a mode write
    #[serde(default = "default_partner_wait_timeout")]
    pub partner_wait_timeout_ms: u64,

    /// Backoff before the single retry of a contended role write
    #[serde(default = "default_role_swap_retry")]
    pub role_swap_retry_ms: u64,
}

/// Feature toggles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Report `other`/`input_power_limited` reasons as INPUT_POWER_LIMITED
    /// instead of OTHER
    #[serde(default)]
    pub input_power_limited_warning: bool,

    /// Ignore requests to toggle contaminant presence detection
    #[serde(default)]
    pub contaminant_detection_disabled: bool,
}

/// Kernel uevent classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeventConfig {
    /// `DRIVER=` values of TCPC and dock drivers whose events change port state
    #[serde(default = "default_port_drivers")]
    pub port_drivers: Vec<String>,

    /// `POWER_SUPPLY_NAME=` value of the USB power supply
    #[serde(default = "default_power_supply_name")]
    pub power_supply_name: String,

    /// `DRIVER=` value of the USB port cooling device
    #[serde(default = "default_cooling_device_driver")]
    pub cooling_device_driver: String,

    /// Netlink receive buffer size in bytes
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer_bytes: usize,
}

/// Complete usbd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsbdConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub uevent: UeventConfig,
}

// Default functions
fn default_typec_class() -> PathBuf {
    PathBuf::from("/sys/class/typec")
}

fn default_hsi2c() -> PathBuf {
    PathBuf::from("/sys/devices/platform/10d60000.hsi2c")
}

fn default_tcpc_device_name() -> String {
    "i2c-max77759tcpc".to_string()
}

fn default_i2c_client_id() -> String {
    "0025".to_string()
}

fn default_gadget_pullup() -> PathBuf {
    PathBuf::from("/config/usb_gadget/g1/UDC")
}

fn default_gadget_name() -> String {
    "11210000.dwc3".to_string()
}

fn default_host_mode_id() -> PathBuf {
    PathBuf::from("/sys/devices/platform/11210000.usb/dwc3_exynos_otg_id")
}

fn default_vbus_session() -> PathBuf {
    PathBuf::from("/sys/devices/platform/11210000.usb/dwc3_exynos_otg_b_sess")
}

fn default_usb_data_enabled() -> PathBuf {
    PathBuf::from("/sys/devices/platform/11210000.usb/usb_data_enabled")
}

fn default_dock_usb_active() -> PathBuf {
    PathBuf::from("/sys/devices/platform/google,pogo/pogo_usb_active")
}

fn default_dock_move_data_to_usb() -> PathBuf {
    PathBuf::from("/sys/devices/platform/google,pogo/move_data_to_usb")
}

fn default_power_supply_usb_type() -> PathBuf {
    PathBuf::from("/sys/class/power_supply/usb/usb_type")
}

fn default_overheat_stats() -> PathBuf {
    PathBuf::from("/sys/devices/platform/google,usbc_port_cooling_dev")
}

fn default_plug_temperature() -> PathBuf {
    PathBuf::from("/sys/class/thermal/tz-by-name/usb_pwr_therm2/temp")
}

fn default_partner_wait_timeout() -> u64 {
    8000
}

fn default_role_swap_retry() -> u64 {
    700
}

fn default_port_drivers() -> Vec<String> {
    vec!["max77759tcpc".to_string(), "pogo-transport".to_string()]
}

fn default_power_supply_name() -> String {
    "usb".to_string()
}

fn default_cooling_device_driver() -> String {
    "google,usbc_port_cooling_dev".to_string()
}

fn default_receive_buffer() -> usize {
    64 * 1024
}

// Default implementations
impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            typec_class: default_typec_class(),
            hsi2c: default_hsi2c(),
            tcpc_device_name: default_tcpc_device_name(),
            i2c_client_id: default_i2c_client_id(),
            gadget_pullup: default_gadget_pullup(),
            gadget_name: default_gadget_name(),
            host_mode_id: default_host_mode_id(),
            vbus_session: default_vbus_session(),
            usb_data_enabled: default_usb_data_enabled(),
            dock_usb_active: default_dock_usb_active(),
            dock_move_data_to_usb: default_dock_move_data_to_usb(),
            power_supply_usb_type: default_power_supply_usb_type(),
            overheat_stats: default_overheat_stats(),
            plug_temperature: default_plug_temperature(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            partner_wait_timeout_ms: default_partner_wait_timeout(),
            role_swap_retry_ms: default_role_swap_retry(),
        }
    }
}

impl Default for UeventConfig {
    fn default() -> Self {
        Self {
            port_drivers: default_port_drivers(),
            power_supply_name: default_power_supply_name(),
            cooling_device_driver: default_cooling_device_driver(),
            receive_buffer_bytes: default_receive_buffer(),
        }
    }
}

impl UsbdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    UsbError::Configuration(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(UsbError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            UsbError::Configuration(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path.as_ref(), content)?;

        Ok(())
    }

    /// Bounded partner-attach wait as Duration
    pub fn partner_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.partner_wait_timeout_ms)
    }

    /// Role write retry backoff as Duration
    pub fn role_swap_retry(&self) -> Duration {
        Duration::from_millis(self.timing.role_swap_retry_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timing.partner_wait_timeout_ms == 0 {
            return Err(UsbError::Configuration(
                "partner_wait_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.timing.partner_wait_timeout_ms > MAX_PARTNER_WAIT_TIMEOUT_MS {
            return Err(UsbError::Configuration(format!(
                "partner_wait_timeout_ms must be <= {}",
                MAX_PARTNER_WAIT_TIMEOUT_MS
            )));
        }

        if self.paths.typec_class.as_os_str().is_empty() {
            return Err(UsbError::Configuration(
                "typec_class must not be empty".to_string(),
            ));
        }

        if self.uevent.receive_buffer_bytes == 0 {
            return Err(UsbError::Configuration(
                "receive_buffer_bytes must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = UsbdConfig::default();
        assert_eq!(config.paths.typec_class, PathBuf::from("/sys/class/typec"));
        assert_eq!(config.paths.i2c_client_id, "0025");
        assert!(!config.features.input_power_limited_warning);
        assert!(!config.features.contaminant_detection_disabled);
    }

    #[test]
    fn test_timing_defaults() {
        let config = UsbdConfig::default();
        assert_eq!(config.partner_wait_timeout(), Duration::from_secs(8));
        assert_eq!(config.role_swap_retry(), Duration::from_millis(700));
    }

    #[test]
    fn test_uevent_defaults() {
        let config = UeventConfig::default();
        assert_eq!(config.port_drivers.len(), 2);
        assert_eq!(config.power_supply_name, "usb");
        assert_eq!(config.receive_buffer_bytes, 65536);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(UsbdConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = UsbdConfig::default();
        config.timing.partner_wait_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_excessive_timeout() {
        let mut config = UsbdConfig::default();
        config.timing.partner_wait_timeout_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(UsbError::Configuration(_))));

        config.timing.partner_wait_timeout_ms = MAX_PARTNER_WAIT_TIMEOUT_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_buffer() {
        let mut config = UsbdConfig::default();
        config.uevent.receive_buffer_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[paths]
typec_class = "/tmp/typec"

[timing]
partner_wait_timeout_ms = 250

[features]
input_power_limited_warning = true
"#;
        let config: UsbdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.paths.typec_class, PathBuf::from("/tmp/typec"));
        assert_eq!(config.timing.partner_wait_timeout_ms, 250);
        assert!(config.features.input_power_limited_warning);
        // Unspecified values should use defaults
        assert_eq!(config.timing.role_swap_retry_ms, 700);
        assert_eq!(config.paths.gadget_name, "11210000.dwc3");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usbd.conf");

        let mut config = UsbdConfig::default();
        config.features.contaminant_detection_disabled = true;
        config.save(&path).unwrap();

        let loaded = UsbdConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usbd.conf");
        std::fs::write(&path, "[timing\npartner_wait_timeout_ms = ").unwrap();

        let err = UsbdConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, UsbError::Configuration(_)));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = UsbdConfig::load_or_default("/nonexistent/usbd.conf").unwrap();
        assert_eq!(config, UsbdConfig::default());
    }
}
