//! Connection and provisioning tunables.
//!
//! Defaults match the bounds the firmware has always used: three scan cycles
//! without a match, five reconnects per connect episode and a three second
//! grace period before a provisioning restart.

use super::wifi::ConfigError;
use log::warn;
use std::fmt;
use std::time::Duration;

/// Upper bound for any reconnect budget.
const MAX_RECONNECTS_LIMIT: u8 = 20;

/// Upper bound for the provisioning restart delay.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Environment variable overriding [`StationConfig::max_scan_attempts`].
pub const ENV_MAX_SCAN_ATTEMPTS: &str = "WIFI_MAX_SCAN_ATTEMPTS";

/// Environment variable overriding [`StationConfig::max_reconnects`].
pub const ENV_MAX_RECONNECTS: &str = "WIFI_MAX_RECONNECTS";

/// Bounds for the direct-connect flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationConfig {
    /// Scan cycles without a stored network in sight before giving up.
    pub max_scan_attempts: u8,
    /// Connect re-issues after a disconnect before the slot is marked failed.
    pub max_reconnects: u8,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            max_scan_attempts: 3,
            max_reconnects: 5,
        }
    }
}

impl StationConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_scan_attempts == 0 {
            return Err(ConfigError::InvalidSetting("max_scan_attempts must be > 0"));
        }
        validate_reconnects(self.max_reconnects)
    }

    /// Build a configuration from the defaults and environment overrides.
    ///
    /// Values that do not parse, or that fail validation, are logged and the
    /// default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let setting = |name: &str| lookup(name).and_then(|raw| parse_u8(name, &raw));
        let config = Self {
            max_scan_attempts: setting(ENV_MAX_SCAN_ATTEMPTS)
                .unwrap_or(defaults.max_scan_attempts),
            max_reconnects: setting(ENV_MAX_RECONNECTS).unwrap_or(defaults.max_reconnects),
        };
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!("Ignoring station overrides: {}", e);
                defaults
            }
        }
    }
}

fn validate_reconnects(max_reconnects: u8) -> Result<(), ConfigError> {
    if max_reconnects == 0 {
        return Err(ConfigError::InvalidSetting("max_reconnects must be > 0"));
    }
    if max_reconnects > MAX_RECONNECTS_LIMIT {
        return Err(ConfigError::InvalidSetting("max_reconnects must be <= 20"));
    }
    Ok(())
}

fn parse_u8(name: &str, raw: &str) -> Option<u8> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// Text shown to the user while the device waits for credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningHint {
    /// Out-of-band (smart-config) provisioning: an instruction for the phone app.
    SmartConfig { instruction: String },
    /// Captive portal: the access point to join and the page to open.
    SoftAp { ssid: String, url: String },
}

impl Default for ProvisioningHint {
    fn default() -> Self {
        Self::SmartConfig {
            instruction: "Send WiFi credentials from the ESP-Touch app or the WeChat AirKiss \
                          mini program"
                .to_string(),
        }
    }
}

impl fmt::Display for ProvisioningHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SmartConfig { instruction } => write!(f, "{}", instruction),
            Self::SoftAp { ssid, url } => write!(
                f,
                "Connect your phone to the hotspot {}, then open {} in a browser",
                ssid, url
            ),
        }
    }
}

/// Bounds for the provisioning flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Connect re-issues for a delivered credential before restarting.
    pub max_reconnects: u8,
    /// Delay between scheduling and performing a restart.
    pub restart_delay: Duration,
    /// Instruction pushed to the status display on entry.
    pub hint: ProvisioningHint,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            restart_delay: Duration::from_secs(3),
            hint: ProvisioningHint::default(),
        }
    }
}

impl ProvisioningConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_reconnects(self.max_reconnects)?;
        if self.restart_delay.is_zero() {
            return Err(ConfigError::InvalidSetting("restart_delay must be > 0"));
        }
        if self.restart_delay > MAX_RESTART_DELAY {
            return Err(ConfigError::InvalidSetting("restart_delay must be <= 60s"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_station_config() {
        let config = StationConfig::default();
        assert_eq!(config.max_scan_attempts, 3);
        assert_eq!(config.max_reconnects, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_scan_attempts_rejected() {
        let config = StationConfig {
            max_scan_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_reconnect_limit() {
        let config = StationConfig {
            max_reconnects: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProvisioningConfig {
            max_reconnects: 21,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    fn overrides(pairs: &[(&str, &str)]) -> StationConfig {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StationConfig::from_lookup(move |name| {
            pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        })
    }

    #[test]
    fn test_env_overrides_applied() {
        let config = overrides(&[(ENV_MAX_SCAN_ATTEMPTS, "4"), (ENV_MAX_RECONNECTS, " 7 ")]);
        assert_eq!(config.max_scan_attempts, 4);
        assert_eq!(config.max_reconnects, 7);
    }

    #[test]
    fn test_env_unparsable_value_ignored() {
        let config = overrides(&[(ENV_MAX_SCAN_ATTEMPTS, "abc"), (ENV_MAX_RECONNECTS, "7")]);
        assert_eq!(config.max_scan_attempts, 3);
        assert_eq!(config.max_reconnects, 7);
    }

    #[test]
    fn test_env_invalid_value_falls_back_to_defaults() {
        let config = overrides(&[(ENV_MAX_SCAN_ATTEMPTS, "0"), (ENV_MAX_RECONNECTS, "7")]);
        assert_eq!(config, StationConfig::default());

        let config = overrides(&[(ENV_MAX_RECONNECTS, "25")]);
        assert_eq!(config, StationConfig::default());
    }

    #[test]
    fn test_env_absent_keeps_defaults() {
        assert_eq!(overrides(&[]), StationConfig::default());
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let config = StationConfig {
            max_reconnects: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));

        let config = ProvisioningConfig {
            max_reconnects: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProvisioningConfig {
            restart_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_default_provisioning_config() {
        let config = ProvisioningConfig::default();
        assert_eq!(config.max_reconnects, 5);
        assert_eq!(config.restart_delay, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_restart_delay_limit() {
        let config = ProvisioningConfig {
            restart_delay: Duration::from_secs(61),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_default_hint_names_both_smart_config_apps() {
        let text = ProvisioningHint::default().to_string();
        assert!(text.contains("ESP-Touch"));
        assert!(text.contains("AirKiss"));
    }

    #[test]
    fn test_soft_ap_hint_text() {
        let hint = ProvisioningHint::SoftAp {
            ssid: "Station-1A2B".to_string(),
            url: "http://192.168.4.1".to_string(),
        };
        let text = hint.to_string();
        assert!(text.contains("Station-1A2B"));
        assert!(text.contains("http://192.168.4.1"));
    }
}
