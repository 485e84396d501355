//! Node configuration.
//!
//! # Components
//!
//! - [`wifi`] - WiFi credential type, status and utility commands
//! - [`station`] - Retry bounds and provisioning settings

mod station;
mod wifi;

pub use station::{
    ProvisioningConfig, ProvisioningHint, StationConfig, ENV_MAX_RECONNECTS,
    ENV_MAX_SCAN_ATTEMPTS,
};
pub use wifi::{
    ConfigCommand, ConfigError, Credential, WifiStatus, MAX_PASSWORD_LEN, MAX_SSID_LEN,
};
