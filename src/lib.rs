//! WiFi station firmware library for ESP32.
//!
//! Keeps up to three known networks, joins the best one in range, and falls
//! back to out-of-band provisioning when none works. Everything except the
//! ESP-IDF adapters (`esp32` feature) runs and is tested on the host.
//!
//! # Modules
//!
//! - [`config`] - credential type, status, tunables
//! - [`storage`] - key-value backends (memory, JSON file, NVS)
//! - [`credentials`] - three-slot credential table with eviction
//! - [`wifi`] - station and provisioning state machines
//! - [`sim`] - simulated radio and provisioning listener

pub mod config;
pub mod credentials;
pub mod sim;
pub mod storage;
pub mod wifi;

// Re-export commonly used items
pub use config::{ConfigError, Credential, StationConfig, WifiStatus};
pub use credentials::{CredentialStore, SharedStore};
pub use storage::{KvStore, StorageError};
pub use wifi::{
    ConnectionManager, EventBus, ProvisioningOutcome, ProvisioningSession, StationOutcome,
    WifiError,
};
