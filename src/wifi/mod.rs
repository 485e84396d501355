//! WiFi connection state machines and their collaborators.
//!
//! Two flows share the credential table:
//!
//! - [`ConnectionManager`] scans, matches visible networks against stored
//!   credentials, connects and retries, and scores the slot it used.
//! - [`ProvisioningSession`] waits for credentials delivered out of band,
//!   connects with them, persists them on success and schedules a restart.
//!
//! Both consume [`Event`]s from an [`EventBus`]. Each runs a dispatcher task
//! that feeds events one at a time into a synchronous transition function,
//! and resolves its `start()` future exactly once with the terminal outcome.
//!
//! # Collaborators
//!
//! - [`Radio`] - station control (scan, configure, connect)
//! - [`ProvisioningListener`] - out-of-band credential receiver
//! - [`Restarter`] - delayed device restart
//! - [`StatusSink`] - human-readable status display

mod dispatch;
mod events;
mod provisioning;
mod station;

#[cfg(feature = "esp32")]
mod esp;

pub use events::{
    AuthMode, Event, EventBus, ProvisioningEvent, RadioEvent, VisibleNetwork, EVENT_BUS_CAPACITY,
};
pub use provisioning::{
    ProvisioningMachine, ProvisioningOutcome, ProvisioningSession, ProvisioningState,
};
pub use station::{
    match_visible, ConnectionManager, FailureReason, StationMachine, StationOutcome, StationState,
};

#[cfg(feature = "esp32")]
pub use esp::{EspRadio, EspRestarter, SmartConfigListener};

use crate::config::{ConfigError, Credential};
use crate::storage::StorageError;
use log::{info, warn};
use std::time::Duration;

/// Access point hardware address.
pub type Bssid = [u8; 6];

/// Link quality of the current association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Received signal strength in dBm.
    pub rssi: i8,
    /// Primary channel.
    pub channel: u8,
}

/// Station-mode radio control.
///
/// Commands return once issued; their results arrive later as
/// [`RadioEvent`]s on the bus.
pub trait Radio: Send {
    /// Bring up station mode. Emits [`RadioEvent::StationStarted`].
    fn start_station(&mut self) -> Result<(), RadioError>;

    /// Shut the station down and release scan/connect resources.
    fn stop(&mut self) -> Result<(), RadioError>;

    /// Start a scan. Emits [`RadioEvent::ScanComplete`].
    fn start_scan(&mut self) -> Result<(), RadioError>;

    /// Set the credential (and optionally the access point) to join.
    fn set_config(&mut self, credential: &Credential, bssid: Option<Bssid>)
        -> Result<(), RadioError>;

    /// Associate using the current configuration. Emits
    /// [`RadioEvent::GotIp`] or [`RadioEvent::Disconnected`].
    fn connect(&mut self) -> Result<(), RadioError>;

    /// Leave the current network.
    fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Enable or disable modem power saving.
    fn set_power_save(&mut self, enabled: bool) -> Result<(), RadioError>;

    /// Signal strength and channel of the current association.
    fn association_info(&self) -> Result<AssociationInfo, RadioError>;
}

/// Receiver for out-of-band credential delivery.
///
/// While running it emits [`ProvisioningEvent`]s on the bus.
pub trait ProvisioningListener: Send {
    /// Start listening.
    fn start(&mut self) -> Result<(), RadioError>;

    /// Stop listening.
    fn stop(&mut self) -> Result<(), RadioError>;
}

/// Device restart facility.
pub trait Restarter: Send + Sync {
    /// Restart the device once `delay` has passed. Returns immediately.
    fn schedule_restart(&self, delay: Duration);
}

/// Status display.
pub trait StatusSink: Send + Sync {
    /// Show `text` to the user.
    fn show(&self, text: &str);
}

/// Host restart: exits the process after the delay.
///
/// A supervisor (or the developer) starts it again.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitRestarter;

impl Restarter for ExitRestarter {
    fn schedule_restart(&self, delay: Duration) {
        warn!("Restarting in {:?}", delay);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            info!("Restarting now");
            std::process::exit(0);
        });
    }
}

/// Status display that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn show(&self, text: &str) {
        info!("[status] {}", text);
    }
}

/// Errors from radio and provisioning-listener commands.
#[derive(Debug)]
pub enum RadioError {
    /// A command was rejected.
    Command {
        op: &'static str,
        reason: String,
    },
    /// Association info was requested while not associated.
    NotAssociated,
    /// ESP-IDF error.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl RadioError {
    pub(crate) fn command(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Command {
            op,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command { op, reason } => write!(f, "{} failed: {}", op, reason),
            Self::NotAssociated => write!(f, "not associated"),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "ESP error: {:?}", e),
        }
    }
}

impl std::error::Error for RadioError {}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for RadioError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}

/// Errors surfaced by [`ConnectionManager`] and [`ProvisioningSession`].
#[derive(Debug)]
pub enum WifiError {
    /// The credential table could not be read or updated.
    Storage(StorageError),
    /// A radio command failed.
    Radio(RadioError),
    /// The flow was started with out-of-range tunables.
    InvalidConfig(ConfigError),
    /// The operation needs an established connection.
    NotConnected,
    /// The wait was cancelled.
    Cancelled,
    /// The event source closed before an outcome was reached.
    EventSourceClosed,
}

impl std::fmt::Display for WifiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Radio(e) => write!(f, "radio error: {}", e),
            Self::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
            Self::NotConnected => write!(f, "not connected"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::EventSourceClosed => write!(f, "event source closed"),
        }
    }
}

impl std::error::Error for WifiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Radio(e) => Some(e),
            Self::InvalidConfig(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for WifiError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<RadioError> for WifiError {
    fn from(e: RadioError) -> Self {
        Self::Radio(e)
    }
}

impl From<ConfigError> for WifiError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfig(e)
    }
}
