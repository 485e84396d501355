//! Network credential, station status and utility commands.
//!
//! Plain data with no driver dependencies, so the credential table and both
//! state machines can be exercised on the host.
//!
//! # Example
//!
//! ```
//! use wifi_station_esp32::config::{ConfigCommand, Credential};
//!
//! let credential = Credential::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!credential.is_open());
//!
//! let cmd: ConfigCommand = "list".parse().unwrap();
//! assert_eq!(cmd, ConfigCommand::List);
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Longest SSID the radio accepts, in bytes.
pub const MAX_SSID_LEN: usize = 32;

/// Longest password the credential table stores, in bytes.
pub const MAX_PASSWORD_LEN: usize = 64;

/// SSID and password of one network.
///
/// The password is zeroed when the credential is dropped and never shows up
/// in `Debug` output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub ssid: String,
    /// Empty for open networks.
    pub password: String,
}

impl Credential {
    /// Build a credential, rejecting anything the table cannot hold.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let credential = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        credential.validate()?;
        Ok(credential)
    }

    /// Credential for a network without a password.
    pub fn open(ssid: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(ssid, String::new())
    }

    /// Check the SSID and password against the storage bounds.
    ///
    /// There is no minimum password length: smart-config delivers WEP keys
    /// and open networks as well as WPA passphrases.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.ssid.len(), self.password.len()) {
            (0, _) => Err(ConfigError::SsidEmpty),
            (len, _) if len > MAX_SSID_LEN => Err(ConfigError::SsidTooLong {
                len,
                max: MAX_SSID_LEN,
            }),
            (_, len) if len > MAX_PASSWORD_LEN => Err(ConfigError::PasswordTooLong {
                len,
                max: MAX_PASSWORD_LEN,
            }),
            _ => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("ssid", &self.ssid)
            .field("password", &if self.is_open() { "" } else { "****" })
            .finish()
    }
}

/// Station status as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiStatus {
    /// The credential table is empty.
    Unconfigured,
    /// Scanning for or associating with a known network.
    Connecting,
    Connected { ip: String },
    Failed { reason: String },
}

impl WifiStatus {
    /// Convert status to the short form shown on the status display.
    pub fn to_status_string(&self) -> String {
        match self {
            Self::Unconfigured => "unconfigured".to_string(),
            Self::Connecting => "connecting".to_string(),
            Self::Connected { ip } => format!("connected:{}", ip),
            Self::Failed { reason } => format!("failed:{}", reason),
        }
    }

    /// Parse the short form back.
    pub fn from_status_string(s: &str) -> Result<Self, ConfigError> {
        match s.split_once(':') {
            None if s == "unconfigured" => Ok(Self::Unconfigured),
            None if s == "connecting" => Ok(Self::Connecting),
            Some(("connected", ip)) => Ok(Self::Connected { ip: ip.to_string() }),
            Some(("failed", reason)) => Ok(Self::Failed {
                reason: reason.to_string(),
            }),
            _ => Err(ConfigError::InvalidFormat(format!("unknown status: {}", s))),
        }
    }
}

impl fmt::Display for WifiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_status_string())
    }
}

/// Commands understood by the `configure-wifi` utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Store a credential, evicting the weakest slot if all are taken.
    Add,
    /// Print the stored slots.
    List,
    /// Delete the credential in a given slot.
    Forget,
}

impl ConfigCommand {
    /// Convert command to its command-line spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::List => "list",
            Self::Forget => "forget",
        }
    }
}

impl std::str::FromStr for ConfigCommand {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "list" => Ok(Self::List),
            "forget" => Ok(Self::Forget),
            _ => Err(ConfigError::UnknownCommand(s.to_string())),
        }
    }
}

impl fmt::Display for ConfigCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected credentials, commands and tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    SsidEmpty,
    SsidTooLong { len: usize, max: usize },
    PasswordTooLong { len: usize, max: usize },
    /// A status string did not parse.
    InvalidFormat(String),
    UnknownCommand(String),
    /// A tunable is out of its allowed range.
    InvalidSetting(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
            Self::InvalidSetting(msg) => write!(f, "invalid setting: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // ==================== Credential Tests ====================

    #[test]
    fn test_valid_credential() {
        let credential = Credential::new("TestNetwork", "password123").unwrap();
        assert_eq!(credential.ssid, "TestNetwork");
        assert_eq!(credential.password, "password123");
        assert!(credential.validate().is_ok());
    }

    #[test]
    fn test_open_network() {
        let credential = Credential::open("OpenNetwork").unwrap();
        assert!(credential.is_open());
        assert!(credential.validate().is_ok());
    }

    #[test]
    fn test_empty_ssid() {
        let result = Credential::new("", "password123");
        assert_eq!(result, Err(ConfigError::SsidEmpty));
    }

    #[test]
    fn test_ssid_too_long() {
        let result = Credential::new("a".repeat(33), "password123");
        assert!(matches!(
            result,
            Err(ConfigError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_ssid_max_length() {
        let credential = Credential::new("a".repeat(32), "password123").unwrap();
        assert!(credential.validate().is_ok());
    }

    #[test]
    fn test_short_password_accepted() {
        // WEP-40 keys are five characters
        assert!(Credential::new("Legacy", "abcde").is_ok());
    }

    #[test]
    fn test_password_too_long() {
        let result = Credential::new("TestNetwork", "a".repeat(65));
        assert!(matches!(result, Err(ConfigError::PasswordTooLong { .. })));
    }

    #[test]
    fn test_password_max_length() {
        let credential = Credential::new("TestNetwork", "a".repeat(64)).unwrap();
        assert!(credential.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential::new("Home", "hunter22").unwrap();
        let debug = format!("{:?}", credential);
        assert!(debug.contains("Home"));
        assert!(!debug.contains("hunter22"));
    }

    // ==================== WifiStatus Tests ====================

    #[test]
    fn test_status_strings() {
        assert_eq!(WifiStatus::Unconfigured.to_status_string(), "unconfigured");
        assert_eq!(WifiStatus::Connecting.to_status_string(), "connecting");
        let connected = WifiStatus::Connected {
            ip: "192.168.1.100".to_string(),
        };
        assert_eq!(connected.to_string(), "connected:192.168.1.100");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            WifiStatus::from_status_string("failed:no visible network").unwrap(),
            WifiStatus::Failed {
                reason: "no visible network".to_string()
            }
        );
        assert_eq!(
            WifiStatus::from_status_string("connecting").unwrap(),
            WifiStatus::Connecting
        );
        assert!(matches!(
            WifiStatus::from_status_string("bogus"),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    // ==================== ConfigCommand Tests ====================

    #[test]
    fn test_command_parse() {
        assert_eq!(ConfigCommand::from_str("add").unwrap(), ConfigCommand::Add);
        assert_eq!(ConfigCommand::from_str("LIST").unwrap(), ConfigCommand::List);
        assert_eq!(
            ConfigCommand::from_str("  Forget  ").unwrap(),
            ConfigCommand::Forget
        );
    }

    #[test]
    fn test_command_unknown() {
        let result = ConfigCommand::from_str("reboot");
        assert!(matches!(result, Err(ConfigError::UnknownCommand(_))));
    }

    #[test]
    fn test_command_as_str() {
        assert_eq!(ConfigCommand::Add.as_str(), "add");
        assert_eq!(ConfigCommand::List.as_str(), "list");
        assert_eq!(ConfigCommand::Forget.to_string(), "forget");
    }
}
