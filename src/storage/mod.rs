//! Durable key-value storage.
//!
//! The credential table is persisted through the [`KvStore`] trait, which
//! mirrors the typed get/set/erase/commit surface of ESP-IDF's NVS.
//!
//! # Backends
//!
//! - [`MemoryStore`] - in-memory map with fault injection (tests, simulation)
//! - [`FileStore`] - JSON file in the user's home directory (host builds)
//! - [`NvsStore`] - ESP32 Non-Volatile Storage (ESP32 only)
//!
//! Closing a store is dropping it.

mod memory;

#[cfg(not(target_os = "espidf"))]
mod file;

#[cfg(feature = "esp32")]
mod nvs;

pub use memory::MemoryStore;

#[cfg(not(target_os = "espidf"))]
pub use file::{default_store_path, FileStore, ENV_STORE_PATH};

#[cfg(feature = "esp32")]
pub use nvs::{init_nvs, NvsStore, NVS_NAMESPACE};

#[cfg(not(target_os = "espidf"))]
use serde::{Deserialize, Serialize};

/// A typed value as held by the in-memory and file backends.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    not(target_os = "espidf"),
    derive(Serialize, Deserialize),
    serde(tag = "type", content = "value", rename_all = "snake_case")
)]
pub enum StoredValue {
    U8(u8),
    I32(i32),
    Str(String),
}

impl StoredValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "u8",
            Self::I32(_) => "i32",
            Self::Str(_) => "str",
        }
    }
}

/// Typed key-value storage with explicit commits.
///
/// Writes may be buffered until [`commit`](KvStore::commit); a missing key
/// reads as `Ok(None)`.
pub trait KvStore: Send {
    /// Read a byte value.
    fn get_u8(&self, key: &str) -> Result<Option<u8>, StorageError>;

    /// Write a byte value.
    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError>;

    /// Read a signed 32-bit value.
    fn get_i32(&self, key: &str) -> Result<Option<i32>, StorageError>;

    /// Write a signed 32-bit value.
    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError>;

    /// Read a string of at most `max_len` bytes.
    fn get_str(&self, key: &str, max_len: usize) -> Result<Option<String>, StorageError>;

    /// Write a string.
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Returns `true` if it existed.
    fn erase(&mut self, key: &str) -> Result<bool, StorageError>;

    /// Make all previous writes durable.
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// Errors from the storage layer.
#[derive(Debug)]
pub enum StorageError {
    /// The backing store could not be opened.
    Open(String),
    /// A key could not be read.
    Read { key: String, reason: String },
    /// A key could not be written or erased.
    Write { key: String, reason: String },
    /// Pending writes could not be made durable.
    Commit(String),
    /// A key holds a value of a different type.
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    /// A stored string exceeds the bound for its key.
    ValueTooLong { key: String, len: usize, max: usize },
    /// Slot index outside the credential table, or a slot without a credential.
    InvalidSlot(usize),
    /// File system error (host backend).
    Io(std::io::Error),
    /// ESP-IDF error.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(reason) => write!(f, "failed to open storage: {}", reason),
            Self::Read { key, reason } => write!(f, "failed to read {}: {}", key, reason),
            Self::Write { key, reason } => write!(f, "failed to write {}: {}", key, reason),
            Self::Commit(reason) => write!(f, "commit failed: {}", reason),
            Self::TypeMismatch {
                key,
                expected,
                found,
            } => write!(f, "{} holds {} (expected {})", key, found, expected),
            Self::ValueTooLong { key, len, max } => {
                write!(f, "{} too long: {} bytes (max {})", key, len, max)
            }
            Self::InvalidSlot(index) => write!(f, "no credential in slot {}", index),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "ESP error: {:?}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for StorageError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}
