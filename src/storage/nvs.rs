//! ESP32 Non-Volatile Storage backend.
//!
//! Every credential key lives in the `wifi` namespace of the default NVS
//! partition, one typed entry per key.
//!
//! # Usage
//!
//! ```ignore
//! use wifi_station_esp32::storage::{init_nvs, NvsStore};
//!
//! let partition = EspDefaultNvsPartition::take()?;
//! let store = NvsStore::new(init_nvs(partition.clone())?);
//! ```

use super::{KvStore, StorageError};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_sys::EspError;
use log::debug;

/// NVS namespace holding the credential table.
pub const NVS_NAMESPACE: &str = "wifi";

/// Open (creating if needed) the credential namespace.
///
/// The default partition can only be taken once per boot; pass a clone of it
/// so the WiFi driver can share it.
pub fn init_nvs(partition: EspNvsPartition<NvsDefault>) -> Result<EspNvs<NvsDefault>, EspError> {
    EspNvs::new(partition, NVS_NAMESPACE, true)
}

/// [`KvStore`] backed by an open NVS namespace.
///
/// `esp-idf-svc` commits after every write, so [`commit`](KvStore::commit)
/// has nothing left to flush.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    /// Wrap an open namespace handle.
    pub fn new(nvs: EspNvs<NvsDefault>) -> Self {
        Self { nvs }
    }
}

fn read_error(key: &str, e: EspError) -> StorageError {
    StorageError::Read {
        key: key.to_string(),
        reason: format!("{:?}", e),
    }
}

fn write_error(key: &str, e: EspError) -> StorageError {
    StorageError::Write {
        key: key.to_string(),
        reason: format!("{:?}", e),
    }
}

impl KvStore for NvsStore {
    fn get_u8(&self, key: &str) -> Result<Option<u8>, StorageError> {
        self.nvs.get_u8(key).map_err(|e| read_error(key, e))
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError> {
        self.nvs.set_u8(key, value).map_err(|e| write_error(key, e))
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StorageError> {
        self.nvs.get_i32(key).map_err(|e| read_error(key, e))
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        self.nvs.set_i32(key, value).map_err(|e| write_error(key, e))
    }

    fn get_str(&self, key: &str, max_len: usize) -> Result<Option<String>, StorageError> {
        // Reported length includes the NUL terminator
        let stored = match self.nvs.str_len(key).map_err(|e| read_error(key, e))? {
            Some(len) => len.saturating_sub(1),
            None => return Ok(None),
        };
        if stored > max_len {
            return Err(StorageError::ValueTooLong {
                key: key.to_string(),
                len: stored,
                max: max_len,
            });
        }

        let mut buf = vec![0u8; max_len + 1];
        let value = self
            .nvs
            .get_str(key, &mut buf)
            .map_err(|e| read_error(key, e))?;
        Ok(value.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.nvs.set_str(key, value).map_err(|e| write_error(key, e))
    }

    fn erase(&mut self, key: &str) -> Result<bool, StorageError> {
        self.nvs.remove(key).map_err(|e| write_error(key, e))
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        debug!("NVS namespace {} committed", NVS_NAMESPACE);
        Ok(())
    }
}
