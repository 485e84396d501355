//! Key-value persistence for host (development) builds.
//!
//! Stores all keys in a single JSON file so credentials persist across runs.
//! Uses `~/.wifi-station-esp32/credentials.json` by default, or the path in
//! `WIFI_STATION_STORE`.
//!
//! # Usage
//!
//! ```ignore
//! use wifi_station_esp32::storage::{default_store_path, FileStore};
//!
//! let store = FileStore::open(&default_store_path()?)?;
//! ```

use super::{KvStore, MemoryStore, StorageError, StoredValue};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable overriding the store location.
pub const ENV_STORE_PATH: &str = "WIFI_STATION_STORE";

/// Get the store file path.
///
/// Returns `$WIFI_STATION_STORE` if set, else
/// `~/.wifi-station-esp32/credentials.json`.
pub fn default_store_path() -> io::Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_STORE_PATH) {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".wifi-station-esp32")
        .join("credentials.json"))
}

/// JSON-file backed key-value store.
///
/// Writes are staged in memory and reach the file on
/// [`commit`](KvStore::commit), which replaces the file atomically.
pub struct FileStore {
    path: PathBuf,
    staged: MemoryStore,
    dirty: bool,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let entries = match fs::read_to_string(path) {
            Ok(json) => {
                debug!("Loaded store from {:?}", path);
                serde_json::from_str::<BTreeMap<String, StoredValue>>(&json)
                    .map_err(|e| StorageError::Open(format!("{:?}: {}", path, e)))?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No store file at {:?}, starting empty", path);
                BTreeMap::new()
            }
            Err(e) => return Err(StorageError::Open(format!("{:?}: {}", path, e))),
        };

        Ok(Self {
            path: path.to_path_buf(),
            staged: MemoryStore::from_entries(entries),
            dirty: false,
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for FileStore {
    fn get_u8(&self, key: &str) -> Result<Option<u8>, StorageError> {
        self.staged.get_u8(key)
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError> {
        self.staged.set_u8(key, value)?;
        self.dirty = true;
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StorageError> {
        self.staged.get_i32(key)
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        self.staged.set_i32(key, value)?;
        self.dirty = true;
        Ok(())
    }

    fn get_str(&self, key: &str, max_len: usize) -> Result<Option<String>, StorageError> {
        self.staged.get_str(key, max_len)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.staged.set_str(key, value)?;
        self.dirty = true;
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<bool, StorageError> {
        let existed = self.staged.erase(key)?;
        self.dirty |= existed;
        Ok(existed)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }

        // Create parent directory if needed
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self.staged.entries())
            .map_err(|e| StorageError::Commit(e.to_string()))?;

        // Write next to the target, then rename over it so a crash leaves
        // either the old or the new file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;

        // Verify write by reading back
        let read_back = fs::read_to_string(&self.path)?;
        if read_back != json {
            return Err(StorageError::Commit(format!(
                "verification failed: wrote {} bytes, read {} bytes",
                json.len(),
                read_back.len()
            )));
        }

        self.dirty = false;
        debug!("Store committed to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test files even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_store_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("wifi-station-test-{}-{}.json", pid, id))
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let path = unique_store_path();
        let store = FileStore::open(&path).expect("Failed to open");
        assert_eq!(store.get_u8("wifi_flag0").unwrap(), None);
        assert!(!path.exists(), "open must not create the file");
    }

    #[test]
    fn test_commit_persists_across_reopen() {
        let path = unique_store_path();

        let mut store = FileStore::open(&path).expect("Failed to open");
        store.set_u8("wifi_flag0", 1).unwrap();
        store.set_str("ssid0", "Home").unwrap();
        store.set_i32("connect_cnt0", -2).unwrap();
        store.commit().expect("Failed to commit");

        let reopened = FileStore::open(&path).expect("Failed to reopen");
        assert_eq!(reopened.get_u8("wifi_flag0").unwrap(), Some(1));
        assert_eq!(
            reopened.get_str("ssid0", 32).unwrap().as_deref(),
            Some("Home")
        );
        assert_eq!(reopened.get_i32("connect_cnt0").unwrap(), Some(-2));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_uncommitted_writes_are_lost() {
        let path = unique_store_path();

        let mut store = FileStore::open(&path).expect("Failed to open");
        store.set_u8("wifi_flag0", 1).unwrap();
        store.commit().unwrap();
        store.set_str("ssid0", "Home").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).expect("Failed to reopen");
        assert_eq!(reopened.get_u8("wifi_flag0").unwrap(), Some(1));
        assert_eq!(reopened.get_str("ssid0", 32).unwrap(), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_erase_persists() {
        let path = unique_store_path();

        let mut store = FileStore::open(&path).expect("Failed to open");
        store.set_str("psw0", "secret12").unwrap();
        store.commit().unwrap();
        assert!(store.erase("psw0").unwrap());
        store.commit().unwrap();

        let reopened = FileStore::open(&path).expect("Failed to reopen");
        assert_eq!(reopened.get_str("psw0", 64).unwrap(), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_fails_to_open() {
        let path = unique_store_path();
        fs::write(&path, "not json").unwrap();

        assert!(matches!(FileStore::open(&path), Err(StorageError::Open(_))));

        let _ = fs::remove_file(&path);
    }
}
