//! In-memory key-value store.
//!
//! Used by the simulator and by tests. Writes can be made to fail on demand
//! to exercise storage error paths.

use super::{KvStore, StorageError, StoredValue};
use std::collections::BTreeMap;

/// Key-value store held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, StoredValue>,
    fail_writes: bool,
    commits: usize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn from_entries(entries: BTreeMap<String, StoredValue>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    /// All stored entries, ordered by key.
    pub fn entries(&self) -> &BTreeMap<String, StoredValue> {
        &self.entries
    }

    /// Make every subsequent write, erase and commit fail (or succeed again).
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Raw access to a stored value.
    pub fn value(&self, key: &str) -> Option<&StoredValue> {
        self.entries.get(key)
    }

    /// Check whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    fn check_writable(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: "write failure injected".to_string(),
            });
        }
        Ok(())
    }

    fn mismatch(key: &str, expected: &'static str, found: &StoredValue) -> StorageError {
        StorageError::TypeMismatch {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }
}

impl KvStore for MemoryStore {
    fn get_u8(&self, key: &str) -> Result<Option<u8>, StorageError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StoredValue::U8(v)) => Ok(Some(*v)),
            Some(other) => Err(Self::mismatch(key, "u8", other)),
        }
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), StorageError> {
        self.check_writable(key)?;
        self.entries.insert(key.to_string(), StoredValue::U8(value));
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StorageError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StoredValue::I32(v)) => Ok(Some(*v)),
            Some(other) => Err(Self::mismatch(key, "i32", other)),
        }
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        self.check_writable(key)?;
        self.entries.insert(key.to_string(), StoredValue::I32(value));
        Ok(())
    }

    fn get_str(&self, key: &str, max_len: usize) -> Result<Option<String>, StorageError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StoredValue::Str(s)) if s.len() > max_len => Err(StorageError::ValueTooLong {
                key: key.to_string(),
                len: s.len(),
                max: max_len,
            }),
            Some(StoredValue::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(Self::mismatch(key, "str", other)),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_writable(key)?;
        self.entries
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<bool, StorageError> {
        self.check_writable(key)?;
        Ok(self.entries.remove(key).is_some())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Commit("write failure injected".to_string()));
        }
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_reads_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get_u8("wifi_flag0").unwrap(), None);
        assert_eq!(store.get_str("ssid0", 32).unwrap(), None);
    }

    #[test]
    fn test_typed_values() {
        let mut store = MemoryStore::new();
        store.set_u8("flag", 1).unwrap();
        store.set_i32("count", -2).unwrap();
        store.set_str("name", "Home").unwrap();

        assert_eq!(store.get_u8("flag").unwrap(), Some(1));
        assert_eq!(store.get_i32("count").unwrap(), Some(-2));
        assert_eq!(store.get_str("name", 32).unwrap().as_deref(), Some("Home"));
    }

    #[test]
    fn test_type_mismatch() {
        let mut store = MemoryStore::new();
        store.set_str("flag", "yes").unwrap();
        assert!(matches!(
            store.get_u8("flag"),
            Err(StorageError::TypeMismatch {
                expected: "u8",
                found: "str",
                ..
            })
        ));
    }

    #[test]
    fn test_string_bound_enforced_on_read() {
        let mut store = MemoryStore::new();
        store.set_str("ssid0", &"x".repeat(40)).unwrap();
        assert!(matches!(
            store.get_str("ssid0", 32),
            Err(StorageError::ValueTooLong { len: 40, max: 32, .. })
        ));
    }

    #[test]
    fn test_erase() {
        let mut store = MemoryStore::new();
        store.set_u8("flag", 1).unwrap();
        assert!(store.erase("flag").unwrap());
        assert!(!store.erase("flag").unwrap());
        assert!(!store.contains("flag"));
    }

    #[test]
    fn test_injected_failures() {
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.set_u8("flag", 1),
            Err(StorageError::Write { .. })
        ));
        assert!(matches!(store.commit(), Err(StorageError::Commit(_))));
        assert_eq!(store.commits(), 0);

        store.set_fail_writes(false);
        store.set_u8("flag", 1).unwrap();
        store.commit().unwrap();
        assert_eq!(store.commits(), 1);
    }
}
