//! Persistent credential table with score-based eviction.
//!
//! The table holds exactly [`SLOT_COUNT`] slots. Each slot carries a score
//! that rises on successful connects and falls on failures; a slot whose
//! score drops below [`EVICTION_THRESHOLD`] is deleted.
//!
//! # Storage layout
//!
//! For slot `N` in `0..3`:
//!
//! | key              | type | meaning                |
//! |------------------|------|------------------------|
//! | `wifi_flag{N}`   | u8   | 1 if occupied          |
//! | `ssid{N}`        | str  | SSID, at most 32 bytes |
//! | `psw{N}`         | str  | password, at most 64   |
//! | `connect_cnt{N}` | i32  | score                  |
//!
//! # Example
//!
//! ```
//! use wifi_station_esp32::config::Credential;
//! use wifi_station_esp32::credentials::CredentialStore;
//! use wifi_station_esp32::storage::MemoryStore;
//!
//! let mut store = CredentialStore::open(MemoryStore::new());
//! assert!(!store.load().unwrap());
//!
//! let home = Credential::new("Home", "password123").unwrap();
//! let index = store.find_slot_for_write(&home.ssid);
//! store.write(index, &home).unwrap();
//! assert!(store.has_known_networks());
//! ```

use crate::config::{ConfigError, Credential, MAX_PASSWORD_LEN, MAX_SSID_LEN};
use crate::storage::{KvStore, StorageError};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of credential slots.
pub const SLOT_COUNT: usize = 3;

/// A slot is deleted once its score falls below this value.
pub const EVICTION_THRESHOLD: i32 = -3;

fn flag_key(index: usize) -> String {
    format!("wifi_flag{}", index)
}

fn ssid_key(index: usize) -> String {
    format!("ssid{}", index)
}

fn password_key(index: usize) -> String {
    format!("psw{}", index)
}

fn score_key(index: usize) -> String {
    format!("connect_cnt{}", index)
}

/// Storage error for a credential that cannot be stored in slot `index`.
fn rejected(index: usize, e: ConfigError) -> StorageError {
    match e {
        ConfigError::SsidTooLong { len, max } => StorageError::ValueTooLong {
            key: ssid_key(index),
            len,
            max,
        },
        ConfigError::PasswordTooLong { len, max } => StorageError::ValueTooLong {
            key: password_key(index),
            len,
            max,
        },
        other => StorageError::Write {
            key: ssid_key(index),
            reason: other.to_string(),
        },
    }
}

/// One entry of the credential table.
///
/// An unoccupied slot has no credential and a score of 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSlot {
    /// Stored credential, `None` if the slot is free.
    pub credential: Option<Credential>,
    /// Success/failure score.
    pub score: i32,
}

impl CredentialSlot {
    fn occupied(credential: Credential, score: i32) -> Self {
        Self {
            credential: Some(credential),
            score,
        }
    }

    /// Check whether the slot holds a credential.
    pub fn is_occupied(&self) -> bool {
        self.credential.is_some()
    }

    /// SSID of the stored credential.
    pub fn ssid(&self) -> Option<&str> {
        self.credential.as_ref().map(|c| c.ssid.as_str())
    }
}

/// Result of reporting a connect outcome for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreUpdate {
    /// The slot keeps its credential with the new score.
    Scored(i32),
    /// The score fell below [`EVICTION_THRESHOLD`] and the slot was deleted.
    Evicted,
}

/// Credential table backed by durable key-value storage.
pub struct CredentialStore<S: KvStore> {
    storage: S,
    slots: [CredentialSlot; SLOT_COUNT],
}

/// Credential store shared between the caller and the event dispatchers.
pub type SharedStore<S> = Arc<Mutex<CredentialStore<S>>>;

/// Lock a shared store.
///
/// A panic while holding the lock cannot leave the table half-updated (the
/// in-memory slots are only replaced after storage succeeds), so a poisoned
/// lock is taken over rather than propagated.
pub fn lock<S: KvStore>(store: &SharedStore<S>) -> MutexGuard<'_, CredentialStore<S>> {
    store
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: KvStore> CredentialStore<S> {
    /// Wrap a storage backend. All slots start unoccupied until [`load`](Self::load).
    pub fn open(storage: S) -> Self {
        Self {
            storage,
            slots: Default::default(),
        }
    }

    /// Move the store behind a mutex for sharing.
    pub fn shared(self) -> SharedStore<S> {
        Arc::new(Mutex::new(self))
    }

    /// Read all slots from storage.
    ///
    /// Slots without a presence flag are backfilled with defaults. A slot
    /// flagged occupied whose SSID is empty, or whose fields exceed their
    /// bounds, is treated as unoccupied and repaired in storage.
    ///
    /// Returns `true` if at least one slot is occupied.
    pub fn load(&mut self) -> Result<bool, StorageError> {
        for index in 0..SLOT_COUNT {
            self.slots[index] = self.load_slot(index)?;
        }
        let occupied = self.occupied();
        info!("Loaded {} stored network(s)", occupied);
        Ok(occupied > 0)
    }

    fn load_slot(&mut self, index: usize) -> Result<CredentialSlot, StorageError> {
        match self.storage.get_u8(&flag_key(index))? {
            None => {
                debug!("Slot {} has no flag, writing defaults", index);
                self.storage.set_u8(&flag_key(index), 0)?;
                self.storage.set_i32(&score_key(index), 0)?;
                self.storage.commit()?;
                return Ok(CredentialSlot::default());
            }
            Some(0) => return Ok(CredentialSlot::default()),
            Some(_) => {}
        }

        let ssid = match self.storage.get_str(&ssid_key(index), MAX_SSID_LEN) {
            Ok(ssid) => ssid.unwrap_or_default(),
            Err(StorageError::ValueTooLong { len, max, .. }) => {
                warn!("Slot {} SSID too long ({} > {})", index, len, max);
                return self.repair(index);
            }
            Err(e) => return Err(e),
        };
        let password = match self.storage.get_str(&password_key(index), MAX_PASSWORD_LEN) {
            Ok(password) => password.unwrap_or_default(),
            Err(StorageError::ValueTooLong { len, max, .. }) => {
                warn!("Slot {} password too long ({} > {})", index, len, max);
                return self.repair(index);
            }
            Err(e) => return Err(e),
        };

        if ssid.is_empty() {
            warn!("Slot {} flagged occupied but has no SSID", index);
            return self.repair(index);
        }

        let credential = match Credential::new(ssid, password) {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Slot {} holds an invalid credential: {}", index, e);
                return self.repair(index);
            }
        };
        let score = self.storage.get_i32(&score_key(index))?.unwrap_or(0);
        debug!(
            "Slot {}: {} (score {})",
            index, credential.ssid, score
        );
        Ok(CredentialSlot::occupied(credential, score))
    }

    fn repair(&mut self, index: usize) -> Result<CredentialSlot, StorageError> {
        self.clear_slot(index)?;
        Ok(CredentialSlot::default())
    }

    /// Pick the slot a new credential for `ssid` should be written to.
    ///
    /// Evaluated in slot order: the first free slot, else the first slot
    /// already holding `ssid`, else the occupied slot with the lowest score
    /// (earliest index on ties).
    pub fn find_slot_for_write(&self, ssid: &str) -> usize {
        let mut weakest: Option<usize> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            match &slot.credential {
                None => return index,
                Some(credential) if credential.ssid == ssid => return index,
                Some(_) => {
                    if weakest.map_or(true, |w| slot.score < self.slots[w].score) {
                        weakest = Some(index);
                    }
                }
            }
        }
        weakest.unwrap_or(0)
    }

    /// Store `credential` in slot `index` with a fresh score of 0.
    ///
    /// An occupied slot is unflagged first and the flag is set last, so an
    /// interrupted write leaves the slot unoccupied rather than flagged with
    /// mixed fields.
    pub fn write(&mut self, index: usize, credential: &Credential) -> Result<(), StorageError> {
        if index >= SLOT_COUNT {
            return Err(StorageError::InvalidSlot(index));
        }
        credential.validate().map_err(|e| rejected(index, e))?;

        if self.slots[index].is_occupied() {
            self.storage.set_u8(&flag_key(index), 0)?;
            self.storage.commit()?;
            self.slots[index] = CredentialSlot::default();
        }

        self.storage.set_str(&ssid_key(index), &credential.ssid)?;
        self.storage.set_str(&password_key(index), &credential.password)?;
        self.storage.set_i32(&score_key(index), 0)?;
        self.storage.commit()?;
        self.storage.set_u8(&flag_key(index), 1)?;
        self.storage.commit()?;

        self.slots[index] = CredentialSlot::occupied(credential.clone(), 0);
        info!("Stored network {} in slot {}", credential.ssid, index);
        Ok(())
    }

    /// Record a connect success or failure for slot `index`.
    ///
    /// Success resets a negative score to 0 before incrementing; failure
    /// resets a positive score to 0 before decrementing. A score below
    /// [`EVICTION_THRESHOLD`] deletes the slot.
    pub fn report_outcome(
        &mut self,
        index: usize,
        success: bool,
    ) -> Result<ScoreUpdate, StorageError> {
        let current = match self.slots.get(index) {
            Some(slot) if slot.is_occupied() => slot.score,
            _ => return Err(StorageError::InvalidSlot(index)),
        };

        let score = if success {
            current.max(0).saturating_add(1)
        } else {
            current.min(0).saturating_sub(1)
        };

        if score < EVICTION_THRESHOLD {
            warn!(
                "Evicting {} from slot {} (score {})",
                self.slots[index].ssid().unwrap_or_default(),
                index,
                score
            );
            self.clear_slot(index)?;
            return Ok(ScoreUpdate::Evicted);
        }

        self.storage.set_i32(&score_key(index), score)?;
        self.storage.commit()?;
        self.slots[index].score = score;
        debug!("Slot {} score {} -> {}", index, current, score);
        Ok(ScoreUpdate::Scored(score))
    }

    /// Delete the credential in slot `index`.
    ///
    /// Returns `false` if the slot was already free.
    pub fn forget(&mut self, index: usize) -> Result<bool, StorageError> {
        if index >= SLOT_COUNT {
            return Err(StorageError::InvalidSlot(index));
        }
        if !self.slots[index].is_occupied() {
            return Ok(false);
        }
        info!(
            "Forgetting {} in slot {}",
            self.slots[index].ssid().unwrap_or_default(),
            index
        );
        self.clear_slot(index)?;
        Ok(true)
    }

    /// Flag first, so a crash mid-way leaves the slot unoccupied.
    fn clear_slot(&mut self, index: usize) -> Result<(), StorageError> {
        self.storage.set_u8(&flag_key(index), 0)?;
        self.storage.set_i32(&score_key(index), 0)?;
        self.storage.erase(&ssid_key(index))?;
        self.storage.erase(&password_key(index))?;
        self.storage.commit()?;
        self.slots[index] = CredentialSlot::default();
        Ok(())
    }

    /// Snapshot of all slots in index order.
    pub fn slots(&self) -> Vec<CredentialSlot> {
        self.slots.to_vec()
    }

    /// Slot at `index`.
    pub fn slot(&self, index: usize) -> Option<&CredentialSlot> {
        self.slots.get(index)
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_occupied()).count()
    }

    /// Check whether any credential is stored.
    pub fn has_known_networks(&self) -> bool {
        self.occupied() > 0
    }

    /// The storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Mutable access to the storage backend.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
