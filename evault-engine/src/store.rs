//! # In-Memory Store
//!
//! Values and expirations live in two maps so keys without a TTL cost
//! nothing extra. Each map has its own `RwLock`.
//!
//! ## Lock Order
//!
//! Any path that needs both maps takes `values` first, then `expiries`.
//! Paths that observe an expiry and then mutate (expiry-on-read, `SET`,
//! `DEL`, transaction batches) hold both write locks through a
//! [`StoreWriter`] for the whole sequence.
//!
//! Expiry is lazy: a dead key is removed only when a read or write touches it.

use std::time::{Duration, SystemTime};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockWriteGuard};

type Map<V> = HashMap<Bytes, V, RandomState>;

/// One key with its value and optional absolute expiration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub expires_at: Option<SystemTime>,
}

/// Concurrency-safe key/value map with a side index of expirations.
#[derive(Default)]
pub struct Store {
    values: RwLock<Map<Bytes>>,
    expiries: RwLock<Map<SystemTime>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires both write locks in the fixed order.
    pub fn write(&self) -> StoreWriter<'_> {
        let values = self.values.write();
        let expiries = self.expiries.write();
        StoreWriter { values, expiries }
    }

    /// Reads a key, removing it first if its expiry has passed.
    ///
    /// The common case only takes read locks; an expired key is re-checked
    /// under the write locks since another writer may have replaced it.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        {
            let values = self.values.read();
            let expiries = self.expiries.read();
            match expiries.get(key) {
                Some(&at) if is_elapsed(at, SystemTime::now()) => {}
                _ => return values.get(key).cloned(),
            }
        }
        self.write().get(key)
    }

    /// Stores `value` under `key`; a `ttl` sets the expiry, `None` clears it.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        self.write().set(key, value, ttl);
    }

    /// Removes a key. Returns true if a live key was removed.
    pub fn del(&self, key: &[u8]) -> bool {
        self.write().del(key)
    }

    /// Returns the expiry recorded for `key`, if any.
    pub fn expires_at(&self, key: &[u8]) -> Option<SystemTime> {
        self.expiries.read().get(key).copied()
    }

    /// Number of stored keys, including expired keys not yet touched.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies every entry under both read locks.
    pub fn snapshot(&self) -> Vec<StoredEntry> {
        let values = self.values.read();
        let expiries = self.expiries.read();
        values
            .iter()
            .map(|(key, value)| StoredEntry {
                key: key.clone(),
                value: value.clone(),
                expires_at: expiries.get(key).copied(),
            })
            .collect()
    }

    /// Inserts entries verbatim, keeping their absolute expirations.
    pub fn restore(&self, entries: impl IntoIterator<Item = StoredEntry>) {
        let mut writer = self.write();
        for entry in entries {
            writer.insert(entry);
        }
    }
}

/// Holds both write locks; every method sees and mutates a consistent pair.
pub struct StoreWriter<'a> {
    values: RwLockWriteGuard<'a, Map<Bytes>>,
    expiries: RwLockWriteGuard<'a, Map<SystemTime>>,
}

impl StoreWriter<'_> {
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        if self.purge_if_expired(key) {
            return None;
        }
        self.values.get(key).cloned()
    }

    pub fn set(&mut self, key: Bytes, value: Bytes, ttl: Option<Duration>) {
        // A TTL too large to represent is treated as no expiry.
        match ttl.and_then(|ttl| SystemTime::now().checked_add(ttl)) {
            Some(at) => {
                self.expiries.insert(key.clone(), at);
            }
            None => {
                self.expiries.remove(&key[..]);
            }
        }
        self.values.insert(key, value);
    }

    pub fn del(&mut self, key: &[u8]) -> bool {
        if self.purge_if_expired(key) {
            return false;
        }
        self.expiries.remove(key);
        self.values.remove(key).is_some()
    }

    /// Copies every live entry; expired ones are skipped, not purged.
    pub fn live_entries(&self) -> Vec<StoredEntry> {
        let now = SystemTime::now();
        self.values
            .iter()
            .filter_map(|(key, value)| {
                let expires_at = self.expiries.get(key).copied();
                match expires_at {
                    Some(at) if is_elapsed(at, now) => None,
                    _ => Some(StoredEntry {
                        key: key.clone(),
                        value: value.clone(),
                        expires_at,
                    }),
                }
            })
            .collect()
    }

    pub fn insert(&mut self, entry: StoredEntry) {
        match entry.expires_at {
            Some(at) => {
                self.expiries.insert(entry.key.clone(), at);
            }
            None => {
                self.expiries.remove(&entry.key[..]);
            }
        }
        self.values.insert(entry.key, entry.value);
    }

    fn purge_if_expired(&mut self, key: &[u8]) -> bool {
        match self.expiries.get(key) {
            Some(&at) if is_elapsed(at, SystemTime::now()) => {
                self.expiries.remove(key);
                self.values.remove(key);
                true
            }
            _ => false,
        }
    }
}

fn is_elapsed(at: SystemTime, now: SystemTime) -> bool {
    at <= now
}
