use std::collections::BTreeMap;

use thiserror::Error;

use crate::{config::StorageConfig, id::Id};

/// The local key/value persistence the core depends on but does not own.
/// A real node would back this with disk storage; the core only needs
/// `has`/`get`/`put` with first-store-wins semantics (§1, §9: no
/// replication, republish or TTL in this spec).
pub trait ValueStore: Send {
    fn has(&self, key: &Id) -> bool;

    fn get(&self, key: &Id) -> Option<Vec<u8>>;

    /// Inserts `value` under `key` if and only if `key` is absent. Returns
    /// `Ok(true)` if the value was newly stored, `Ok(false)` if a value was
    /// already present (the write is silently ignored, not an error).
    fn put(&mut self, key: Id, value: Vec<u8>) -> Result<bool, StorageError>;
}

impl ValueStore for Box<dyn ValueStore> {
    fn has(&self, key: &Id) -> bool {
        (**self).has(key)
    }

    fn get(&self, key: &Id) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn put(&mut self, key: Id, value: Vec<u8>) -> Result<bool, StorageError> {
        (**self).put(key, value)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    #[error("value exceeds the configured maximum size")]
    ValueTooLarge,
    #[error("too many entries stored")]
    TooManyEntries,
}

/// Reference, ordered-map value store (`§1`: "a simple ordered key→value map
/// with has/get/put"). Suitable for tests and for the demo server binary;
/// a production deployment is expected to swap in a persistent
/// implementation of [`ValueStore`].
#[derive(Debug, Default)]
pub struct InMemoryValueStore {
    config: StorageConfig,
    entries: BTreeMap<Id, Vec<u8>>,
}

impl InMemoryValueStore {
    pub fn new(config: StorageConfig) -> Self {
        InMemoryValueStore {
            config,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ValueStore for InMemoryValueStore {
    fn has(&self, key: &Id) -> bool {
        self.entries.contains_key(key)
    }

    fn get(&self, key: &Id) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: Id, value: Vec<u8>) -> Result<bool, StorageError> {
        if value.len() > self.config.max_value_size {
            return Err(StorageError::ValueTooLarge);
        }
        if self.entries.contains_key(&key) {
            // First-store-wins: accepted, but silently a no-op.
            return Ok(false);
        }
        if self.entries.len() >= self.config.max_entries {
            return Err(StorageError::TooManyEntries);
        }
        self.entries.insert(key, value);
        Ok(true)
    }
}
