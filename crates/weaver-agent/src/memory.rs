use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use weaver_core::error::{Result, WeaverError};

/// The run's keyed working-data store.
///
/// Cloning yields another handle to the same underlying map. Keys are never
/// deleted during a run; writes overwrite.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `data`.
    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn write(&self, key: impl Into<String>, value: Value) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Snapshot of every key/value pair.
    pub fn read_all(&self) -> HashMap<String, Value> {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Merge `entries` into the store (used when restoring a session).
    pub fn extend(&self, entries: HashMap<String, Value>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(entries);
    }

    /// Approximate footprint of the stored values, in serialized bytes.
    pub fn footprint_bytes(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum()
    }

    /// A view limited to `read_keys` / `write_keys` that still mutates this store.
    pub fn with_permissions<R, W>(&self, owner: impl Into<String>, read_keys: R, write_keys: W) -> ScopedMemory
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        ScopedMemory {
            store: self.clone(),
            owner: owner.into(),
            read_keys: read_keys.into_iter().map(Into::into).collect(),
            write_keys: write_keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Capability-checked view over a [`SharedMemory`].
///
/// Reads outside `read_keys` return `None`; writes outside `write_keys` fail.
#[derive(Debug, Clone)]
pub struct ScopedMemory {
    store: SharedMemory,
    owner: String,
    read_keys: HashSet<String>,
    write_keys: HashSet<String>,
}

impl ScopedMemory {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn can_read(&self, key: &str) -> bool {
        self.read_keys.contains(key)
    }

    pub fn can_write(&self, key: &str) -> bool {
        self.write_keys.contains(key)
    }

    pub fn read_keys(&self) -> impl Iterator<Item = &str> {
        self.read_keys.iter().map(|s| s.as_str())
    }

    pub fn write_keys(&self) -> impl Iterator<Item = &str> {
        self.write_keys.iter().map(|s| s.as_str())
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        if !self.can_read(key) {
            return None;
        }
        self.store.read(key)
    }

    pub fn write(&self, key: &str, value: Value) -> Result<()> {
        if !self.can_write(key) {
            return Err(WeaverError::MemoryPermission {
                node: self.owner.clone(),
                key: key.to_string(),
            });
        }
        self.store.write(key, value);
        Ok(())
    }

    /// Every readable key that currently holds a value.
    pub fn read_all(&self) -> HashMap<String, Value> {
        self.store
            .read_all()
            .into_iter()
            .filter(|(k, _)| self.can_read(k))
            .collect()
    }
}
