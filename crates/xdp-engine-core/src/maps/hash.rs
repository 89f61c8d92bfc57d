// SPDX-License-Identifier: GPL-2.0

//! Bounded hash map store
//!
//! Entries are spread over a fixed number of shards, each behind its own
//! reader-writer lock. The entry count is global so that `max_entries` is
//! enforced exactly regardless of how keys hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::cell::ValueCell;
use super::UpdateMode;
use crate::core::error::MapError;
use crate::core::hash::hash_bytes;

const SHARDS: usize = 16;

type Shard = RwLock<HashMap<Box<[u8]>, Arc<ValueCell>>>;

/// Sharded hash table that fails with `Full` at capacity
#[derive(Debug)]
pub struct HashStore {
    shards: Box<[Shard]>,
    count: AtomicUsize,
    max_entries: usize,
    value_size: usize,
}

impl HashStore {
    /// Create an empty store
    pub fn new(value_size: usize, max_entries: usize) -> Self {
        let shards = (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            count: AtomicUsize::new(0),
            max_entries,
            value_size,
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[hash_bytes(key) as usize % SHARDS]
    }

    /// Shared cell for `key`
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<ValueCell>> {
        self.shard(key).read().get(key).cloned()
    }

    /// Insert or replace according to `mode`.
    ///
    /// Replacing installs a fresh cell; holders of the old cell keep seeing
    /// the old value.
    pub fn update(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> Result<(), MapError> {
        debug_assert_eq!(value.len(), self.value_size);
        let mut shard = self.shard(key).write();
        let cell = Arc::new(ValueCell::from_bytes(value));
        if let Some(slot) = shard.get_mut(key) {
            if mode == UpdateMode::CreateOnly {
                return Err(MapError::Exists);
            }
            *slot = cell;
            return Ok(());
        }
        if mode == UpdateMode::UpdateOnly {
            return Err(MapError::Missing);
        }
        let max = self.max_entries;
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| MapError::Full)?;
        shard.insert(key.into(), cell);
        Ok(())
    }

    /// Remove `key`
    pub fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.take(key).map(|_| ()).ok_or(MapError::Missing)
    }

    /// Remove `key`, returning its cell
    pub fn take(&self, key: &[u8]) -> Option<Arc<ValueCell>> {
        let cell = self.shard(key).write().remove(key)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(cell)
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.shards
            .iter()
            .flat_map(|s| s.read().keys().map(|k| k.to_vec()).collect::<Vec<_>>())
            .collect()
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_is_exact() {
        let h = HashStore::new(4, 3);
        for k in 0u32..3 {
            h.update(&k.to_le_bytes(), &[0; 4], UpdateMode::Upsert).unwrap();
        }
        assert_eq!(
            h.update(&9u32.to_le_bytes(), &[0; 4], UpdateMode::Upsert),
            Err(MapError::Full)
        );
        assert_eq!(h.len(), 3);
        // replacing an existing key still works at capacity
        h.update(&1u32.to_le_bytes(), &[1; 4], UpdateMode::UpdateOnly).unwrap();
        h.delete(&0u32.to_le_bytes()).unwrap();
        h.update(&9u32.to_le_bytes(), &[0; 4], UpdateMode::CreateOnly).unwrap();
    }

    #[test]
    fn test_modes() {
        let h = HashStore::new(1, 4);
        assert_eq!(h.update(b"k", &[1], UpdateMode::UpdateOnly), Err(MapError::Missing));
        h.update(b"k", &[1], UpdateMode::CreateOnly).unwrap();
        assert_eq!(h.update(b"k", &[2], UpdateMode::CreateOnly), Err(MapError::Exists));
        assert_eq!(h.delete(b"x"), Err(MapError::Missing));
    }

    #[test]
    fn test_old_cell_survives_replace() {
        let h = HashStore::new(1, 4);
        h.update(b"k", &[1], UpdateMode::Upsert).unwrap();
        let old = h.lookup(b"k").unwrap();
        h.update(b"k", &[2], UpdateMode::Upsert).unwrap();
        assert_eq!(old.to_vec(), vec![1]);
        assert_eq!(h.lookup(b"k").unwrap().to_vec(), vec![2]);
    }
}
