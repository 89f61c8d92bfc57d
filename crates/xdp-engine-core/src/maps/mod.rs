// SPDX-License-Identifier: GPL-2.0

//! Map subsystem
//!
//! Maps are the only mutable state shared between packet programs, workers
//! and the control plane. Every map has a fixed schema; all accesses are
//! checked against it, from helpers and from the control plane alike.

pub mod array;
pub mod cell;
pub mod hash;
pub mod lru;
pub mod per_worker;
pub mod registry;
pub mod ringbuf;
pub mod typed;

use std::fmt;
use std::sync::Arc;

use crate::core::error::MapError;
use crate::core::types::{BPF_ANY, BPF_EXIST, BPF_NOEXIST};

pub use array::ArrayStore;
pub use cell::ValueCell;
pub use hash::HashStore;
pub use lru::LruStore;
pub use per_worker::PerWorkerStore;
pub use registry::MapSet;
pub use ringbuf::{Reservation, RingBufStore};
pub use typed::{Array, HashMap, LruHashMap, PerWorkerArray, Pod, RingBuffer};

/// Map kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// Bounded hash table, fails with `Full` at capacity
    Hash,
    /// Bounded hash table evicting the least recently used entry
    LruHash,
    /// Fixed-size array indexed by a 4-byte key
    Array,
    /// One array instance per worker, aggregated on read
    PerWorkerArray,
    /// Multi-producer single-consumer record queue
    RingBuffer,
}

impl MapKind {
    /// Lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            MapKind::Hash => "hash",
            MapKind::LruHash => "lru_hash",
            MapKind::Array => "array",
            MapKind::PerWorkerArray => "per_worker_array",
            MapKind::RingBuffer => "ringbuf",
        }
    }

    /// Whether entries can be deleted
    pub fn supports_delete(&self) -> bool {
        matches!(self, MapKind::Hash | MapKind::LruHash)
    }

    /// Whether lookup and update apply
    pub fn supports_lookup(&self) -> bool {
        !matches!(self, MapKind::RingBuffer)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapSchema {
    /// Map kind
    pub kind: MapKind,
    /// Key size in bytes (0 for ring buffers)
    pub key_size: u32,
    /// Value size in bytes (maximum record size for ring buffers)
    pub value_size: u32,
    /// Capacity (record slots for ring buffers)
    pub max_entries: u32,
}

/// Largest key or value the subsystem accepts
pub const MAX_MAP_VALUE_SIZE: u32 = 1 << 16;

impl MapSchema {
    /// Create a schema
    pub fn new(kind: MapKind, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self {
            kind,
            key_size,
            value_size,
            max_entries,
        }
    }

    /// A hash map schema
    pub fn hash(key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapKind::Hash, key_size, value_size, max_entries)
    }

    /// An LRU hash map schema
    pub fn lru_hash(key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapKind::LruHash, key_size, value_size, max_entries)
    }

    /// An array schema
    pub fn array(value_size: u32, max_entries: u32) -> Self {
        Self::new(MapKind::Array, 4, value_size, max_entries)
    }

    /// A per-worker array schema
    pub fn per_worker_array(value_size: u32, max_entries: u32) -> Self {
        Self::new(MapKind::PerWorkerArray, 4, value_size, max_entries)
    }

    /// A ring buffer schema
    pub fn ringbuf(record_size: u32, slots: u32) -> Self {
        Self::new(MapKind::RingBuffer, 0, record_size, slots)
    }

    /// Check the schema for consistency
    pub fn validate(&self) -> Result<(), MapError> {
        let bad = |msg: &str| Err(MapError::InvalidSchema(format!("{} map: {}", self.kind, msg)));
        if self.max_entries == 0 {
            return bad("max_entries must be non-zero");
        }
        if self.value_size == 0 || self.value_size > MAX_MAP_VALUE_SIZE {
            return bad("value_size out of range");
        }
        match self.kind {
            MapKind::Array | MapKind::PerWorkerArray if self.key_size != 4 => {
                bad("key must be exactly four bytes")
            }
            MapKind::RingBuffer if self.key_size != 0 => bad("ring buffers have no key"),
            MapKind::Hash | MapKind::LruHash
                if self.key_size == 0 || self.key_size > MAX_MAP_VALUE_SIZE =>
            {
                bad("key_size out of range")
            }
            _ => Ok(()),
        }
    }
}

/// How an insert treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdateMode {
    /// Create or replace
    #[default]
    Upsert,
    /// Fail with `Exists` if the key is present
    CreateOnly,
    /// Fail with `Missing` if the key is absent
    UpdateOnly,
}

impl UpdateMode {
    /// Decode helper flags
    pub fn from_flags(flags: u64) -> Option<Self> {
        match flags {
            BPF_ANY => Some(UpdateMode::Upsert),
            BPF_NOEXIST => Some(UpdateMode::CreateOnly),
            BPF_EXIST => Some(UpdateMode::UpdateOnly),
            _ => None,
        }
    }
}

/// Backing storage, one variant per kind
#[derive(Debug)]
pub enum MapStore {
    /// Hash map
    Hash(HashStore),
    /// LRU hash map
    LruHash(LruStore),
    /// Array
    Array(ArrayStore),
    /// Per-worker array
    PerWorkerArray(PerWorkerStore),
    /// Ring buffer
    RingBuffer(RingBufStore),
}

/// A named, typed map
#[derive(Debug)]
pub struct Map {
    name: String,
    schema: MapSchema,
    store: MapStore,
}

impl Map {
    /// Create a map; `workers` sizes per-worker arrays
    pub fn new(name: impl Into<String>, schema: MapSchema, workers: usize) -> Result<Self, MapError> {
        schema.validate()?;
        let value_size = schema.value_size as usize;
        let max = schema.max_entries as usize;
        let store = match schema.kind {
            MapKind::Hash => MapStore::Hash(HashStore::new(value_size, max)),
            MapKind::LruHash => MapStore::LruHash(LruStore::new(value_size, max)),
            MapKind::Array => MapStore::Array(ArrayStore::new(value_size, max)),
            MapKind::PerWorkerArray => {
                MapStore::PerWorkerArray(PerWorkerStore::new(workers.max(1), value_size, max))
            }
            MapKind::RingBuffer => MapStore::RingBuffer(RingBufStore::new(value_size, max)),
        };
        Ok(Self {
            name: name.into(),
            schema,
            store,
        })
    }

    /// Map name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map schema
    pub fn schema(&self) -> &MapSchema {
        &self.schema
    }

    /// Map kind
    pub fn kind(&self) -> MapKind {
        self.schema.kind
    }

    /// Backing store
    pub fn store(&self) -> &MapStore {
        &self.store
    }

    fn unsupported(&self, op: &'static str) -> MapError {
        MapError::Unsupported {
            kind: self.schema.kind.name(),
            op,
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), MapError> {
        if key.len() != self.schema.key_size as usize {
            return Err(MapError::KeySize {
                expected: self.schema.key_size as usize,
                got: key.len(),
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<(), MapError> {
        if value.len() != self.schema.value_size as usize {
            return Err(MapError::ValueSize {
                expected: self.schema.value_size as usize,
                got: value.len(),
            });
        }
        Ok(())
    }

    /// Look up the value cell a program on `worker` would see
    pub fn lookup_cell(&self, key: &[u8], worker: usize) -> Result<Option<Arc<ValueCell>>, MapError> {
        self.check_key(key)?;
        Ok(match &self.store {
            MapStore::Hash(h) => h.lookup(key),
            MapStore::LruHash(l) => l.lookup(key),
            MapStore::Array(a) => a.lookup(key),
            MapStore::PerWorkerArray(p) => p.worker(worker).and_then(|a| a.lookup(key)),
            MapStore::RingBuffer(_) => return Err(self.unsupported("lookup")),
        })
    }

    /// Copy out the value stored under `key`.
    ///
    /// Per-worker arrays return the lane-wise sum over all workers.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        if let MapStore::PerWorkerArray(p) = &self.store {
            self.check_key(key)?;
            return Ok(p.aggregate(key));
        }
        Ok(self.lookup_cell(key, 0)?.map(|c| c.to_vec()))
    }

    /// Insert or update an entry.
    ///
    /// Per-worker arrays write the value into every worker's copy.
    pub fn update(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> Result<(), MapError> {
        self.check_key(key)?;
        self.check_value(value)?;
        match &self.store {
            MapStore::Hash(h) => h.update(key, value, mode),
            MapStore::LruHash(l) => l.update(key, value, mode),
            MapStore::Array(a) => a.update(key, value, mode),
            MapStore::PerWorkerArray(p) => p.update_all(key, value, mode),
            MapStore::RingBuffer(_) => Err(self.unsupported("update")),
        }
    }

    /// Update from a program on `worker`
    pub fn update_from_worker(
        &self,
        key: &[u8],
        value: &[u8],
        mode: UpdateMode,
        worker: usize,
    ) -> Result<(), MapError> {
        match &self.store {
            MapStore::PerWorkerArray(p) => {
                self.check_key(key)?;
                self.check_value(value)?;
                let arr = p.worker(worker).ok_or(MapError::IndexOutOfRange {
                    index: worker as u64,
                    max: p.workers() as u64,
                })?;
                arr.update(key, value, mode)
            }
            _ => self.update(key, value, mode),
        }
    }

    /// Remove an entry
    pub fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.check_key(key)?;
        match &self.store {
            MapStore::Hash(h) => h.delete(key),
            MapStore::LruHash(l) => l.delete(key),
            _ => Err(self.unsupported("delete")),
        }
    }

    /// Remove an entry and return the value it held, `None` if absent
    pub fn take(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.check_key(key)?;
        let cell = match &self.store {
            MapStore::Hash(h) => h.take(key),
            MapStore::LruHash(l) => l.take(key),
            _ => return Err(self.unsupported("delete")),
        };
        Ok(cell.map(|c| c.to_vec()))
    }

    /// All keys currently present
    pub fn keys(&self) -> Vec<Vec<u8>> {
        match &self.store {
            MapStore::Hash(h) => h.keys(),
            MapStore::LruHash(l) => l.keys(),
            MapStore::Array(a) => a.keys(),
            MapStore::PerWorkerArray(p) => p.worker(0).map(|a| a.keys()).unwrap_or_default(),
            MapStore::RingBuffer(_) => Vec::new(),
        }
    }

    /// Number of entries (pending records for ring buffers)
    pub fn len(&self) -> usize {
        match &self.store {
            MapStore::Hash(h) => h.len(),
            MapStore::LruHash(l) => l.len(),
            MapStore::Array(a) => a.len(),
            MapStore::PerWorkerArray(p) => p.worker(0).map_or(0, |a| a.len()),
            MapStore::RingBuffer(r) => r.pending(),
        }
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring buffer view
    pub fn as_ringbuf(&self) -> Option<&RingBufStore> {
        match &self.store {
            MapStore::RingBuffer(r) => Some(r),
            _ => None,
        }
    }

    /// Per-worker view
    pub fn as_per_worker(&self) -> Option<&PerWorkerStore> {
        match &self.store {
            MapStore::PerWorkerArray(p) => Some(p),
            _ => None,
        }
    }
}

/// Decode an array key
pub(crate) fn key_to_index(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_validation() {
        assert!(MapSchema::hash(4, 8, 16).validate().is_ok());
        assert!(MapSchema::hash(4, 8, 0).validate().is_err());
        assert!(MapSchema::new(MapKind::Array, 8, 8, 4).validate().is_err());
        assert!(MapSchema::new(MapKind::RingBuffer, 4, 8, 4).validate().is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let map = Map::new("m", MapSchema::hash(4, 8, 4), 1).unwrap();
        assert_eq!(
            map.update(&[1, 2], &[0; 8], UpdateMode::Upsert),
            Err(MapError::KeySize { expected: 4, got: 2 })
        );
        assert_eq!(
            map.update(&[0; 4], &[0; 4], UpdateMode::Upsert),
            Err(MapError::ValueSize { expected: 8, got: 4 })
        );
    }

    #[test]
    fn test_ringbuf_has_no_lookup() {
        let map = Map::new("rb", MapSchema::ringbuf(16, 4), 1).unwrap();
        assert!(matches!(map.lookup(&[]), Err(MapError::Unsupported { .. })));
    }

    #[test]
    fn test_update_mode_flags() {
        assert_eq!(UpdateMode::from_flags(1), Some(UpdateMode::CreateOnly));
        assert_eq!(UpdateMode::from_flags(7), None);
    }
}
