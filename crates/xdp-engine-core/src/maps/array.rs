// SPDX-License-Identifier: GPL-2.0

//! Array store: preallocated, zero-initialized, never resized

use std::sync::Arc;

use super::cell::ValueCell;
use super::{key_to_index, UpdateMode};
use crate::core::error::MapError;

/// Fixed-size array of values indexed by a `u32` key
#[derive(Debug)]
pub struct ArrayStore {
    cells: Box<[Arc<ValueCell>]>,
}

impl ArrayStore {
    /// Create `max_entries` zeroed values
    pub fn new(value_size: usize, max_entries: usize) -> Self {
        let cells = (0..max_entries)
            .map(|_| Arc::new(ValueCell::zeroed(value_size)))
            .collect();
        Self { cells }
    }

    /// Cell at `idx`
    pub fn get(&self, idx: u32) -> Option<&Arc<ValueCell>> {
        self.cells.get(idx as usize)
    }

    /// Cell for a 4-byte key
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<ValueCell>> {
        key_to_index(key).and_then(|i| self.get(i)).cloned()
    }

    /// Overwrite the value at `idx` in place
    pub fn set(&self, idx: u32, value: &[u8]) -> Result<(), MapError> {
        let cell = self.get(idx).ok_or(MapError::IndexOutOfRange {
            index: u64::from(idx),
            max: self.cells.len() as u64,
        })?;
        if !cell.write(0, value) {
            return Err(MapError::ValueSize {
                expected: cell.len(),
                got: value.len(),
            });
        }
        Ok(())
    }

    /// Keyed update; every index always exists
    pub fn update(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> Result<(), MapError> {
        let idx = key_to_index(key).ok_or(MapError::KeySize {
            expected: 4,
            got: key.len(),
        })?;
        if mode == UpdateMode::CreateOnly && (idx as usize) < self.cells.len() {
            return Err(MapError::Exists);
        }
        self.set(idx, value)
    }

    /// All valid keys
    pub fn keys(&self) -> Vec<Vec<u8>> {
        (0..self.cells.len() as u32)
            .map(|i| i.to_le_bytes().to_vec())
            .collect()
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the array has no slots
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let a = ArrayStore::new(8, 4);
        a.set(2, &7u64.to_le_bytes()).unwrap();
        assert_eq!(a.get(2).unwrap().load(0, 8), Some(7));
        assert_eq!(a.get(0).unwrap().load(0, 8), Some(0));
    }

    #[test]
    fn test_out_of_range() {
        let a = ArrayStore::new(4, 2);
        assert_eq!(
            a.set(2, &[0; 4]),
            Err(MapError::IndexOutOfRange { index: 2, max: 2 })
        );
        assert!(a.lookup(&5u32.to_le_bytes()).is_none());
    }

    #[test]
    fn test_create_only_always_exists() {
        let a = ArrayStore::new(4, 2);
        assert_eq!(
            a.update(&0u32.to_le_bytes(), &[0; 4], UpdateMode::CreateOnly),
            Err(MapError::Exists)
        );
    }
}
