// SPDX-License-Identifier: GPL-2.0

//! Per-worker arrays
//!
//! Each worker owns one array and writes only to it, so counters on the
//! packet path never contend. Reads from the control plane merge the copies.

use super::array::ArrayStore;
use super::{key_to_index, UpdateMode};
use crate::core::error::MapError;

/// One [`ArrayStore`] per worker
#[derive(Debug)]
pub struct PerWorkerStore {
    arrays: Box<[ArrayStore]>,
    value_size: usize,
}

impl PerWorkerStore {
    /// Create `workers` arrays of `max_entries` values each
    pub fn new(workers: usize, value_size: usize, max_entries: usize) -> Self {
        let arrays = (0..workers)
            .map(|_| ArrayStore::new(value_size, max_entries))
            .collect();
        Self { arrays, value_size }
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.arrays.len()
    }

    /// The array owned by `worker`
    pub fn worker(&self, worker: usize) -> Option<&ArrayStore> {
        self.arrays.get(worker)
    }

    /// Value at `idx` on `worker`
    pub fn get(&self, worker: usize, idx: u32) -> Option<Vec<u8>> {
        self.worker(worker)?.get(idx).map(|c| c.to_vec())
    }

    /// Every worker's copy of `idx`
    pub fn values(&self, idx: u32) -> Vec<Vec<u8>> {
        self.arrays
            .iter()
            .filter_map(|a| a.get(idx).map(|c| c.to_vec()))
            .collect()
    }

    /// Wrapping sum of the little-endian `u64` at byte `off` of `idx` over all
    /// workers
    pub fn sum_u64(&self, idx: u32, off: usize) -> u64 {
        self.arrays
            .iter()
            .filter_map(|a| a.get(idx).and_then(|c| c.load(off, 8)))
            .fold(0u64, |acc, v| acc.wrapping_add(v))
    }

    /// Lane-wise sum over workers; trailing bytes that do not fill a lane are
    /// taken from worker 0
    pub fn aggregate(&self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = key_to_index(key)?;
        let mut out = self.get(0, idx)?;
        let lanes = self.value_size / 8;
        for lane in 0..lanes {
            let total = self.sum_u64(idx, lane * 8);
            out[lane * 8..lane * 8 + 8].copy_from_slice(&total.to_le_bytes());
        }
        Some(out)
    }

    /// Write `value` into every worker's copy
    pub fn update_all(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> Result<(), MapError> {
        for a in self.arrays.iter() {
            a.update(key, value, mode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_over_workers() {
        let p = PerWorkerStore::new(3, 16, 2);
        for w in 0..3 {
            let cell = p.worker(w).unwrap().get(1).unwrap();
            cell.store(0, 8, w as u64 + 1).unwrap();
            cell.store(8, 8, 10).unwrap();
        }
        assert_eq!(p.sum_u64(1, 0), 6);
        let agg = p.aggregate(&1u32.to_le_bytes()).unwrap();
        assert_eq!(u64::from_le_bytes(agg[8..16].try_into().unwrap()), 30);
        assert_eq!(p.values(1).len(), 3);
    }

    #[test]
    fn test_update_all() {
        let p = PerWorkerStore::new(2, 8, 1);
        p.update_all(&0u32.to_le_bytes(), &5u64.to_le_bytes(), UpdateMode::Upsert)
            .unwrap();
        assert_eq!(p.sum_u64(0, 0), 10);
    }
}
