// SPDX-License-Identifier: GPL-2.0

//! Shared value storage
//!
//! A [`ValueCell`] holds one map value as little-endian bytes packed into
//! atomic 64-bit words. Naturally aligned accesses of up to 8 bytes touch a
//! single word and are single-copy atomic, which is what lets packet programs
//! on different workers update counters in place without locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic byte storage for a single map value
#[derive(Debug)]
pub struct ValueCell {
    words: Box<[AtomicU64]>,
    len: usize,
}

fn lane(off: usize, size: usize) -> Option<(usize, u32, u64)> {
    if size == 0 || size > 8 || off % size != 0 {
        return None;
    }
    let shift = ((off % 8) * 8) as u32;
    let mask = if size == 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
    Some((off / 8, shift, mask))
}

impl ValueCell {
    /// A zero-filled value of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        let words = (0..(len + 7) / 8).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// A value initialized from `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let cell = Self::zeroed(bytes.len());
        cell.write(0, bytes);
        cell
    }

    /// Value size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the value has zero size
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn in_bounds(&self, off: usize, size: usize) -> bool {
        off.checked_add(size).map_or(false, |end| end <= self.len)
    }

    fn load_byte(&self, idx: usize) -> u8 {
        let w = self.words[idx / 8].load(Ordering::Acquire);
        (w >> ((idx % 8) * 8)) as u8
    }

    fn store_byte(&self, idx: usize, b: u8) {
        let shift = (idx % 8) * 8;
        let _ = self.words[idx / 8].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            Some((w & !(0xffu64 << shift)) | (u64::from(b) << shift))
        });
    }

    /// Load `size` bytes at `off` as a little-endian integer
    pub fn load(&self, off: usize, size: usize) -> Option<u64> {
        if !self.in_bounds(off, size) || size > 8 {
            return None;
        }
        if let Some((word, shift, mask)) = lane(off, size) {
            let w = self.words[word].load(Ordering::Acquire);
            return Some((w >> shift) & mask);
        }
        let mut v = 0u64;
        for i in (0..size).rev() {
            v = (v << 8) | u64::from(self.load_byte(off + i));
        }
        Some(v)
    }

    /// Store the low `size` bytes of `val` at `off`
    pub fn store(&self, off: usize, size: usize, val: u64) -> Option<()> {
        if !self.in_bounds(off, size) || size > 8 {
            return None;
        }
        if let Some((word, shift, mask)) = lane(off, size) {
            if size == 8 {
                self.words[word].store(val, Ordering::Release);
            } else {
                let _ = self.words[word].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    Some((w & !(mask << shift)) | ((val & mask) << shift))
                });
            }
            return Some(());
        }
        for i in 0..size {
            self.store_byte(off + i, (val >> (i * 8)) as u8);
        }
        Some(())
    }

    /// Atomically replace the `size`-byte lane at `off` with `f(old)`.
    ///
    /// Returns the old value, or `None` if the access is misaligned or out of
    /// bounds.
    pub fn fetch_update(&self, off: usize, size: usize, mut f: impl FnMut(u64) -> u64) -> Option<u64> {
        if !self.in_bounds(off, size) {
            return None;
        }
        let (word, shift, mask) = lane(off, size)?;
        let prev = self.words[word]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                let old = (w >> shift) & mask;
                let new = f(old) & mask;
                Some((w & !(mask << shift)) | (new << shift))
            })
            .ok()?;
        Some((prev >> shift) & mask)
    }

    /// Copy bytes out starting at `off`. Each underlying word is loaded once,
    /// so aligned 8-byte fields are never torn.
    pub fn read(&self, off: usize, out: &mut [u8]) -> bool {
        if !self.in_bounds(off, out.len()) {
            return false;
        }
        let mut cached: Option<(usize, u64)> = None;
        for (i, b) in out.iter_mut().enumerate() {
            let pos = off + i;
            let word = match cached {
                Some((idx, w)) if idx == pos / 8 => w,
                _ => {
                    let w = self.words[pos / 8].load(Ordering::Acquire);
                    cached = Some((pos / 8, w));
                    w
                }
            };
            *b = (word >> ((pos % 8) * 8)) as u8;
        }
        true
    }

    /// Copy bytes in starting at `off`
    pub fn write(&self, off: usize, data: &[u8]) -> bool {
        if !self.in_bounds(off, data.len()) {
            return false;
        }
        let mut i = 0;
        while i < data.len() {
            let pos = off + i;
            if pos % 8 == 0 && data.len() - i >= 8 {
                let mut word = [0u8; 8];
                word.copy_from_slice(&data[i..i + 8]);
                self.words[pos / 8].store(u64::from_le_bytes(word), Ordering::Release);
                i += 8;
            } else {
                self.store_byte(pos, data[i]);
                i += 1;
            }
        }
        true
    }

    /// Snapshot of the whole value
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read(0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_unaligned() {
        let cell = ValueCell::zeroed(12);
        cell.store(3, 4, 0xdead_beef).unwrap();
        assert_eq!(cell.load(3, 4), Some(0xdead_beef));
        assert_eq!(cell.to_vec()[3..7], [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_bounds() {
        let cell = ValueCell::zeroed(8);
        assert!(cell.load(4, 8).is_none());
        assert!(cell.store(8, 1, 0).is_none());
        assert!(!cell.write(6, &[0; 4]));
    }

    #[test]
    fn test_fetch_add_lane() {
        let cell = ValueCell::from_bytes(&[1, 0, 0, 0, 7, 0, 0, 0]);
        let old = cell.fetch_update(4, 4, |v| v + 1).unwrap();
        assert_eq!(old, 7);
        assert_eq!(cell.load(0, 4), Some(1));
        assert_eq!(cell.load(4, 4), Some(8));
        assert!(cell.fetch_update(2, 4, |v| v).is_none());
    }
}
