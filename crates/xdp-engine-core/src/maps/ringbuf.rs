// SPDX-License-Identifier: GPL-2.0

//! Ring buffer store
//!
//! A bounded multi-producer single-consumer queue of fixed-size record slots.
//! Every slot carries a sequence number: `pos` when free for the producer at
//! position `pos`, `pos + 1` once that producer has committed it, and
//! `pos + capacity` after the consumer released it for the next lap.
//! Producers claim positions with a CAS on the tail and never block; a slot
//! still owned by the consumer makes the reservation fail.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::cell::ValueCell;
use crate::core::error::MapError;

#[derive(Debug)]
struct Slot {
    seq: AtomicUsize,
    len: AtomicUsize,
    discarded: AtomicBool,
    data: ValueCell,
}

/// Bounded MPSC record queue
#[derive(Debug)]
pub struct RingBufStore {
    slots: Box<[Slot]>,
    tail: AtomicUsize,
    head: Mutex<usize>,
    record_size: usize,
    dropped: AtomicU64,
}

impl RingBufStore {
    /// Create a ring of `slots` records of up to `record_size` bytes
    pub fn new(record_size: usize, slots: usize) -> Self {
        let slots = (0..slots)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                len: AtomicUsize::new(0),
                discarded: AtomicBool::new(false),
                data: ValueCell::zeroed(record_size),
            })
            .collect();
        Self {
            slots,
            tail: AtomicUsize::new(0),
            head: Mutex::new(0),
            record_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Largest record accepted
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of record slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, pos: usize) -> &Slot {
        &self.slots[pos % self.slots.len()]
    }

    /// Claim a record of `len` bytes. Returns `None` if the ring is full or
    /// `len` is zero or too large.
    pub fn reserve(&self, len: usize) -> Option<Reservation<'_>> {
        if len == 0 || len > self.record_size {
            return None;
        }
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.len.store(len, Ordering::Relaxed);
                        slot.data.write(0, &vec![0u8; len]);
                        return Some(Reservation {
                            ring: self,
                            pos,
                            len,
                            done: false,
                        });
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Copy `data` into a new record and publish it
    pub fn output(&self, data: &[u8]) -> Result<(), MapError> {
        let mut rec = self.reserve(data.len()).ok_or(MapError::RingFull)?;
        rec.write(0, data);
        rec.submit();
        Ok(())
    }

    /// Take the next submitted record.
    ///
    /// Discarded records are skipped. Stops at a record that is reserved but
    /// not yet committed.
    pub fn poll(&self) -> Option<Vec<u8>> {
        let mut head = self.head.lock();
        loop {
            let pos = *head;
            let slot = self.slot(pos);
            if slot.seq.load(Ordering::Acquire) != pos.wrapping_add(1) {
                return None;
            }
            let record = if slot.discarded.load(Ordering::Relaxed) {
                None
            } else {
                let mut buf = vec![0u8; slot.len.load(Ordering::Relaxed)];
                slot.data.read(0, &mut buf);
                Some(buf)
            };
            slot.seq
                .store(pos.wrapping_add(self.slots.len()), Ordering::Release);
            *head = pos.wrapping_add(1);
            if record.is_some() {
                return record;
            }
        }
    }

    /// Call `f` on every submitted record; returns how many were consumed
    pub fn drain(&self, mut f: impl FnMut(&[u8])) -> usize {
        let mut n = 0;
        while let Some(rec) = self.poll() {
            f(&rec);
            n += 1;
        }
        n
    }

    /// Records reserved or committed but not yet consumed
    pub fn pending(&self) -> usize {
        let head = *self.head.lock();
        self.tail.load(Ordering::Acquire).wrapping_sub(head)
    }

    /// Reservations that failed because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A claimed record. Dropping it without submitting discards it.
#[derive(Debug)]
pub struct Reservation<'a> {
    ring: &'a RingBufStore,
    pos: usize,
    len: usize,
    done: bool,
}

impl Reservation<'_> {
    /// Record length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the record is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record memory; only the first [`Self::len`] bytes are published
    pub fn cell(&self) -> &ValueCell {
        &self.ring.slot(self.pos).data
    }

    /// Copy `data` into the record at `off`
    pub fn write(&mut self, off: usize, data: &[u8]) -> bool {
        if off + data.len() > self.len {
            return false;
        }
        self.cell().write(off, data)
    }

    fn commit(&mut self, discard: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let slot = self.ring.slot(self.pos);
        slot.discarded.store(discard, Ordering::Relaxed);
        slot.seq.store(self.pos.wrapping_add(1), Ordering::Release);
    }

    /// Publish the record to the consumer
    pub fn submit(mut self) {
        self.commit(false);
    }

    /// Release the slot without publishing
    pub fn discard(mut self) {
        self.commit(true);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.commit(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_full() {
        let rb = RingBufStore::new(8, 2);
        rb.output(&[1]).unwrap();
        rb.output(&[2, 2]).unwrap();
        assert_eq!(rb.output(&[3]), Err(MapError::RingFull));
        assert_eq!(rb.dropped(), 1);
        assert_eq!(rb.poll(), Some(vec![1]));
        rb.output(&[3]).unwrap();
        assert_eq!(rb.poll(), Some(vec![2, 2]));
        assert_eq!(rb.poll(), Some(vec![3]));
        assert_eq!(rb.poll(), None);
    }

    #[test]
    fn test_discard_skipped() {
        let rb = RingBufStore::new(4, 4);
        let r = rb.reserve(4).unwrap();
        r.discard();
        rb.output(&[9]).unwrap();
        assert_eq!(rb.poll(), Some(vec![9]));
    }

    #[test]
    fn test_uncommitted_blocks_consumer() {
        let rb = RingBufStore::new(4, 4);
        let first = rb.reserve(1).unwrap();
        rb.output(&[2]).unwrap();
        assert_eq!(rb.poll(), None);
        first.submit();
        assert_eq!(rb.drain(|_| {}), 2);
    }

    #[test]
    fn test_drop_discards() {
        let rb = RingBufStore::new(4, 1);
        {
            let _r = rb.reserve(2).unwrap();
        }
        assert_eq!(rb.poll(), None);
        assert!(rb.reserve(1).is_some());
    }

    #[test]
    fn test_size_limits() {
        let rb = RingBufStore::new(4, 1);
        assert!(rb.reserve(0).is_none());
        assert!(rb.reserve(5).is_none());
    }
}
