// SPDX-License-Identifier: GPL-2.0

//! Runtime address space of one run
//!
//! Addresses are `(region << 32) | offset`. Fixed regions hold the context,
//! the packet and the stack; map values returned by lookups and ring buffer
//! records get a fresh region each. Every access is checked against the
//! region it names, so a bad address can only fail the run.
//!
//! The stack and the region table live in a [`RunScratch`] that a worker
//! keeps across runs.

use std::sync::Arc;

use crate::core::error::ExecutionError;
use crate::core::types::*;
use crate::maps::{Reservation, ValueCell};

use super::context::RxMeta;

/// Context region
pub const REGION_CTX: u32 = 1;
/// Packet region
pub const REGION_PACKET: u32 = 2;
/// Stack region
pub const REGION_STACK: u32 = 3;
/// First region handed out at run time
pub const REGION_DYNAMIC: u32 = 4;
/// Pseudo region of map handles; the offset is the map index
pub const REGION_MAP_HANDLE: u32 = u32::MAX;

/// Build a tagged address
pub fn tag(region: u32, off: u32) -> u64 {
    (u64::from(region) << 32) | u64::from(off)
}

/// Split a tagged address
pub fn untag(addr: u64) -> (u32, u32) {
    ((addr >> 32) as u32, addr as u32)
}

#[derive(Debug)]
enum Region {
    MapValue(Arc<ValueCell>),
    Record(usize),
}

/// Stack and region table reused from one run to the next
#[derive(Debug, Default)]
pub struct RunScratch {
    stack: Vec<u8>,
    regions: Vec<Region>,
}

impl RunScratch {
    /// Scratch with a zeroed stack of `stack_size` bytes
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack: vec![0; stack_size],
            regions: Vec::new(),
        }
    }

    /// Get ready for a run whose program touches at most `frame` bytes
    /// below r10. Only those bytes are zeroed; the stack is reallocated
    /// only when its size changes.
    pub fn reset(&mut self, stack_size: usize, frame: usize) {
        self.regions.clear();
        if self.stack.len() != stack_size {
            self.stack = vec![0; stack_size];
            return;
        }
        let from = stack_size - frame.min(stack_size);
        self.stack[from..].fill(0);
    }

    /// Stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }
}

/// Memory reachable from one run
#[derive(Debug)]
pub struct Memory<'m, 'p> {
    packet: &'m mut [u8],
    scratch: &'m mut [u8; CTX_SCRATCH_SIZE],
    meta: RxMeta,
    stack: &'m mut [u8],
    regions: &'m mut Vec<Region>,
    records: Vec<Option<Reservation<'p>>>,
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn write_le(bytes: &mut [u8], val: u64) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (val >> (i * 8)) as u8;
    }
}

fn window(len: usize, off: u32, size: usize) -> Option<std::ops::Range<usize>> {
    let start = off as usize;
    let end = start.checked_add(size)?;
    (end <= len).then_some(start..end)
}

impl<'m, 'p> Memory<'m, 'p> {
    /// Address space over the given packet and scratch area, with the stack
    /// and region table borrowed from `run`
    pub fn new(
        packet: &'m mut [u8],
        scratch: &'m mut [u8; CTX_SCRATCH_SIZE],
        meta: RxMeta,
        run: &'m mut RunScratch,
    ) -> Self {
        let RunScratch { stack, regions } = run;
        Self {
            packet,
            scratch,
            meta,
            stack,
            regions,
            records: Vec::new(),
        }
    }

    /// Initial value of r1
    pub fn ctx_ptr(&self) -> u64 {
        tag(REGION_CTX, 0)
    }

    /// Initial value of r10
    pub fn frame_ptr(&self) -> u64 {
        tag(REGION_STACK, self.stack.len() as u32)
    }

    fn packet_end(&self) -> u64 {
        tag(REGION_PACKET, u32::try_from(self.packet.len()).unwrap_or(u32::MAX))
    }

    fn violation(insn_idx: usize, addr: u64, size: usize) -> ExecutionError {
        ExecutionError::RuntimeBoundsViolation { insn_idx, addr, size }
    }

    fn region(&self, region: u32) -> Option<&Region> {
        let idx = region.checked_sub(REGION_DYNAMIC)?;
        self.regions.get(idx as usize)
    }

    fn record_cell(&self, slot: usize, off: u32, size: usize) -> Option<&ValueCell> {
        let rec = self.records.get(slot)?.as_ref()?;
        window(rec.len(), off, size)?;
        Some(rec.cell())
    }

    fn new_region(&mut self, region: Region) -> Option<u64> {
        let id = u32::try_from(self.regions.len())
            .ok()?
            .checked_add(REGION_DYNAMIC)
            .filter(|id| *id < REGION_MAP_HANDLE)?;
        self.regions.push(region);
        Some(tag(id, 0))
    }

    /// Address of a map value for this run; `None` when the address space is
    /// exhausted
    pub fn map_value(&mut self, cell: Arc<ValueCell>) -> Option<u64> {
        self.new_region(Region::MapValue(cell))
    }

    /// Keep a reservation open and return its address
    pub fn reserve(&mut self, rec: Reservation<'p>) -> Option<u64> {
        self.records.push(Some(rec));
        let slot = self.records.len() - 1;
        let addr = self.new_region(Region::Record(slot));
        if addr.is_none() {
            self.records.pop();
        }
        addr
    }

    /// Take back the reservation whose record starts at `addr`
    pub fn release(&mut self, addr: u64) -> Option<Reservation<'p>> {
        let (region, off) = untag(addr);
        if off != 0 {
            return None;
        }
        match self.region(region)? {
            Region::Record(slot) => {
                let slot = *slot;
                self.records.get_mut(slot)?.take()
            }
            Region::MapValue(_) => None,
        }
    }

    /// Discard every open reservation. Returns how many were open.
    pub fn discard_open(&mut self) -> usize {
        let mut n = 0;
        for rec in self.records.iter_mut().filter_map(Option::take) {
            rec.discard();
            n += 1;
        }
        n
    }

    fn ctx_load(&self, off: u32, size: usize) -> Option<u64> {
        let off_i = off as i32;
        match (off_i, size) {
            (CTX_OFF_DATA, 8) => Some(tag(REGION_PACKET, 0)),
            (CTX_OFF_DATA_END, 8) => Some(self.packet_end()),
            (CTX_OFF_IFINDEX, 4) => Some(u64::from(self.meta.ingress_ifindex)),
            (CTX_OFF_RX_QUEUE, 4) => Some(u64::from(self.meta.rx_queue_index)),
            _ => {
                let r = window(CTX_SCRATCH_SIZE, off.checked_sub(CTX_OFF_SCRATCH as u32)?, size)?;
                Some(read_le(&self.scratch[r]))
            }
        }
    }

    /// Load `size` bytes at `addr`
    pub fn load(&self, insn_idx: usize, addr: u64, size: usize) -> Result<u64, ExecutionError> {
        let (region, off) = untag(addr);
        let val = match region {
            REGION_CTX => self.ctx_load(off, size),
            REGION_PACKET => window(self.packet.len(), off, size).map(|r| read_le(&self.packet[r])),
            REGION_STACK => window(self.stack.len(), off, size).map(|r| read_le(&self.stack[r])),
            _ => match self.region(region) {
                Some(Region::MapValue(cell)) => cell.load(off as usize, size),
                Some(Region::Record(slot)) => self
                    .record_cell(*slot, off, size)
                    .and_then(|c| c.load(off as usize, size)),
                None => None,
            },
        };
        val.ok_or_else(|| Self::violation(insn_idx, addr, size))
    }

    /// Store the low `size` bytes of `val` at `addr`
    pub fn store(&mut self, insn_idx: usize, addr: u64, size: usize, val: u64) -> Result<(), ExecutionError> {
        let (region, off) = untag(addr);
        let done = match region {
            REGION_CTX => off
                .checked_sub(CTX_OFF_SCRATCH as u32)
                .and_then(|o| window(CTX_SCRATCH_SIZE, o, size))
                .map(|r| write_le(&mut self.scratch[r], val)),
            REGION_PACKET => {
                window(self.packet.len(), off, size).map(|r| write_le(&mut self.packet[r], val))
            }
            REGION_STACK => window(self.stack.len(), off, size).map(|r| write_le(&mut self.stack[r], val)),
            _ => match self.region(region) {
                Some(Region::MapValue(cell)) => cell.store(off as usize, size, val),
                Some(Region::Record(slot)) => self
                    .record_cell(*slot, off, size)
                    .and_then(|c| c.store(off as usize, size, val)),
                None => None,
            },
        };
        done.ok_or_else(|| Self::violation(insn_idx, addr, size))
    }

    /// Atomically replace the `size` bytes at `addr` with `f(old)`; returns
    /// the old value
    pub fn fetch_update(
        &mut self,
        insn_idx: usize,
        addr: u64,
        size: usize,
        f: impl FnMut(u64) -> u64,
    ) -> Result<u64, ExecutionError> {
        let (region, off) = untag(addr);
        let old = match region {
            REGION_STACK => {
                let mut f = f;
                window(self.stack.len(), off, size).map(|r| {
                    let old = read_le(&self.stack[r.clone()]);
                    write_le(&mut self.stack[r], f(old));
                    old
                })
            }
            _ => match self.region(region) {
                Some(Region::MapValue(cell)) => cell.fetch_update(off as usize, size, f),
                _ => None,
            },
        };
        old.ok_or_else(|| Self::violation(insn_idx, addr, size))
    }

    /// Copy `len` bytes out of `addr` for a helper
    pub fn read_bytes(&self, insn_idx: usize, addr: u64, len: usize) -> Result<Vec<u8>, ExecutionError> {
        let (region, off) = untag(addr);
        let bytes = match region {
            REGION_PACKET => window(self.packet.len(), off, len).map(|r| self.packet[r].to_vec()),
            REGION_STACK => window(self.stack.len(), off, len).map(|r| self.stack[r].to_vec()),
            _ => match self.region(region) {
                Some(Region::MapValue(cell)) => {
                    let mut buf = vec![0u8; len];
                    cell.read(off as usize, &mut buf).then_some(buf)
                }
                Some(Region::Record(slot)) => self.record_cell(*slot, off, len).and_then(|c| {
                    let mut buf = vec![0u8; len];
                    c.read(off as usize, &mut buf).then_some(buf)
                }),
                None => None,
            },
        };
        bytes.ok_or_else(|| Self::violation(insn_idx, addr, len))
    }
}
