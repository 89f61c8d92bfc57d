// SPDX-License-Identifier: GPL-2.0

//! Stack state tracking
//!
//! The 512-byte frame below r10 is tracked per byte. Aligned 8-byte stores of
//! a register keep the full register state (a spill) so that pointers and
//! scalar bounds survive a round trip through the stack.

use super::reg_state::RegState;
use crate::bounds::scalar::ScalarBounds;
use crate::core::types::*;

/// What is known about a single stack byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotKind {
    /// Never written
    #[default]
    Invalid,
    /// Holds some scalar data
    Misc,
    /// Known to be zero
    Zero,
    /// Part of a spilled register
    Spill,
}

/// One 8-byte stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StackSlot {
    /// Per-byte state, lowest address first
    pub kinds: [SlotKind; REG_SIZE],
    /// Spilled register when all bytes are `Spill`
    pub spilled: Option<RegState>,
}

/// Why a stack access failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// Offset outside the frame, or not constant
    OutOfBounds,
    /// Byte read before being written
    Uninit(i32),
    /// Partial access to a spilled pointer
    PointerBytes(i32),
}

/// The program's stack frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackState {
    slots: Vec<StackSlot>,
}

impl Default for StackState {
    fn default() -> Self {
        Self::new()
    }
}

impl StackState {
    /// An empty, fully uninitialized frame
    pub fn new() -> Self {
        Self {
            slots: vec![StackSlot::default(); MAX_STACK / REG_SIZE],
        }
    }

    /// Slots, lowest address first
    pub fn slots(&self) -> &[StackSlot] {
        &self.slots
    }

    fn check_range(off: i32, size: usize) -> Result<usize, StackError> {
        let start = i64::from(off) + MAX_STACK as i64;
        if off >= 0 || start < 0 || start + size as i64 > MAX_STACK as i64 || size == 0 {
            return Err(StackError::OutOfBounds);
        }
        Ok(start as usize)
    }

    fn byte(&self, idx: usize) -> (SlotKind, &StackSlot) {
        let slot = &self.slots[idx / REG_SIZE];
        (slot.kinds[idx % REG_SIZE], slot)
    }

    /// Break the spill covering `idx`, keeping its other bytes as scalar data
    fn unspill(&mut self, slot_idx: usize) {
        let slot = &mut self.slots[slot_idx];
        if slot.spilled.take().is_some() {
            for k in slot.kinds.iter_mut() {
                if *k == SlotKind::Spill {
                    *k = SlotKind::Misc;
                }
            }
        }
    }

    /// Store a register at `fp + off`
    pub fn write_reg(&mut self, off: i32, size: usize, reg: &RegState) -> Result<(), StackError> {
        let start = Self::check_range(off, size)?;
        if size == REG_SIZE && start % REG_SIZE == 0 {
            let slot = &mut self.slots[start / REG_SIZE];
            slot.kinds = [SlotKind::Spill; REG_SIZE];
            slot.spilled = Some(*reg);
            return Ok(());
        }
        if reg.is_pointer() {
            return Err(StackError::PointerBytes(off));
        }
        let kind = if reg.const_value() == Some(0) {
            SlotKind::Zero
        } else {
            SlotKind::Misc
        };
        self.fill(start, size, kind);
        Ok(())
    }

    /// Mark `size` bytes at `fp + off` as written with scalar data
    pub fn write_misc(&mut self, off: i32, size: usize) -> Result<(), StackError> {
        let start = Self::check_range(off, size)?;
        self.fill(start, size, SlotKind::Misc);
        Ok(())
    }

    fn fill(&mut self, start: usize, size: usize, kind: SlotKind) {
        for idx in start..start + size {
            self.unspill(idx / REG_SIZE);
            self.slots[idx / REG_SIZE].kinds[idx % REG_SIZE] = kind;
        }
    }

    /// Load `size` bytes from `fp + off`
    pub fn read(&self, off: i32, size: usize) -> Result<RegState, StackError> {
        let start = Self::check_range(off, size)?;
        if size == REG_SIZE && start % REG_SIZE == 0 {
            if let Some(spilled) = self.slots[start / REG_SIZE].spilled {
                return Ok(spilled);
            }
        }
        let mut all_zero = true;
        for idx in start..start + size {
            let (kind, slot) = self.byte(idx);
            match kind {
                SlotKind::Invalid => return Err(StackError::Uninit(idx as i32 - MAX_STACK as i32)),
                SlotKind::Spill => {
                    if slot.spilled.map_or(false, |r| r.is_pointer()) {
                        return Err(StackError::PointerBytes(off));
                    }
                    all_zero = false;
                }
                SlotKind::Misc => all_zero = false,
                SlotKind::Zero => {}
            }
        }
        if all_zero {
            Ok(RegState::known(0))
        } else {
            Ok(RegState::scalar(ScalarBounds::of_width(size)))
        }
    }

    /// Check that `size` bytes at `fp + off` may be passed to a helper as
    /// read-only memory: all initialized, no pointer bytes.
    pub fn check_readable(&self, off: i32, size: usize) -> Result<(), StackError> {
        let start = Self::check_range(off, size)?;
        for idx in start..start + size {
            let (kind, slot) = self.byte(idx);
            match kind {
                SlotKind::Invalid => return Err(StackError::Uninit(idx as i32 - MAX_STACK as i32)),
                SlotKind::Spill if slot.spilled.map_or(false, |r| r.is_pointer()) => {
                    return Err(StackError::PointerBytes(idx as i32 - MAX_STACK as i32))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Spilled registers, mutably
    pub fn spilled_regs_mut(&mut self) -> impl Iterator<Item = &mut RegState> {
        self.slots.iter_mut().filter_map(|s| s.spilled.as_mut())
    }

    /// Spilled registers
    pub fn spilled_regs(&self) -> impl Iterator<Item = &RegState> {
        self.slots.iter().filter_map(|s| s.spilled.as_ref())
    }

    /// Turn every spill matching `pred` into plain scalar bytes
    pub fn scrub_spills(&mut self, pred: impl Fn(&RegState) -> bool) {
        for i in 0..self.slots.len() {
            if self.slots[i].spilled.as_ref().map_or(false, &pred) {
                self.unspill(i);
            }
        }
    }
}
