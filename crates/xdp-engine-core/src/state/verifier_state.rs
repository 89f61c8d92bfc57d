// SPDX-License-Identifier: GPL-2.0

//! Verifier state: registers, stack and held references on one path

use super::reg_state::RegState;
use super::stack_state::StackState;
use crate::core::types::*;

/// Complete abstract state at one point of one path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerifierState {
    /// Register states
    pub regs: [RegState; MAX_REG],
    /// Stack frame
    pub stack: StackState,
    /// Acquired references not yet released, in acquisition order
    pub refs: Vec<u32>,
}

impl Default for VerifierState {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifierState {
    /// Entry state: r1 is the context, r10 the frame pointer, all else unset
    pub fn new() -> Self {
        let mut regs = [RegState::not_init(); MAX_REG];
        regs[REG_1] = RegState::ctx();
        regs[REG_FP] = RegState::stack(0);
        Self {
            regs,
            stack: StackState::new(),
            refs: Vec::new(),
        }
    }

    /// Register by number
    pub fn reg(&self, regno: usize) -> Option<&RegState> {
        self.regs.get(regno)
    }

    /// Mutable register by number
    pub fn reg_mut(&mut self, regno: usize) -> Option<&mut RegState> {
        self.regs.get_mut(regno)
    }

    /// Record a newly acquired reference
    pub fn acquire_ref(&mut self, id: u32) {
        self.refs.push(id);
    }

    /// Release a reference and invalidate every copy of the pointer holding it.
    /// Returns `false` if the reference was not held.
    pub fn release_ref(&mut self, id: u32) -> bool {
        let Some(pos) = self.refs.iter().position(|r| *r == id) else {
            return false;
        };
        self.refs.remove(pos);
        for reg in self.regs.iter_mut() {
            if reg.ref_obj_id == id {
                *reg = RegState::not_init();
            }
        }
        self.stack.scrub_spills(|r| r.ref_obj_id == id);
        true
    }

    /// Every register and spilled register, mutably
    pub fn for_each_reg_mut(&mut self, mut f: impl FnMut(&mut RegState)) {
        for reg in self.regs.iter_mut() {
            f(reg);
        }
        for reg in self.stack.spilled_regs_mut() {
            f(reg);
        }
    }

    /// Clobber caller-saved registers after a helper call
    pub fn clobber_caller_saved(&mut self) {
        for regno in CALLER_SAVED {
            self.regs[regno] = RegState::not_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_state() {
        let s = VerifierState::new();
        assert_eq!(s.regs[REG_1].reg_type, RegType::PtrToCtx);
        assert_eq!(s.regs[REG_FP].reg_type, RegType::PtrToStack);
        assert!(!s.regs[REG_0].is_init());
    }

    #[test]
    fn test_release_invalidates_copies() {
        let mut s = VerifierState::new();
        s.acquire_ref(3);
        let rec = RegState::ringbuf_or_null(16, 3);
        s.regs[6] = rec;
        s.regs[7] = rec;
        s.stack.write_reg(-8, 8, &rec).unwrap();
        assert!(s.release_ref(3));
        assert!(!s.regs[6].is_init());
        assert!(!s.regs[7].is_init());
        assert!(s.stack.spilled_regs().next().is_none());
        assert!(!s.release_ref(3));
    }
}
