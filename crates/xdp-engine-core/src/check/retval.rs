// SPDX-License-Identifier: GPL-2.0

//! Exit verification
//!
//! At `exit` every acquired reference must have been released and r0 must
//! be a scalar proven to be a verdict code of the attach point.

use crate::core::error::{reject, Result};
use crate::core::types::*;
use crate::program::AttachKind;
use crate::state::verifier_state::VerifierState;

/// Verdict range a program at `attach` may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetvalRange {
    /// Smallest allowed code
    pub minval: u64,
    /// Largest allowed code
    pub maxval: u64,
}

impl RetvalRange {
    /// Range for an attach point
    pub fn for_attach(attach: AttachKind) -> Self {
        let (minval, maxval) = attach.verdict_range();
        Self { minval, maxval }
    }

    /// Check if value is within range
    pub fn contains(&self, val: u64) -> bool {
        val >= self.minval && val <= self.maxval
    }
}

/// Check the state at an `exit` instruction
pub fn check_return_code(state: &VerifierState, attach: AttachKind, insn_idx: usize) -> Result<()> {
    if let Some(id) = state.refs.first() {
        return Err(reject!(
            insn_idx,
            UnreleasedReference,
            "unreleased reference id={}, ring buffer record must be submitted or discarded",
            id
        ));
    }

    let r0 = &state.regs[REG_0];
    if !r0.is_init() {
        return Err(reject!(insn_idx, UninitializedRead, "R0 !read_ok at exit"));
    }
    if !r0.is_scalar() {
        return Err(reject!(
            insn_idx,
            InvalidReturn,
            "R0 leaks {} pointer at exit",
            r0.reg_type.name()
        ));
    }
    let range = RetvalRange::for_attach(attach);
    if !range.contains(r0.bounds.umin_value) || !range.contains(r0.bounds.umax_value) {
        return Err(reject!(
            insn_idx,
            InvalidReturn,
            "R0 has value [{}, {}], should have been in [{}, {}]",
            r0.bounds.umin_value,
            r0.bounds.umax_value,
            range.minval,
            range.maxval
        ));
    }
    Ok(())
}
