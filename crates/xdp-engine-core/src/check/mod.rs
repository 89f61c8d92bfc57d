// SPDX-License-Identifier: GPL-2.0

//! Instruction verification
//!
//! - `structure`: opcode, register and jump target validity
//! - `alu`: scalar and pointer arithmetic
//! - `load_store`: memory loads and stores, 64-bit immediates
//! - `atomic`: atomic read-modify-write
//! - `jump`: conditional jumps, branch pruning, NULL and packet proofs
//! - `helper`: helper call argument and return types
//! - `retval`: exit checks

pub mod alu;
pub mod atomic;
pub mod helper;
pub mod jump;
pub mod load_store;
pub mod retval;
pub mod structure;

use crate::core::error::{reject, Result};
use crate::state::reg_state::RegState;
use crate::state::verifier_state::VerifierState;

/// Where the walk goes after an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnResult {
    /// Next instruction in sequence
    Continue,
    /// Jump to the given instruction
    Jump(usize),
    /// Path finished
    Exit,
}

/// Register `regno` as a source operand; must be initialized
pub(crate) fn src_reg(state: &VerifierState, insn_idx: usize, regno: u8) -> Result<RegState> {
    let reg = state.regs[regno as usize];
    if !reg.is_init() {
        return Err(reject!(insn_idx, UninitializedRead, "R{} !read_ok", regno));
    }
    Ok(reg)
}
