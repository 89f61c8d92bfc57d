// SPDX-License-Identifier: GPL-2.0

//! Conditional jump verification
//!
//! A branch is first decided from the operand ranges; a decided branch
//! follows one edge only. Otherwise each edge gets its own copy of the state
//! narrowed by what the condition proves on it:
//!
//! - scalar comparisons refine both operands' bounds;
//! - `ptr == 0` / `ptr != 0` on a nullable pointer resolves it;
//! - `pkt <op> pkt_end` grants a readable range to the packet pointer.

use super::{src_reg, InsnResult};
use crate::analysis::cfg::jump_target;
use crate::bounds::range_refine::{fits_subreg, is_branch_taken, refine_regs, BranchCond};
use crate::core::error::{reject, Result};
use crate::core::log::log_branch;
use crate::core::types::*;
use crate::mem::packet::{find_good_pkt_pointers, pkt_end_compare};
use crate::state::reg_state::RegState;
use crate::state::verifier_state::VerifierState;
use crate::verifier::env::VerifierEnv;

/// Edge states of a conditional jump; `None` marks an infeasible edge
struct Edges {
    taken: Option<VerifierState>,
    fall: Option<VerifierState>,
}

impl Edges {
    fn both(state: &VerifierState) -> Self {
        Self {
            taken: Some(state.clone()),
            fall: Some(state.clone()),
        }
    }
}

/// Check a conditional jump and schedule its feasible edges
pub fn check_cond_jmp_op(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<InsnResult> {
    let is32 = insn.class() == BPF_JMP32;
    let Some(cond) = BranchCond::from_opcode(insn.op()) else {
        return Err(reject!(insn_idx, MalformedProgram, "invalid conditional jump {:#x}", insn.code));
    };
    let Some(target) = jump_target(insn_idx, insn, env.insns.len()) else {
        return Err(reject!(insn_idx, MalformedProgram, "jump out of range"));
    };

    let dst = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    let src = if insn.src() == BPF_X {
        src_reg(&env.cur_state, insn_idx, insn.src_reg)?
    } else if is32 && !cond.is_signed() {
        RegState::known(u64::from(insn.imm as u32))
    } else {
        RegState::known(i64::from(insn.imm) as u64)
    };

    let edges = if dst.is_scalar() && src.is_scalar() {
        scalar_edges(&env.cur_state, insn, is32, cond, &dst, &src)
    } else if let Some(edges) = null_check_edges(&env.cur_state, &dst, &src, cond) {
        edges
    } else if let Some(rel) = pkt_end_compare(&dst, &src, cond) {
        if is32 {
            return Err(reject!(insn_idx, TypeMismatch, "32-bit packet pointer comparison prohibited"));
        }
        let pkt = if dst.reg_type == RegType::PtrToPacket { dst } else { src };
        let mut edges = Edges::both(&env.cur_state);
        if let Some(s) = edges.taken.as_mut() {
            find_good_pkt_pointers(s, &pkt, rel);
        }
        if let Some(s) = edges.fall.as_mut() {
            find_good_pkt_pointers(s, &pkt, rel.negate());
        }
        edges
    } else if dst.is_pointer() && src.is_pointer() && dst.reg_type == src.reg_type && !dst.maybe_null() {
        Edges::both(&env.cur_state)
    } else {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "R{} {} comparison with {} prohibited",
            insn.dst_reg,
            dst.reg_type.name(),
            src.reg_type.name()
        ));
    };

    let next = insn_idx + 1;
    match (edges.taken, edges.fall) {
        (Some(taken), Some(fall)) => {
            log_branch(&mut env.log, insn_idx, "unknown", target);
            env.push_state(fall, insn_idx, next)?;
            env.cur_state = taken;
            Ok(InsnResult::Jump(target))
        }
        (Some(taken), None) => {
            log_branch(&mut env.log, insn_idx, "always taken", target);
            env.cur_state = taken;
            Ok(InsnResult::Jump(target))
        }
        (None, Some(fall)) => {
            log_branch(&mut env.log, insn_idx, "never taken", next);
            env.cur_state = fall;
            Ok(InsnResult::Continue)
        }
        // Contradictory ranges: this path cannot happen
        (None, None) => Ok(InsnResult::Exit),
    }
}

fn scalar_edges(
    state: &VerifierState,
    insn: &Insn,
    is32: bool,
    cond: BranchCond,
    dst: &RegState,
    src: &RegState,
) -> Edges {
    let exact = !is32 || (fits_subreg(&dst.bounds, cond) && fits_subreg(&src.bounds, cond));
    if !exact {
        return Edges::both(state);
    }
    match is_branch_taken(&dst.bounds, &src.bounds, cond) {
        Some(true) => {
            return Edges {
                taken: Some(state.clone()),
                fall: None,
            }
        }
        Some(false) => {
            return Edges {
                taken: None,
                fall: Some(state.clone()),
            }
        }
        None => {}
    }
    let narrow = |c: BranchCond| -> Option<VerifierState> {
        let (d, s) = refine_regs(&dst.bounds, &src.bounds, c)?;
        let mut st = state.clone();
        st.regs[insn.dst_reg as usize].bounds = d;
        if insn.src() == BPF_X {
            st.regs[insn.src_reg as usize].bounds = s;
        }
        Some(st)
    };
    Edges {
        taken: narrow(cond),
        fall: narrow(cond.negate()),
    }
}

/// Edges of `ptr == 0` / `ptr != 0` on a nullable pointer
fn null_check_edges(
    state: &VerifierState,
    dst: &RegState,
    src: &RegState,
    cond: BranchCond,
) -> Option<Edges> {
    if !matches!(cond, BranchCond::Eq | BranchCond::Ne) {
        return None;
    }
    let ptr = if dst.maybe_null() && src.const_value() == Some(0) {
        dst
    } else if src.maybe_null() && dst.const_value() == Some(0) {
        src
    } else {
        return None;
    };
    let mut is_null = state.clone();
    mark_ptr_or_null_regs(&mut is_null, ptr, true);
    let mut non_null = state.clone();
    mark_ptr_or_null_regs(&mut non_null, ptr, false);
    Some(if cond == BranchCond::Eq {
        Edges {
            taken: Some(is_null),
            fall: Some(non_null),
        }
    } else {
        Edges {
            taken: Some(non_null),
            fall: Some(is_null),
        }
    })
}

/// Resolve every copy of a nullable pointer. On the NULL edge the copies
/// become scalar zero and a reference held by the pointer is dropped, since
/// nothing was acquired.
pub fn mark_ptr_or_null_regs(state: &mut VerifierState, ptr: &RegState, is_null: bool) {
    let id = ptr.id;
    if id == 0 {
        return;
    }
    state.for_each_reg_mut(|r| {
        if r.id != id || !r.maybe_null() {
            return;
        }
        if is_null {
            *r = RegState::known(0);
        } else {
            r.type_flags.remove(TypeFlag::MAYBE_NULL);
        }
    });
    if is_null && ptr.ref_obj_id != 0 {
        state.refs.retain(|r| *r != ptr.ref_obj_id);
    }
}
