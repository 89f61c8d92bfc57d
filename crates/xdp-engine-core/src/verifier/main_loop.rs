// SPDX-License-Identifier: GPL-2.0

//! Main verification loop
//!
//! Walks every feasible path depth first. A conditional jump with two
//! feasible edges queues the fall-through edge and continues on the taken
//! one; `exit` and pruned states pop the next queued path.

use crate::analysis::cfg::jump_target;
use crate::check::alu::check_alu_op;
use crate::check::atomic::check_atomic;
use crate::check::helper::check_helper_call;
use crate::check::jump::check_cond_jmp_op;
use crate::check::load_store::{check_ld_imm64, check_ldx, check_st, check_stx};
use crate::check::retval::check_return_code;
use crate::check::InsnResult;
use crate::core::error::{reject, Result};
use crate::core::log::{log_insn, log_prune};
use crate::core::types::*;

use super::env::VerifierEnv;

/// Explore every path from the entry instruction
pub fn do_check(env: &mut VerifierEnv<'_>) -> Result<()> {
    loop {
        let idx = env.insn_idx;
        env.count_insn()?;

        if env.is_state_visited() {
            log_prune(&mut env.log, idx);
            if !env.pop_state() {
                break;
            }
            continue;
        }

        let Some(insn) = env.insn(idx).copied() else {
            return Err(reject!(idx, MalformedProgram, "fell off the end of the program"));
        };
        log_insn(&mut env.log, env.insns, idx, &env.cur_state);

        let step = if insn.is_ld_imm64() { 2 } else { 1 };
        match do_check_insn(env, idx, &insn).map_err(|e| e.or_at(idx))? {
            InsnResult::Continue => env.advance(idx, idx + step)?,
            InsnResult::Jump(target) => env.advance(idx, target)?,
            InsnResult::Exit => {
                if !env.pop_state() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Check one instruction against the current state
fn do_check_insn(env: &mut VerifierEnv<'_>, idx: usize, insn: &Insn) -> Result<InsnResult> {
    match insn.class() {
        BPF_ALU | BPF_ALU64 => check_alu_op(env, idx, insn)?,
        BPF_LDX => check_ldx(env, idx, insn)?,
        BPF_ST => check_st(env, idx, insn)?,
        BPF_STX if insn.mode() == BPF_ATOMIC => check_atomic(env, idx, insn)?,
        BPF_STX => check_stx(env, idx, insn)?,
        BPF_LD => check_ld_imm64(env, idx, insn)?,
        BPF_JMP | BPF_JMP32 => return check_jmp(env, idx, insn),
        _ => return Err(reject!(idx, MalformedProgram, "unknown insn class {:#x}", insn.code)),
    }
    Ok(InsnResult::Continue)
}

fn check_jmp(env: &mut VerifierEnv<'_>, idx: usize, insn: &Insn) -> Result<InsnResult> {
    if insn.is_ja() {
        let Some(target) = jump_target(idx, insn, env.insns.len()) else {
            return Err(reject!(idx, MalformedProgram, "jump out of range"));
        };
        return Ok(InsnResult::Jump(target));
    }
    if insn.is_call() {
        check_helper_call(env, idx, insn)?;
        return Ok(InsnResult::Continue);
    }
    if insn.is_exit() {
        check_return_code(&env.cur_state, env.attach, idx)?;
        return Ok(InsnResult::Exit);
    }
    check_cond_jmp_op(env, idx, insn)
}
