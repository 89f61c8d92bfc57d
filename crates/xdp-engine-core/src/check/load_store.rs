// SPDX-License-Identifier: GPL-2.0

//! Load and store verification
//!
//! Every memory instruction goes through [`check_mem_access`], which
//! dispatches on the base pointer type. Pointers may be stored to the stack
//! only; everything else accepts scalars.

use super::src_reg;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Rejection, Result};
use crate::core::types::*;
use crate::mem::{check_ctx_access, check_mem_region, check_packet_access};
use crate::state::reg_state::RegState;
use crate::state::stack_state::StackError;
use crate::verifier::env::VerifierEnv;

/// Direction of a memory access
#[derive(Debug, Clone, Copy)]
pub enum Access<'r> {
    /// Load into a register
    Read,
    /// Store of the given register
    Write(&'r RegState),
}

/// Translate a stack error at `off` into a rejection
pub(crate) fn stack_error(insn_idx: usize, off: i32, size: usize, err: StackError) -> Rejection {
    match err {
        StackError::OutOfBounds => reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid stack access off={} size={}",
            off,
            size
        ),
        StackError::Uninit(at) => reject!(
            insn_idx,
            UninitializedRead,
            "invalid read from stack off {}+{} size {}",
            off,
            at - off,
            size
        ),
        StackError::PointerBytes(at) => reject!(
            insn_idx,
            TypeMismatch,
            "partial access to spilled pointer at fp{}",
            at
        ),
    }
}

/// Check an access through `ptr` at `insn_off`. Returns the loaded value for
/// reads and the stored value for writes.
pub fn check_mem_access(
    env: &mut VerifierEnv<'_>,
    insn_idx: usize,
    ptr: &RegState,
    insn_off: i32,
    size: usize,
    access: Access<'_>,
) -> Result<RegState> {
    if ptr.maybe_null() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "invalid mem access '{}_or_null'",
            ptr.reg_type.name()
        ));
    }
    let value = match access {
        Access::Read => None,
        Access::Write(v) => Some(v),
    };
    if let Some(v) = value {
        if v.is_pointer() && ptr.reg_type != RegType::PtrToStack {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "cannot store {} pointer into {}",
                v.reg_type.name(),
                ptr.reg_type.name()
            ));
        }
    }

    match ptr.reg_type {
        RegType::PtrToCtx => {
            if !ptr.bounds.is_const() {
                return Err(reject!(insn_idx, TypeMismatch, "variable ctx access prohibited"));
            }
            check_ctx_access(insn_idx, ptr.off + insn_off, size, value)
        }
        RegType::PtrToStack => {
            let off = ptr.off + insn_off;
            let loaded = match value {
                Some(v) => env
                    .cur_state
                    .stack
                    .write_reg(off, size, v)
                    .map(|()| *v),
                None => env.cur_state.stack.read(off, size),
            }
            .map_err(|e| stack_error(insn_idx, off, size, e))?;
            let depth = off.unsigned_abs() as usize;
            env.stats.stack_depth = env.stats.stack_depth.max(depth);
            Ok(loaded)
        }
        RegType::PtrToPacket => {
            if value.is_some() && !env.attach.allows_packet_write() {
                return Err(reject!(
                    insn_idx,
                    TypeMismatch,
                    "cannot write into packet from {} program",
                    env.attach
                ));
            }
            check_packet_access(insn_idx, ptr, insn_off, size)?;
            Ok(loaded_or_stored(value, size))
        }
        RegType::PtrToMapValue => {
            let Some(schema) = env.map_schema(ptr.map_idx) else {
                return Err(reject!(insn_idx, MapSchemaMismatch, "no map at index {}", ptr.map_idx));
            };
            check_mem_region(insn_idx, ptr, insn_off, size, schema.value_size)?;
            Ok(loaded_or_stored(value, size))
        }
        RegType::PtrToRingbufRecord => {
            check_mem_region(insn_idx, ptr, insn_off, size, ptr.mem_size)?;
            Ok(loaded_or_stored(value, size))
        }
        RegType::NotInit => Err(reject!(insn_idx, UninitializedRead, "memory access through uninitialized register")),
        other => Err(reject!(insn_idx, TypeMismatch, "invalid mem access '{}'", other.name())),
    }
}

fn loaded_or_stored(value: Option<&RegState>, size: usize) -> RegState {
    match value {
        Some(v) => *v,
        None => RegState::scalar(ScalarBounds::of_width(size)),
    }
}

/// `dst = *(size *)(src + off)`
pub fn check_ldx(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let ptr = src_reg(&env.cur_state, insn_idx, insn.src_reg)?;
    let size = bytes_for_size(insn.size());
    let value = check_mem_access(env, insn_idx, &ptr, i32::from(insn.off), size, Access::Read)?;
    env.cur_state.regs[insn.dst_reg as usize] = value;
    Ok(())
}

/// `*(size *)(dst + off) = src`
pub fn check_stx(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let ptr = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    let value = src_reg(&env.cur_state, insn_idx, insn.src_reg)?;
    let size = bytes_for_size(insn.size());
    check_mem_access(env, insn_idx, &ptr, i32::from(insn.off), size, Access::Write(&value))?;
    Ok(())
}

/// `*(size *)(dst + off) = imm`
pub fn check_st(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let ptr = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    let size = bytes_for_size(insn.size());
    let mut imm = i64::from(insn.imm) as u64;
    if size < REG_SIZE {
        imm &= (1u64 << (size * 8)) - 1;
    }
    let value = RegState::known(imm);
    check_mem_access(env, insn_idx, &ptr, i32::from(insn.off), size, Access::Write(&value))?;
    Ok(())
}

/// 64-bit immediate and map handle loads
pub fn check_ld_imm64(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let dst = insn.dst_reg as usize;
    if insn.src_reg == PSEUDO_MAP_IDX {
        let map_idx = insn.imm as u32;
        if env.map_schema(map_idx).is_none() {
            return Err(reject!(
                insn_idx,
                MapSchemaMismatch,
                "map index {} not declared by the program",
                insn.imm
            ));
        }
        env.cur_state.regs[dst] = RegState::map_ptr(map_idx);
        return Ok(());
    }
    let Some(next) = env.insn(insn_idx + 1) else {
        return Err(reject!(insn_idx, MalformedProgram, "incomplete 64-bit immediate load"));
    };
    let value = (u64::from(next.imm as u32) << 32) | u64::from(insn.imm as u32);
    env.cur_state.regs[dst] = RegState::known(value);
    Ok(())
}
