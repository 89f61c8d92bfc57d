// SPDX-License-Identifier: GPL-2.0

//! ALU instruction verification
//!
//! Scalars go through the bounds transfer functions. Pointers only accept
//! 64-bit add and subtract of scalars, plus the two packet pointer
//! differences that yield a length.

use super::src_reg;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::types::*;
use crate::state::reg_state::RegState;
use crate::verifier::env::VerifierEnv;

/// Largest fixed offset a pointer may accumulate
const MAX_PTR_OFF: u64 = 1 << 29;

/// Check an ALU or ALU64 instruction and update the destination register
pub fn check_alu_op(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let is64 = insn.class() == BPF_ALU64;
    let op = insn.op();
    let dst = insn.dst_reg as usize;

    match op {
        BPF_END | BPF_NEG => return check_end_neg_op(env, insn_idx, insn),
        BPF_MOV => return check_mov_op(env, insn_idx, insn),
        _ => {}
    }

    let dst_reg = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    let src = if insn.src() == BPF_X {
        src_reg(&env.cur_state, insn_idx, insn.src_reg)?
    } else {
        RegState::known(i64::from(insn.imm) as u64)
    };

    if dst_reg.is_pointer() || src.is_pointer() {
        if !is64 {
            return Err(reject!(insn_idx, TypeMismatch, "32-bit arithmetic on pointer prohibited"));
        }
        let result = adjust_ptr_min_max_vals(env, insn_idx, op, &dst_reg, &src)?;
        env.cur_state.regs[dst] = result;
        return Ok(());
    }

    let bounds = if is64 {
        dst_reg.bounds.alu64(op, &src.bounds)
    } else {
        dst_reg.bounds.alu32(op, &src.bounds)
    };
    env.cur_state.regs[dst] = RegState::scalar(bounds);
    Ok(())
}

fn check_end_neg_op(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let dst = insn.dst_reg as usize;
    let reg = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    if !reg.is_scalar() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "R{} pointer arithmetic prohibited",
            insn.dst_reg
        ));
    }
    let bounds = if insn.op() == BPF_END {
        reg.bounds.endian(insn.src() == BPF_TO_BE, insn.imm as u32)
    } else if insn.class() == BPF_ALU64 {
        reg.bounds.neg()
    } else {
        reg.bounds.alu32(BPF_NEG, &ScalarBounds::known(0))
    };
    env.cur_state.regs[dst] = RegState::scalar(bounds);
    Ok(())
}

fn check_mov_op(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let dst = insn.dst_reg as usize;
    let is64 = insn.class() == BPF_ALU64;
    let result = if insn.src() == BPF_X {
        let src = src_reg(&env.cur_state, insn_idx, insn.src_reg)?;
        if is64 {
            src
        } else if src.is_pointer() {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "R{} partial copy of pointer",
                insn.src_reg
            ));
        } else {
            RegState::scalar(src.bounds.subreg())
        }
    } else if is64 {
        RegState::known(i64::from(insn.imm) as u64)
    } else {
        RegState::known(u64::from(insn.imm as u32))
    };
    env.cur_state.regs[dst] = result;
    Ok(())
}

/// Pointer arithmetic: `ptr op scalar`, `scalar + ptr` or `ptr - ptr`
fn adjust_ptr_min_max_vals(
    env: &mut VerifierEnv<'_>,
    insn_idx: usize,
    op: u8,
    dst: &RegState,
    src: &RegState,
) -> Result<RegState> {
    if dst.is_pointer() && src.is_pointer() {
        return handle_ptr_sub_ptr(insn_idx, op, dst, src);
    }
    let (ptr, scalar) = if dst.is_pointer() {
        (dst, src)
    } else {
        if op != BPF_ADD {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "scalar {} pointer prohibited",
                op_name(op)
            ));
        }
        (src, dst)
    };
    if op != BPF_ADD && op != BPF_SUB {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "{} on pointer {} prohibited",
            op_name(op),
            ptr.reg_type.name()
        ));
    }
    check_ptr_arith_allowed(insn_idx, ptr)?;

    let mut result = *ptr;
    if let Some(c) = scalar.bounds.const_value() {
        let delta = c as i64;
        let off = if op == BPF_ADD {
            i64::from(ptr.off).checked_add(delta)
        } else {
            i64::from(ptr.off).checked_sub(delta)
        };
        match off {
            Some(off) if off.unsigned_abs() < MAX_PTR_OFF => result.off = off as i32,
            _ => {
                return Err(reject!(
                    insn_idx,
                    OutOfBoundsAccess,
                    "pointer offset {} out of range",
                    delta
                ))
            }
        }
        return Ok(result);
    }

    match ptr.reg_type {
        RegType::PtrToPacket => {
            if op != BPF_ADD {
                return Err(reject!(
                    insn_idx,
                    TypeMismatch,
                    "cannot subtract variable offset from packet pointer"
                ));
            }
            if !scalar.bounds.is_non_negative() || scalar.bounds.umax_value > MAX_PACKET_OFF {
                return Err(reject!(
                    insn_idx,
                    OutOfBoundsAccess,
                    "packet offset must be in [0, {}], got [{}, {}]",
                    MAX_PACKET_OFF,
                    scalar.bounds.smin_value,
                    scalar.bounds.umax_value
                ));
            }
            result.bounds = ptr.bounds.add(&scalar.bounds);
            result.id = env.new_id();
            result.range = 0;
        }
        RegType::PtrToMapValue | RegType::PtrToRingbufRecord => {
            result.bounds = if op == BPF_ADD {
                ptr.bounds.add(&scalar.bounds)
            } else {
                ptr.bounds.sub(&scalar.bounds)
            };
        }
        other => {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "variable offset on {} pointer prohibited",
                other.name()
            ))
        }
    }
    Ok(result)
}

fn check_ptr_arith_allowed(insn_idx: usize, ptr: &RegState) -> Result<()> {
    if ptr.maybe_null() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "pointer arithmetic on {}_or_null prohibited, null-check it first",
            ptr.reg_type.name()
        ));
    }
    match ptr.reg_type {
        RegType::PtrToPacketEnd | RegType::ConstPtrToMap => Err(reject!(
            insn_idx,
            TypeMismatch,
            "pointer arithmetic on {} prohibited",
            ptr.reg_type.name()
        )),
        _ => Ok(()),
    }
}

/// `pkt - pkt` and `pkt_end - pkt` give a scalar length
fn handle_ptr_sub_ptr(insn_idx: usize, op: u8, dst: &RegState, src: &RegState) -> Result<RegState> {
    let packet_pair = matches!(
        (dst.reg_type, src.reg_type),
        (RegType::PtrToPacket, RegType::PtrToPacket) | (RegType::PtrToPacketEnd, RegType::PtrToPacket)
    );
    if op != BPF_SUB || !packet_pair {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "{} between {} and {} prohibited",
            op_name(op),
            dst.reg_type.name(),
            src.reg_type.name()
        ));
    }
    Ok(RegState::unknown_scalar())
}

fn op_name(op: u8) -> &'static str {
    match op {
        BPF_ADD => "add",
        BPF_SUB => "sub",
        BPF_MUL => "mul",
        BPF_DIV => "div",
        BPF_OR => "or",
        BPF_AND => "and",
        BPF_LSH => "lsh",
        BPF_RSH => "rsh",
        BPF_MOD => "mod",
        BPF_XOR => "xor",
        BPF_ARSH => "arsh",
        _ => "op",
    }
}
