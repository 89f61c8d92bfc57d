// SPDX-License-Identifier: GPL-2.0

//! Atomic instruction verification
//!
//! `add/or/and/xor` with optional fetch, `xchg` and `cmpxchg` on 4 or 8
//! aligned bytes of a map value or the stack. The operand must be a scalar.

use super::load_store::stack_error;
use super::src_reg;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::types::*;
use crate::mem::check_mem_region;
use crate::state::reg_state::RegState;
use crate::verifier::env::VerifierEnv;

/// Check if instruction is a compare-and-exchange
pub fn is_cmpxchg(insn: &Insn) -> bool {
    insn.imm == BPF_CMPXCHG
}

/// Check if instruction is an exchange
pub fn is_xchg(insn: &Insn) -> bool {
    insn.imm == BPF_XCHG
}

/// Check if the old value is loaded back into a register
pub fn has_fetch(insn: &Insn) -> bool {
    insn.imm & BPF_FETCH != 0
}

/// Access size in bytes
pub fn atomic_size(insn: &Insn) -> usize {
    bytes_for_size(insn.size())
}

/// Name of the atomic operation for logs
pub fn atomic_op_name(imm: i32) -> &'static str {
    if imm == BPF_XCHG {
        return "xchg";
    }
    if imm == BPF_CMPXCHG {
        return "cmpxchg";
    }
    let fetch = imm & BPF_FETCH != 0;
    match ((imm & !BPF_FETCH) as u8, fetch) {
        (BPF_ADD, false) => "add",
        (BPF_ADD, true) => "fetch_add",
        (BPF_OR, false) => "or",
        (BPF_OR, true) => "fetch_or",
        (BPF_AND, false) => "and",
        (BPF_AND, true) => "fetch_and",
        (BPF_XOR, false) => "xor",
        (BPF_XOR, true) => "fetch_xor",
        _ => "unknown",
    }
}

/// Check an atomic instruction
pub fn check_atomic(env: &mut VerifierEnv<'_>, insn_idx: usize, insn: &Insn) -> Result<()> {
    let size = atomic_size(insn);
    let ptr = src_reg(&env.cur_state, insn_idx, insn.dst_reg)?;
    let operand = src_reg(&env.cur_state, insn_idx, insn.src_reg)?;
    if !operand.is_scalar() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "atomic {} operand R{} must be a scalar",
            atomic_op_name(insn.imm),
            insn.src_reg
        ));
    }
    if is_cmpxchg(insn) {
        let r0 = src_reg(&env.cur_state, insn_idx, REG_0 as u8)?;
        if !r0.is_scalar() {
            return Err(reject!(insn_idx, TypeMismatch, "cmpxchg comparand R0 must be a scalar"));
        }
    }
    if ptr.maybe_null() {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "atomic access through {}_or_null",
            ptr.reg_type.name()
        ));
    }

    let fixed = i64::from(ptr.off) + i64::from(insn.off);
    let var_bits = ptr.bounds.var_off.value | ptr.bounds.var_off.mask;
    if fixed.rem_euclid(size as i64) != 0 || var_bits & (size as u64 - 1) != 0 {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "misaligned atomic access off={} size={}",
            fixed,
            size
        ));
    }

    match ptr.reg_type {
        RegType::PtrToStack => {
            let off = fixed as i32;
            let old = env
                .cur_state
                .stack
                .read(off, size)
                .map_err(|e| stack_error(insn_idx, off, size, e))?;
            if old.is_pointer() {
                return Err(reject!(insn_idx, TypeMismatch, "atomic access to spilled pointer at fp{}", off));
            }
            env.cur_state
                .stack
                .write_misc(off, size)
                .map_err(|e| stack_error(insn_idx, off, size, e))?;
        }
        RegType::PtrToMapValue => {
            let Some(schema) = env.map_schema(ptr.map_idx) else {
                return Err(reject!(insn_idx, MapSchemaMismatch, "no map at index {}", ptr.map_idx));
            };
            check_mem_region(insn_idx, &ptr, i32::from(insn.off), size, schema.value_size)?;
        }
        other => {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "atomic access to {} prohibited",
                other.name()
            ))
        }
    }

    let loaded = RegState::scalar(ScalarBounds::of_width(size));
    if is_cmpxchg(insn) {
        env.cur_state.regs[REG_0] = loaded;
    } else if has_fetch(insn) {
        env.cur_state.regs[insn.src_reg as usize] = loaded;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_names() {
        assert_eq!(atomic_op_name(i32::from(BPF_ADD)), "add");
        assert_eq!(atomic_op_name(i32::from(BPF_XOR) | BPF_FETCH), "fetch_xor");
        assert_eq!(atomic_op_name(BPF_XCHG), "xchg");
        assert_eq!(atomic_op_name(BPF_CMPXCHG), "cmpxchg");
    }

    #[test]
    fn test_fetch_flags() {
        let add = Insn::new(BPF_STX | BPF_ATOMIC | BPF_DW, 1, 2, 0, i32::from(BPF_ADD));
        assert!(!has_fetch(&add));
        let xchg = Insn::new(BPF_STX | BPF_ATOMIC | BPF_W, 1, 2, 0, BPF_XCHG);
        assert!(has_fetch(&xchg));
        assert!(is_xchg(&xchg));
        assert_eq!(atomic_size(&xchg), 4);
    }
}
