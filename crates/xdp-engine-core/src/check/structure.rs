// SPDX-License-Identifier: GPL-2.0

//! Structural program checks
//!
//! Run before any abstract interpretation: opcode and register validity,
//! jump targets, 64-bit immediate pairs and falling off the end.

use crate::analysis::cfg::{jump_target, ControlFlowGraph};
use crate::core::error::{reject, Rejection, RejectionReason, Result};
use crate::core::types::*;

fn malformed(idx: usize, msg: String) -> Rejection {
    Rejection::at(idx, RejectionReason::MalformedProgram, msg)
}

fn check_alu_insn(idx: usize, insn: &Insn) -> Result<()> {
    let is64 = insn.class() == BPF_ALU64;
    if insn.off != 0 {
        return Err(reject!(idx, MalformedProgram, "signed division and sign-extending moves are not supported"));
    }
    match insn.op() {
        BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_OR | BPF_AND | BPF_MOD | BPF_XOR | BPF_MOV => {}
        BPF_LSH | BPF_RSH | BPF_ARSH => {
            let bits = if is64 { 64 } else { 32 };
            if insn.src() == BPF_K && !(0..bits).contains(&insn.imm) {
                return Err(reject!(idx, MalformedProgram, "invalid shift {}", insn.imm));
            }
        }
        BPF_NEG => {
            if insn.src() != BPF_K || insn.src_reg != 0 {
                return Err(reject!(idx, MalformedProgram, "BPF_NEG uses reserved fields"));
            }
        }
        BPF_END => {
            if is64 {
                return Err(reject!(idx, MalformedProgram, "unconditional byte swap is not supported"));
            }
            if !matches!(insn.imm, 16 | 32 | 64) {
                return Err(reject!(idx, MalformedProgram, "invalid endian width {}", insn.imm));
            }
        }
        op => return Err(malformed(idx, format!("invalid ALU opcode {:#x}", op))),
    }
    if insn.src() == BPF_X && insn.op() != BPF_END {
        if insn.imm != 0 {
            return Err(reject!(idx, MalformedProgram, "BPF_ALU uses reserved fields"));
        }
    } else if insn.src_reg != 0 {
        return Err(reject!(idx, MalformedProgram, "BPF_ALU uses reserved fields"));
    }
    Ok(())
}

fn check_jmp_insn(idx: usize, insn: &Insn) -> Result<()> {
    let is32 = insn.class() == BPF_JMP32;
    match insn.op() {
        BPF_JA if !is32 => {
            if insn.src() != BPF_K || insn.src_reg != 0 || insn.dst_reg != 0 || insn.imm != 0 {
                return Err(reject!(idx, MalformedProgram, "BPF_JA uses reserved fields"));
            }
        }
        BPF_CALL if !is32 => match insn.src_reg {
            0 => {}
            PSEUDO_CALL => {
                return Err(reject!(idx, MalformedProgram, "calls to subprograms are not supported"))
            }
            _ => return Err(reject!(idx, MalformedProgram, "kernel function calls are not supported")),
        },
        BPF_EXIT if !is32 => {
            if insn.src_reg != 0 || insn.dst_reg != 0 || insn.imm != 0 || insn.off != 0 {
                return Err(reject!(idx, MalformedProgram, "BPF_EXIT uses reserved fields"));
            }
        }
        BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET | BPF_JNE | BPF_JSGT | BPF_JSGE | BPF_JLT
        | BPF_JLE | BPF_JSLT | BPF_JSLE => {
            if insn.src() == BPF_K && insn.src_reg != 0 {
                return Err(reject!(idx, MalformedProgram, "conditional jump uses reserved fields"));
            }
        }
        op => return Err(malformed(idx, format!("invalid jump opcode {:#x}", op))),
    }
    Ok(())
}

fn check_mem_insn(idx: usize, insn: &Insn) -> Result<()> {
    match (insn.class(), insn.mode()) {
        (BPF_LDX, BPF_MEM) | (BPF_STX, BPF_MEM) | (BPF_ST, BPF_MEM) => Ok(()),
        (BPF_LDX, BPF_MEMSX) => Err(reject!(idx, MalformedProgram, "sign-extending loads are not supported")),
        (BPF_STX, BPF_ATOMIC) => {
            if !matches!(insn.size(), BPF_W | BPF_DW) {
                return Err(reject!(idx, MalformedProgram, "atomic access must be 4 or 8 bytes"));
            }
            let imm = insn.imm;
            let base = imm & !BPF_FETCH;
            let rmw = [BPF_ADD, BPF_OR, BPF_AND, BPF_XOR]
                .iter()
                .any(|op| i32::from(*op) == base);
            if rmw || imm == BPF_XCHG || imm == BPF_CMPXCHG {
                Ok(())
            } else {
                Err(malformed(idx, format!("invalid atomic operation {:#x}", imm)))
            }
        }
        (_, mode) => Err(malformed(idx, format!("invalid memory mode {:#x}", mode))),
    }
}

/// Whether `insn` overwrites its destination register
fn writes_dst(insn: &Insn) -> bool {
    matches!(insn.class(), BPF_ALU | BPF_ALU64 | BPF_LDX) || insn.is_ld_imm64()
}

/// Check opcodes, registers, jump targets and immediate pairs
pub fn check_structure(insns: &[Insn], max_insns: usize) -> Result<()> {
    if insns.is_empty() {
        return Err(Rejection::program(RejectionReason::MalformedProgram, "empty program"));
    }
    if insns.len() > max_insns {
        return Err(Rejection::program(
            RejectionReason::MalformedProgram,
            format!("program of {} insns exceeds limit of {}", insns.len(), max_insns),
        ));
    }

    let mut second_slot = vec![false; insns.len()];
    let mut idx = 0;
    while idx < insns.len() {
        let insn = &insns[idx];
        if insn.dst_reg as usize >= MAX_REG || insn.src_reg as usize >= MAX_REG {
            return Err(reject!(idx, MalformedProgram, "invalid register number"));
        }
        if writes_dst(insn) && insn.dst_reg as usize == REG_FP {
            return Err(reject!(idx, MalformedProgram, "frame pointer is read only"));
        }
        match insn.class() {
            BPF_LD => {
                if !insn.is_ld_imm64() {
                    return Err(reject!(idx, MalformedProgram, "legacy packet loads are not supported"));
                }
                let Some(next) = insns.get(idx + 1) else {
                    return Err(reject!(idx, MalformedProgram, "incomplete 64-bit immediate load"));
                };
                if next.code != 0 || next.dst_reg != 0 || next.src_reg != 0 || next.off != 0 {
                    return Err(reject!(idx, MalformedProgram, "invalid second half of 64-bit immediate load"));
                }
                if insn.src_reg != 0 && insn.src_reg != PSEUDO_MAP_IDX {
                    return Err(reject!(idx, MalformedProgram, "unknown pseudo load {}", insn.src_reg));
                }
                if insn.off != 0 {
                    return Err(reject!(idx, MalformedProgram, "64-bit immediate load uses reserved fields"));
                }
                second_slot[idx + 1] = true;
                idx += 2;
                continue;
            }
            BPF_ALU | BPF_ALU64 => check_alu_insn(idx, insn)?,
            BPF_JMP | BPF_JMP32 => check_jmp_insn(idx, insn)?,
            _ => check_mem_insn(idx, insn)?,
        }
        idx += 1;
    }

    for (idx, insn) in insns.iter().enumerate() {
        if second_slot[idx] || !(insn.is_ja() || insn.is_cond_jump()) {
            continue;
        }
        match jump_target(idx, insn, insns.len()) {
            None => return Err(reject!(idx, MalformedProgram, "jump out of range {:+}", insn.off)),
            Some(t) if second_slot[t] => {
                return Err(reject!(idx, MalformedProgram, "jump into the middle of 64-bit immediate load"))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Check that no reachable instruction falls off the end of the program
pub fn check_fall_through(insns: &[Insn], cfg: &ControlFlowGraph) -> Result<()> {
    for &idx in &cfg.reachable {
        let insn = &insns[idx];
        if insn.is_exit() || insn.is_ja() {
            continue;
        }
        let step = if insn.is_ld_imm64() { 2 } else { 1 };
        if idx + step >= insns.len() {
            return Err(reject!(idx, MalformedProgram, "last insn is not an exit or jmp"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit() -> Insn {
        Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
    }

    fn mov(dst: u8, imm: i32) -> Insn {
        Insn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
    }

    fn reason(insns: &[Insn]) -> Option<RejectionReason> {
        check_structure(insns, 4096).err().map(|e| e.reason)
    }

    #[test]
    fn test_minimal_program() {
        assert_eq!(reason(&[mov(0, 2), exit()]), None);
    }

    #[test]
    fn test_empty_and_oversized() {
        assert_eq!(reason(&[]), Some(RejectionReason::MalformedProgram));
        let big = vec![mov(0, 0); 10];
        assert!(check_structure(&big, 4).is_err());
    }

    #[test]
    fn test_bad_register() {
        assert!(reason(&[mov(11, 0), exit()]).is_some());
        assert!(reason(&[mov(10, 0), exit()]).is_some());
    }

    #[test]
    fn test_jump_into_imm64() {
        let insns = [
            Insn::new(BPF_JMP | BPF_JA, 0, 0, 1, 0),
            Insn::new(BPF_LD | BPF_IMM | BPF_DW, 0, 0, 0, 1),
            Insn::new(0, 0, 0, 0, 0),
            exit(),
        ];
        assert_eq!(reason(&insns), Some(RejectionReason::MalformedProgram));
    }

    #[test]
    fn test_jump_out_of_range() {
        let insns = [Insn::new(BPF_JMP | BPF_JA, 0, 0, 5, 0), exit()];
        assert_eq!(reason(&insns), Some(RejectionReason::MalformedProgram));
    }

    #[test]
    fn test_unsupported_forms() {
        let legacy = Insn::new(BPF_LD | BPF_ABS | BPF_W, 0, 0, 0, 12);
        assert!(reason(&[legacy, exit()]).is_some());
        let subprog = Insn::new(BPF_JMP | BPF_CALL, 0, PSEUDO_CALL, 0, 1);
        assert!(reason(&[subprog, exit()]).is_some());
        let sx = Insn::new(BPF_LDX | BPF_MEMSX | BPF_W, 0, 1, 0, 0);
        assert!(reason(&[sx, exit()]).is_some());
    }

    #[test]
    fn test_falls_off_end() {
        let insns = [mov(0, 2)];
        check_structure(&insns, 16).unwrap();
        let cfg = ControlFlowGraph::build(&insns);
        assert!(check_fall_through(&insns, &cfg).is_err());

        let ok = [mov(0, 2), exit(), mov(0, 1)];
        let cfg = ControlFlowGraph::build(&ok);
        assert!(check_fall_through(&ok, &cfg).is_ok());
    }
}
