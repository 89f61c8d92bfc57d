// SPDX-License-Identifier: GPL-2.0

//! Bytecode interpreter
//!
//! Executes a verified program one instruction at a time. Every memory
//! access is still checked against its region at run time.

use std::sync::Arc;

use crate::core::error::ExecutionError;
use crate::core::types::*;
use crate::maps::Map;
use crate::program::AttachKind;

use super::clock::Clock;
use super::memory::{tag, Memory, REGION_MAP_HANDLE};

type Result<T> = std::result::Result<T, ExecutionError>;

/// Register file and program counter of one run
pub(crate) struct Interpreter<'m, 'p> {
    pub(super) insns: &'p [Insn],
    pub(super) maps: &'p [Arc<Map>],
    pub(super) attach: AttachKind,
    pub(super) mem: Memory<'m, 'p>,
    pub(super) clock: &'m dyn Clock,
    pub(super) worker: usize,
    pub(super) regs: [u64; MAX_REG],
    pub(super) redirect: Option<u32>,
    budget: u64,
}

/// Final state of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) code: u64,
    pub(crate) redirect: Option<u32>,
    pub(crate) steps: u64,
}

fn alu64(op: u8, dst: u64, src: u64) -> Option<u64> {
    Some(match op {
        BPF_ADD => dst.wrapping_add(src),
        BPF_SUB => dst.wrapping_sub(src),
        BPF_MUL => dst.wrapping_mul(src),
        BPF_DIV => dst.checked_div(src).unwrap_or(0),
        BPF_OR => dst | src,
        BPF_AND => dst & src,
        BPF_LSH => dst.wrapping_shl(src as u32 & 63),
        BPF_RSH => dst.wrapping_shr(src as u32 & 63),
        BPF_NEG => dst.wrapping_neg(),
        BPF_MOD => dst.checked_rem(src).unwrap_or(dst),
        BPF_XOR => dst ^ src,
        BPF_MOV => src,
        BPF_ARSH => ((dst as i64) >> (src & 63)) as u64,
        _ => return None,
    })
}

fn alu32(op: u8, dst: u32, src: u32) -> Option<u32> {
    Some(match op {
        BPF_ADD => dst.wrapping_add(src),
        BPF_SUB => dst.wrapping_sub(src),
        BPF_MUL => dst.wrapping_mul(src),
        BPF_DIV => dst.checked_div(src).unwrap_or(0),
        BPF_OR => dst | src,
        BPF_AND => dst & src,
        BPF_LSH => dst.wrapping_shl(src & 31),
        BPF_RSH => dst.wrapping_shr(src & 31),
        BPF_NEG => dst.wrapping_neg(),
        BPF_MOD => dst.checked_rem(src).unwrap_or(dst),
        BPF_XOR => dst ^ src,
        BPF_MOV => src,
        BPF_ARSH => ((dst as i32) >> (src & 31)) as u32,
        _ => return None,
    })
}

fn endian(insn: &Insn, val: u64) -> Option<u64> {
    let to_be = insn.src() == BPF_TO_BE;
    Some(match (insn.imm, to_be) {
        (16, false) => val & 0xffff,
        (32, false) => val & 0xffff_ffff,
        (64, false) => val,
        (16, true) => u64::from((val as u16).swap_bytes()),
        (32, true) => u64::from((val as u32).swap_bytes()),
        (64, true) => val.swap_bytes(),
        _ => return None,
    })
}

fn cond(op: u8, dst: u64, src: u64, is32: bool) -> Option<bool> {
    let (a, b) = if is32 {
        (u64::from(dst as u32), u64::from(src as u32))
    } else {
        (dst, src)
    };
    let (sa, sb) = if is32 {
        (i64::from(dst as i32), i64::from(src as i32))
    } else {
        (dst as i64, src as i64)
    };
    Some(match op {
        BPF_JEQ => a == b,
        BPF_JNE => a != b,
        BPF_JGT => a > b,
        BPF_JGE => a >= b,
        BPF_JLT => a < b,
        BPF_JLE => a <= b,
        BPF_JSET => a & b != 0,
        BPF_JSGT => sa > sb,
        BPF_JSGE => sa >= sb,
        BPF_JSLT => sa < sb,
        BPF_JSLE => sa <= sb,
        _ => return None,
    })
}

fn offset_addr(base: u64, off: i16) -> u64 {
    base.wrapping_add(i64::from(off) as u64)
}

fn rel_target(pc: usize, off: i64, len: usize) -> Option<usize> {
    let t = i64::try_from(pc).ok()? + 1 + off;
    usize::try_from(t).ok().filter(|t| *t < len)
}

impl<'m, 'p> Interpreter<'m, 'p> {
    pub(crate) fn new(
        insns: &'p [Insn],
        maps: &'p [Arc<Map>],
        attach: AttachKind,
        mem: Memory<'m, 'p>,
        clock: &'m dyn Clock,
        worker: usize,
        budget: u64,
    ) -> Self {
        let mut regs = [0u64; MAX_REG];
        regs[REG_1] = mem.ctx_ptr();
        regs[REG_FP] = mem.frame_ptr();
        Self {
            insns,
            maps,
            attach,
            mem,
            clock,
            worker,
            regs,
            redirect: None,
            budget,
        }
    }

    /// Run to `exit`. Open reservations are discarded either way.
    pub(crate) fn run(mut self) -> Result<Outcome> {
        let result = self.execute();
        let open = self.mem.discard_open();
        let outcome = result?;
        if open > 0 {
            return Err(ExecutionError::UnreleasedReservation);
        }
        Ok(outcome)
    }

    fn invalid(pc: usize) -> ExecutionError {
        ExecutionError::InvalidInstruction { insn_idx: pc }
    }

    fn execute(&mut self) -> Result<Outcome> {
        let mut pc = 0usize;
        let mut steps = 0u64;
        loop {
            if steps >= self.budget {
                return Err(ExecutionError::BudgetExceeded { budget: self.budget });
            }
            steps += 1;
            let insn = *self.insns.get(pc).ok_or_else(|| Self::invalid(pc))?;
            let dst = insn.dst_reg as usize;
            let src = insn.src_reg as usize;
            if dst >= MAX_REG || src >= MAX_REG {
                return Err(Self::invalid(pc));
            }

            match insn.class() {
                BPF_ALU64 => {
                    let operand = if insn.src() == BPF_X {
                        self.regs[src]
                    } else {
                        i64::from(insn.imm) as u64
                    };
                    self.regs[dst] = alu64(insn.op(), self.regs[dst], operand).ok_or_else(|| Self::invalid(pc))?;
                }
                BPF_ALU if insn.op() == BPF_END => {
                    self.regs[dst] = endian(&insn, self.regs[dst]).ok_or_else(|| Self::invalid(pc))?;
                }
                BPF_ALU => {
                    let operand = if insn.src() == BPF_X {
                        self.regs[src] as u32
                    } else {
                        insn.imm as u32
                    };
                    let res = alu32(insn.op(), self.regs[dst] as u32, operand).ok_or_else(|| Self::invalid(pc))?;
                    self.regs[dst] = u64::from(res);
                }
                BPF_LDX => {
                    let size = bytes_for_size(insn.size());
                    let addr = offset_addr(self.regs[src], insn.off);
                    self.regs[dst] = self.mem.load(pc, addr, size)?;
                }
                BPF_ST => {
                    let size = bytes_for_size(insn.size());
                    let addr = offset_addr(self.regs[dst], insn.off);
                    self.mem.store(pc, addr, size, i64::from(insn.imm) as u64)?;
                }
                BPF_STX if insn.mode() == BPF_ATOMIC => self.atomic(pc, &insn)?,
                BPF_STX => {
                    let size = bytes_for_size(insn.size());
                    let addr = offset_addr(self.regs[dst], insn.off);
                    self.mem.store(pc, addr, size, self.regs[src])?;
                }
                BPF_LD if insn.is_ld_imm64() => {
                    let next = self.insns.get(pc + 1).ok_or_else(|| Self::invalid(pc))?;
                    self.regs[dst] = if insn.src_reg == PSEUDO_MAP_IDX {
                        tag(REGION_MAP_HANDLE, insn.imm as u32)
                    } else {
                        (u64::from(next.imm as u32) << 32) | u64::from(insn.imm as u32)
                    };
                    pc += 2;
                    continue;
                }
                BPF_JMP | BPF_JMP32 => {
                    let is32 = insn.class() == BPF_JMP32;
                    if !is32 && insn.is_exit() {
                        return Ok(Outcome {
                            code: self.regs[REG_0],
                            redirect: self.redirect,
                            steps,
                        });
                    }
                    if !is32 && insn.is_call() {
                        self.regs[REG_0] = self.call_helper(pc, insn.imm)?;
                        pc += 1;
                        continue;
                    }
                    let taken = if !is32 && insn.is_ja() {
                        true
                    } else {
                        let operand = if insn.src() == BPF_X {
                            self.regs[src]
                        } else {
                            i64::from(insn.imm) as u64
                        };
                        cond(insn.op(), self.regs[dst], operand, is32).ok_or_else(|| Self::invalid(pc))?
                    };
                    if taken {
                        pc = rel_target(pc, i64::from(insn.off), self.insns.len())
                            .ok_or_else(|| Self::invalid(pc))?;
                        continue;
                    }
                }
                _ => return Err(Self::invalid(pc)),
            }
            pc += 1;
        }
    }

    fn atomic(&mut self, pc: usize, insn: &Insn) -> Result<()> {
        let size = bytes_for_size(insn.size());
        let addr = offset_addr(self.regs[insn.dst_reg as usize], insn.off);
        let mask = if size == 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
        let operand = self.regs[insn.src_reg as usize] & mask;

        if insn.imm == BPF_CMPXCHG {
            let expected = self.regs[REG_0] & mask;
            let old = self
                .mem
                .fetch_update(pc, addr, size, |old| if old == expected { operand } else { old })?;
            self.regs[REG_0] = old;
            return Ok(());
        }
        let op = insn.imm & !BPF_FETCH;
        let old = if insn.imm == BPF_XCHG {
            self.mem.fetch_update(pc, addr, size, |_| operand)?
        } else {
            let f: fn(u64, u64) -> u64 = match op {
                x if x == i32::from(BPF_ADD) => u64::wrapping_add,
                x if x == i32::from(BPF_OR) => |a, b| a | b,
                x if x == i32::from(BPF_AND) => |a, b| a & b,
                x if x == i32::from(BPF_XOR) => |a, b| a ^ b,
                _ => return Err(Self::invalid(pc)),
            };
            self.mem.fetch_update(pc, addr, size, |old| f(old, operand))?
        };
        if insn.imm & BPF_FETCH != 0 {
            self.regs[insn.src_reg as usize] = old;
        }
        Ok(())
    }
}
