// SPDX-License-Identifier: GPL-2.0

//! Program disassembler
//!
//! Renders instructions in the syntax of the kernel verifier log, e.g.
//! `r1 = *(u32 *)(r2 +12)` or `if r3 > r4 goto +5`.

use std::fmt::Write;

use crate::bounds::range_refine::BranchCond;
use crate::core::types::*;

/// Disassembly options
#[derive(Debug, Clone)]
pub struct DisasmOptions {
    /// Prefix each line with its instruction index
    pub show_offsets: bool,
    /// Append the raw encoding
    pub show_bytecode: bool,
    /// Print absolute jump targets next to relative ones
    pub annotate_jumps: bool,
}

impl Default for DisasmOptions {
    fn default() -> Self {
        Self {
            show_offsets: true,
            show_bytecode: false,
            annotate_jumps: true,
        }
    }
}

impl DisasmOptions {
    /// Enable bytecode display
    pub fn with_bytecode(mut self) -> Self {
        self.show_bytecode = true;
        self
    }

    /// Disable offset display
    pub fn without_offsets(mut self) -> Self {
        self.show_offsets = false;
        self
    }
}

fn size_name(size: u8) -> &'static str {
    match size {
        BPF_B => "u8",
        BPF_H => "u16",
        BPF_W => "u32",
        _ => "u64",
    }
}

fn alu_symbol(op: u8) -> &'static str {
    match op {
        BPF_ADD => "+=",
        BPF_SUB => "-=",
        BPF_MUL => "*=",
        BPF_DIV => "/=",
        BPF_OR => "|=",
        BPF_AND => "&=",
        BPF_LSH => "<<=",
        BPF_RSH => ">>=",
        BPF_MOD => "%=",
        BPF_XOR => "^=",
        BPF_MOV => "=",
        BPF_ARSH => "s>>=",
        _ => "?=",
    }
}

fn atomic_name(imm: i32) -> &'static str {
    match imm & !BPF_FETCH {
        x if x == i32::from(BPF_ADD) => "add",
        x if x == i32::from(BPF_OR) => "or",
        x if x == i32::from(BPF_AND) => "and",
        x if x == i32::from(BPF_XOR) => "xor",
        0xe0 => "xchg",
        0xf0 => "cmpxchg",
        _ => "atomic?",
    }
}

/// Render one instruction without index or annotations.
///
/// `next` is the following instruction, needed for 64-bit immediates.
pub fn fmt_insn_body(insn: &Insn, next: Option<&Insn>) -> String {
    let mut s = String::new();
    let dst = insn.dst_reg;
    let src = insn.src_reg;
    match insn.class() {
        BPF_ALU | BPF_ALU64 => {
            let r = if insn.class() == BPF_ALU64 { "r" } else { "w" };
            match insn.op() {
                BPF_NEG => {
                    let _ = write!(s, "{r}{dst} = -{r}{dst}");
                }
                BPF_END => {
                    let dir = if insn.src() == BPF_TO_BE { "be" } else { "le" };
                    let _ = write!(s, "r{dst} = {dir}{} r{dst}", insn.imm);
                }
                op => {
                    if insn.src() == BPF_X {
                        let _ = write!(s, "{r}{dst} {} {r}{src}", alu_symbol(op));
                    } else {
                        let _ = write!(s, "{r}{dst} {} {}", alu_symbol(op), insn.imm);
                    }
                }
            }
        }
        BPF_LDX => {
            let _ = write!(
                s,
                "r{dst} = *({} *)(r{src} {:+})",
                size_name(insn.size()),
                insn.off
            );
        }
        BPF_ST => {
            let _ = write!(
                s,
                "*({} *)(r{dst} {:+}) = {}",
                size_name(insn.size()),
                insn.off,
                insn.imm
            );
        }
        BPF_STX if insn.mode() == BPF_ATOMIC => {
            let fetch = if insn.imm & BPF_FETCH != 0 && insn.imm != BPF_XCHG && insn.imm != BPF_CMPXCHG {
                "_fetch"
            } else {
                ""
            };
            let _ = write!(
                s,
                "lock *({} *)(r{dst} {:+}) {}{} r{src}",
                size_name(insn.size()),
                insn.off,
                atomic_name(insn.imm),
                fetch
            );
        }
        BPF_STX => {
            let _ = write!(
                s,
                "*({} *)(r{dst} {:+}) = r{src}",
                size_name(insn.size()),
                insn.off
            );
        }
        BPF_LD if insn.is_ld_imm64() => {
            if src == PSEUDO_MAP_IDX {
                let _ = write!(s, "r{dst} = map[{}]", insn.imm);
            } else {
                let hi = next.map_or(0, |n| n.imm as u32);
                let v = (u64::from(hi) << 32) | u64::from(insn.imm as u32);
                let _ = write!(s, "r{dst} = {v:#x} ll");
            }
        }
        BPF_JMP | BPF_JMP32 => match insn.op() {
            BPF_JA => {
                let _ = write!(s, "goto {:+}", insn.off);
            }
            BPF_EXIT => s.push_str("exit"),
            BPF_CALL => match Helper::from_id(insn.imm) {
                Some(h) => {
                    let _ = write!(s, "call {}#{}", h.name(), insn.imm);
                }
                None => {
                    let _ = write!(s, "call #{}", insn.imm);
                }
            },
            op => {
                let r = if insn.class() == BPF_JMP { "r" } else { "w" };
                let sym = BranchCond::from_opcode(op).map_or("?", |c| c.symbol());
                if insn.src() == BPF_X {
                    let _ = write!(s, "if {r}{dst} {sym} {r}{src} goto {:+}", insn.off);
                } else {
                    let _ = write!(s, "if {r}{dst} {sym} {:#x} goto {:+}", insn.imm, insn.off);
                }
            }
        },
        _ => {
            let _ = write!(s, "(bad {:#04x})", insn.code);
        }
    }
    s
}

/// Disassemble a single instruction
pub fn disasm_insn(insns: &[Insn], idx: usize, opts: &DisasmOptions) -> String {
    let mut s = String::new();
    let Some(insn) = insns.get(idx) else {
        return s;
    };
    if opts.show_offsets {
        let _ = write!(s, "{idx:4}: ");
    }
    s.push_str(&fmt_insn_body(insn, insns.get(idx + 1)));
    if opts.annotate_jumps && (insn.is_ja() || insn.is_cond_jump()) {
        let target = idx as i64 + 1 + i64::from(insn.off);
        let _ = write!(s, " <{target}>");
    }
    if opts.show_bytecode {
        let _ = write!(
            s,
            "    ; {:02x} {:x}{:x} {:04x} {:08x}",
            insn.code, insn.src_reg, insn.dst_reg, insn.off as u16, insn.imm as u32
        );
    }
    s
}

/// Disassemble a whole program, one instruction per line
pub fn disasm_program(insns: &[Insn], opts: &DisasmOptions) -> String {
    let mut out = String::new();
    let mut idx = 0;
    while idx < insns.len() {
        out.push_str(&disasm_insn(insns, idx, opts));
        out.push('\n');
        idx += if insns[idx].is_ld_imm64() { 2 } else { 1 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ldx_format() {
        let insn = Insn::new(BPF_LDX | BPF_MEM | BPF_W, 1, 2, 12, 0);
        assert_eq!(fmt_insn_body(&insn, None), "r1 = *(u32 *)(r2 +12)");
    }

    #[test]
    fn test_jump_format() {
        let insn = Insn::new(BPF_JMP | BPF_JGT | BPF_X, 3, 4, 5, 0);
        assert_eq!(fmt_insn_body(&insn, None), "if r3 > r4 goto +5");
    }

    #[test]
    fn test_call_format() {
        let insn = Insn::new(BPF_JMP | BPF_CALL, 0, 0, 0, 1);
        assert_eq!(fmt_insn_body(&insn, None), "call map_lookup_elem#1");
    }

    #[test]
    fn test_program_skips_imm64_tail() {
        let prog = [
            Insn::new(BPF_LD | BPF_IMM | BPF_DW, 1, 0, 0, 5),
            Insn::new(0, 0, 0, 0, 0),
            Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0),
        ];
        let text = disasm_program(&prog, &DisasmOptions::default().without_offsets());
        assert_eq!(text, "r1 = 0x5 ll\nexit\n");
    }
}
