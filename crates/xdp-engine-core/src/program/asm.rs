// SPDX-License-Identifier: GPL-2.0

//! Assembler with labels
//!
//! ```
//! use xdp_engine_core::prelude::*;
//!
//! let mut a = Asm::new();
//! let out = a.label();
//! a.mov64_imm(0, XDP_PASS as i32)
//!     .jeq_imm(1, 0, out)
//!     .mov64_imm(0, XDP_DROP as i32)
//!     .bind(out)
//!     .exit();
//! let insns = a.finish().unwrap();
//! assert_eq!(insns.len(), 4);
//! ```

use crate::core::error::AsmError;
use crate::core::types::*;

/// A jump target, bound to an instruction index with [`Asm::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Instruction builder
#[derive(Debug, Default, Clone)]
pub struct Asm {
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    error: Option<AsmError>,
}

impl Asm {
    /// Empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instruction slots emitted so far
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether nothing was emitted yet
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// A fresh unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        match self.labels.get_mut(label.0) {
            Some(slot @ None) => *slot = Some(self.insns.len()),
            Some(Some(_)) => {
                self.error.get_or_insert(AsmError::DuplicateLabel(label.0));
            }
            None => {
                self.error.get_or_insert(AsmError::UnboundLabel(label.0));
            }
        }
        self
    }

    /// Append a raw instruction
    pub fn raw(&mut self, insn: Insn) -> &mut Self {
        self.insns.push(insn);
        self
    }

    fn jump(&mut self, code: u8, dst: u8, src: u8, imm: i32, target: Label) -> &mut Self {
        self.fixups.push((self.insns.len(), target));
        self.raw(Insn::new(code, dst, src, 0, imm))
    }

    /// Resolve labels and return the instructions
    pub fn finish(&self) -> Result<Vec<Insn>, AsmError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let mut insns = self.insns.clone();
        for &(at, label) in &self.fixups {
            let to = self
                .labels
                .get(label.0)
                .copied()
                .flatten()
                .ok_or(AsmError::UnboundLabel(label.0))?;
            let off = to as i64 - at as i64 - 1;
            insns[at].off =
                i16::try_from(off).map_err(|_| AsmError::JumpOutOfRange { from: at, to })?;
        }
        Ok(insns)
    }

    // ALU

    /// `dst op= imm` (64-bit)
    pub fn alu64_imm(&mut self, op: u8, dst: u8, imm: i32) -> &mut Self {
        self.raw(Insn::new(BPF_ALU64 | op | BPF_K, dst, 0, 0, imm))
    }

    /// `dst op= src` (64-bit)
    pub fn alu64_reg(&mut self, op: u8, dst: u8, src: u8) -> &mut Self {
        self.raw(Insn::new(BPF_ALU64 | op | BPF_X, dst, src, 0, 0))
    }

    /// `dst op= imm` (32-bit, zero-extends)
    pub fn alu32_imm(&mut self, op: u8, dst: u8, imm: i32) -> &mut Self {
        self.raw(Insn::new(BPF_ALU | op | BPF_K, dst, 0, 0, imm))
    }

    /// `dst op= src` (32-bit, zero-extends)
    pub fn alu32_reg(&mut self, op: u8, dst: u8, src: u8) -> &mut Self {
        self.raw(Insn::new(BPF_ALU | op | BPF_X, dst, src, 0, 0))
    }

    /// `dst = imm`
    pub fn mov64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_MOV, dst, imm)
    }

    /// `dst = src`
    pub fn mov64_reg(&mut self, dst: u8, src: u8) -> &mut Self {
        self.alu64_reg(BPF_MOV, dst, src)
    }

    /// `wdst = imm`
    pub fn mov32_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu32_imm(BPF_MOV, dst, imm)
    }

    /// `wdst = wsrc`
    pub fn mov32_reg(&mut self, dst: u8, src: u8) -> &mut Self {
        self.alu32_reg(BPF_MOV, dst, src)
    }

    /// `dst += imm`
    pub fn add64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_ADD, dst, imm)
    }

    /// `dst += src`
    pub fn add64_reg(&mut self, dst: u8, src: u8) -> &mut Self {
        self.alu64_reg(BPF_ADD, dst, src)
    }

    /// `dst -= imm`
    pub fn sub64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_SUB, dst, imm)
    }

    /// `dst &= imm`
    pub fn and64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_AND, dst, imm)
    }

    /// `dst <<= imm`
    pub fn lsh64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_LSH, dst, imm)
    }

    /// `dst >>= imm`
    pub fn rsh64_imm(&mut self, dst: u8, imm: i32) -> &mut Self {
        self.alu64_imm(BPF_RSH, dst, imm)
    }

    /// `dst = -dst`
    pub fn neg64(&mut self, dst: u8) -> &mut Self {
        self.raw(Insn::new(BPF_ALU64 | BPF_NEG, dst, 0, 0, 0))
    }

    /// Convert the low `bits` of `dst` to big endian
    pub fn be(&mut self, dst: u8, bits: i32) -> &mut Self {
        self.raw(Insn::new(BPF_ALU | BPF_END | BPF_TO_BE, dst, 0, 0, bits))
    }

    /// Truncate `dst` to its low `bits` (little-endian host)
    pub fn le(&mut self, dst: u8, bits: i32) -> &mut Self {
        self.raw(Insn::new(BPF_ALU | BPF_END | BPF_TO_LE, dst, 0, 0, bits))
    }

    // Loads and stores

    /// `dst = imm` (64-bit immediate, two slots)
    pub fn ld_imm64(&mut self, dst: u8, imm: u64) -> &mut Self {
        self.raw(Insn::new(BPF_LD | BPF_IMM | BPF_DW, dst, 0, 0, imm as u32 as i32));
        self.raw(Insn::new(0, 0, 0, 0, (imm >> 32) as u32 as i32))
    }

    /// `dst = handle of declared map idx` (two slots)
    pub fn ld_map(&mut self, dst: u8, map_idx: u32) -> &mut Self {
        self.raw(Insn::new(BPF_LD | BPF_IMM | BPF_DW, dst, PSEUDO_MAP_IDX, 0, map_idx as i32));
        self.raw(Insn::new(0, 0, 0, 0, 0))
    }

    /// `dst = *(size *)(src + off)`
    pub fn ldx(&mut self, size: u8, dst: u8, src: u8, off: i16) -> &mut Self {
        self.raw(Insn::new(BPF_LDX | BPF_MEM | size, dst, src, off, 0))
    }

    /// `*(size *)(dst + off) = src`
    pub fn stx(&mut self, size: u8, dst: u8, src: u8, off: i16) -> &mut Self {
        self.raw(Insn::new(BPF_STX | BPF_MEM | size, dst, src, off, 0))
    }

    /// `*(size *)(dst + off) = imm`
    pub fn st(&mut self, size: u8, dst: u8, off: i16, imm: i32) -> &mut Self {
        self.raw(Insn::new(BPF_ST | BPF_MEM | size, dst, 0, off, imm))
    }

    /// Atomic read-modify-write; `op` is the imm encoding (e.g. `BPF_ADD as i32`)
    pub fn atomic(&mut self, size: u8, op: i32, dst: u8, src: u8, off: i16) -> &mut Self {
        self.raw(Insn::new(BPF_STX | BPF_ATOMIC | size, dst, src, off, op))
    }

    /// `lock *(size *)(dst + off) += src`
    pub fn atomic_add(&mut self, size: u8, dst: u8, src: u8, off: i16) -> &mut Self {
        self.atomic(size, i32::from(BPF_ADD), dst, src, off)
    }

    // Jumps

    /// Unconditional jump
    pub fn ja(&mut self, target: Label) -> &mut Self {
        self.jump(BPF_JMP | BPF_JA, 0, 0, 0, target)
    }

    /// `if dst op imm goto target` (64-bit)
    pub fn jmp_imm(&mut self, op: u8, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jump(BPF_JMP | op | BPF_K, dst, 0, imm, target)
    }

    /// `if dst op src goto target` (64-bit)
    pub fn jmp_reg(&mut self, op: u8, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jump(BPF_JMP | op | BPF_X, dst, src, 0, target)
    }

    /// `if wdst op imm goto target` (32-bit)
    pub fn jmp32_imm(&mut self, op: u8, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jump(BPF_JMP32 | op | BPF_K, dst, 0, imm, target)
    }

    /// `if wdst op wsrc goto target` (32-bit)
    pub fn jmp32_reg(&mut self, op: u8, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jump(BPF_JMP32 | op | BPF_X, dst, src, 0, target)
    }

    /// `if dst == imm goto target`
    pub fn jeq_imm(&mut self, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jmp_imm(BPF_JEQ, dst, imm, target)
    }

    /// `if dst != imm goto target`
    pub fn jne_imm(&mut self, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jmp_imm(BPF_JNE, dst, imm, target)
    }

    /// `if dst > imm goto target`
    pub fn jgt_imm(&mut self, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jmp_imm(BPF_JGT, dst, imm, target)
    }

    /// `if dst >= imm goto target`
    pub fn jge_imm(&mut self, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jmp_imm(BPF_JGE, dst, imm, target)
    }

    /// `if dst < imm goto target`
    pub fn jlt_imm(&mut self, dst: u8, imm: i32, target: Label) -> &mut Self {
        self.jmp_imm(BPF_JLT, dst, imm, target)
    }

    /// `if dst > src goto target`
    pub fn jgt_reg(&mut self, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jmp_reg(BPF_JGT, dst, src, target)
    }

    /// `if dst >= src goto target`
    pub fn jge_reg(&mut self, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jmp_reg(BPF_JGE, dst, src, target)
    }

    /// `if dst < src goto target`
    pub fn jlt_reg(&mut self, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jmp_reg(BPF_JLT, dst, src, target)
    }

    /// `if dst <= src goto target`
    pub fn jle_reg(&mut self, dst: u8, src: u8, target: Label) -> &mut Self {
        self.jmp_reg(BPF_JLE, dst, src, target)
    }

    /// Helper call
    pub fn call(&mut self, helper: Helper) -> &mut Self {
        self.call_id(helper as i32)
    }

    /// Call by raw helper id
    pub fn call_id(&mut self, id: i32) -> &mut Self {
        self.raw(Insn::new(BPF_JMP | BPF_CALL, 0, 0, 0, id))
    }

    /// Program exit
    pub fn exit(&mut self) -> &mut Self {
        self.raw(Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0))
    }

    /// `r0 = code; exit`
    pub fn ret(&mut self, code: u64) -> &mut Self {
        self.mov64_imm(REG_0 as u8, code as i32).exit()
    }
}
