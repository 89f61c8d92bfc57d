// SPDX-License-Identifier: GPL-2.0

//! Loop detection and bounding
//!
//! Every back-edge must close a natural loop driven by an induction
//! register: a register changed inside the loop only by 64-bit add or
//! subtract of non-zero constants of one sign, stepped on every path around
//! the loop, and compared against a constant or loop-invariant register by a
//! branch that leaves the loop. The walk then checks on each traversal of the
//! back-edge that the remaining trip count derived from the proven ranges
//! stays within the configured limit.

use std::collections::BTreeSet;

use super::cfg::{insn_successors, jump_target, ControlFlowGraph};
use crate::bounds::range_refine::BranchCond;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::types::*;

/// What the induction register is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBound {
    /// A constant (sign-extended immediate)
    Imm(u64),
    /// A register not written inside the loop
    Reg(u8),
}

/// A verified loop shape
#[derive(Debug, Clone)]
pub struct LoopInfo {
    /// Loop header, target of the back-edge
    pub header: usize,
    /// Source of the back-edge
    pub latch: usize,
    /// Instructions in the loop
    pub body: BTreeSet<usize>,
    /// Induction register
    pub induction_reg: u8,
    /// Smallest step per iteration, signed
    pub step: i64,
    /// Bound the register is compared against
    pub bound: LoopBound,
    /// Condition under which the loop continues, induction register on the left
    pub cond: BranchCond,
    /// Branch instruction that tests the condition
    pub branch: usize,
}

impl LoopInfo {
    /// Check if instruction is in loop body
    pub fn contains(&self, insn_idx: usize) -> bool {
        self.body.contains(&insn_idx)
    }
}

/// Registers an instruction may overwrite
fn written_regs(insn: &Insn) -> Vec<u8> {
    match insn.class() {
        BPF_ALU | BPF_ALU64 | BPF_LDX => vec![insn.dst_reg],
        BPF_LD if insn.is_ld_imm64() => vec![insn.dst_reg],
        BPF_STX if insn.mode() == BPF_ATOMIC => {
            if insn.imm == BPF_CMPXCHG {
                vec![REG_0 as u8]
            } else if insn.imm & BPF_FETCH != 0 {
                vec![insn.src_reg]
            } else {
                Vec::new()
            }
        }
        BPF_JMP if insn.is_call() => CALLER_SAVED.iter().map(|r| *r as u8).collect(),
        _ => Vec::new(),
    }
}

/// Signed step if `insn` is `reg += imm` or `reg -= imm` with `imm != 0`
fn step_of(insn: &Insn) -> Option<i64> {
    if insn.class() != BPF_ALU64 || insn.src() != BPF_K || insn.imm == 0 {
        return None;
    }
    match insn.op() {
        BPF_ADD => Some(i64::from(insn.imm)),
        BPF_SUB => Some(-i64::from(insn.imm)),
        _ => None,
    }
}

/// Steps applied to `reg` inside `body`, or `None` if it is written any
/// other way or with mixed signs
fn induction_steps(insns: &[Insn], body: &BTreeSet<usize>, reg: u8) -> Option<(i64, BTreeSet<usize>)> {
    let mut step: Option<i64> = None;
    let mut sites = BTreeSet::new();
    for &idx in body {
        let insn = &insns[idx];
        if !written_regs(insn).contains(&reg) {
            continue;
        }
        let s = step_of(insn).filter(|_| insn.dst_reg == reg)?;
        step = match step {
            None => Some(s),
            Some(prev) if prev.signum() == s.signum() => {
                Some(if s.abs() < prev.abs() { s } else { prev })
            }
            Some(_) => return None,
        };
        sites.insert(idx);
    }
    step.map(|s| (s, sites))
}

fn is_invariant(insns: &[Insn], body: &BTreeSet<usize>, reg: u8) -> bool {
    body.iter().all(|&i| !written_regs(&insns[i]).contains(&reg))
}

/// Whether `to` is reachable from `from` inside `body` without executing any
/// instruction in `avoid`
fn reaches_avoiding(
    insns: &[Insn],
    body: &BTreeSet<usize>,
    from: usize,
    to: usize,
    avoid: &BTreeSet<usize>,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut work = vec![from];
    while let Some(n) = work.pop() {
        if avoid.contains(&n) || !seen.insert(n) {
            continue;
        }
        if n == to {
            return true;
        }
        work.extend(
            insn_successors(insns, n)
                .into_iter()
                .filter(|s| body.contains(s) && *s != from),
        );
    }
    false
}

/// Whether `cond` keeps a counter moving by `step` heading toward its bound
fn direction_ok(cond: BranchCond, step: i64) -> bool {
    use BranchCond::*;
    match cond {
        Lt | Le | Slt | Sle => step > 0,
        Gt | Ge | Sgt | Sge => step < 0,
        Ne => step.abs() == 1,
        _ => false,
    }
}

/// Try to recognize the exit test at `branch` for the loop `body`
fn exit_test(
    insns: &[Insn],
    body: &BTreeSet<usize>,
    branch: usize,
) -> Option<(u8, LoopBound, BranchCond)> {
    let insn = insns.get(branch)?;
    if insn.class() != BPF_JMP || !insn.is_cond_jump() {
        return None;
    }
    let target = jump_target(branch, insn, insns.len())?;
    let taken_in = body.contains(&target);
    let fall_in = body.contains(&(branch + 1));
    let cond = BranchCond::from_opcode(insn.op())?;
    let cont = match (taken_in, fall_in) {
        (true, false) => cond,
        (false, true) => cond.negate(),
        _ => return None,
    };
    if insn.src() == BPF_K {
        return Some((insn.dst_reg, LoopBound::Imm(i64::from(insn.imm) as u64), cont));
    }
    // Either operand may be the counter; the caller checks which one steps
    Some((insn.dst_reg, LoopBound::Reg(insn.src_reg), cont))
}

fn analyze_back_edge(
    insns: &[Insn],
    cfg: &ControlFlowGraph,
    latch: usize,
    header: usize,
) -> Option<LoopInfo> {
    let body = cfg.natural_loop(insns, latch, header);
    let header_end = cfg.block_of(header).map_or(header, |b| b.end);
    let mut branches = vec![latch];
    if header_end != latch {
        branches.push(header_end);
    }

    for branch in branches {
        let Some((dst, bound, cond)) = exit_test(insns, &body, branch) else {
            continue;
        };
        let mut candidates = vec![(dst, bound, cond)];
        if let LoopBound::Reg(src) = bound {
            candidates.push((src, LoopBound::Reg(dst), cond.swap()));
        }
        for (reg, bound, cond) in candidates {
            let Some((step, sites)) = induction_steps(insns, &body, reg) else {
                continue;
            };
            if let LoopBound::Reg(b) = bound {
                if !is_invariant(insns, &body, b) {
                    continue;
                }
            }
            if !direction_ok(cond, step) {
                continue;
            }
            if reaches_avoiding(insns, &body, header, latch, &sites) {
                continue;
            }
            return Some(LoopInfo {
                header,
                latch,
                body: body.clone(),
                induction_reg: reg,
                step,
                bound,
                cond,
                branch,
            });
        }
    }
    None
}

/// Check every back-edge of the program for a recognizable induction
/// register
pub fn check_loops(insns: &[Insn], cfg: &ControlFlowGraph) -> Result<Vec<LoopInfo>> {
    let mut loops = Vec::with_capacity(cfg.back_edges.len());
    for &(latch, header) in &cfg.back_edges {
        match analyze_back_edge(insns, cfg, latch, header) {
            Some(info) => loops.push(info),
            None => {
                return Err(reject!(
                    latch,
                    UnboundedLoop,
                    "back-edge to {} has no bounded induction register",
                    header
                ))
            }
        }
    }
    Ok(loops)
}

/// Upper bound on the iterations left for a counter in `counter` stepping by
/// `step` while `counter <cond> bound` holds. `None` if no finite bound
/// follows from the ranges.
pub fn remaining_trips(
    counter: &ScalarBounds,
    bound: &ScalarBounds,
    cond: BranchCond,
    step: i64,
) -> Option<u128> {
    use BranchCond::*;
    let s = i128::from(step).unsigned_abs() as i128;
    let ceil = |dist: i128| -> u128 {
        if dist <= 0 {
            0
        } else {
            ((dist + s - 1) / s) as u128
        }
    };
    let (umin, umax) = (i128::from(counter.umin_value), i128::from(counter.umax_value));
    let (smin, smax) = (i128::from(counter.smin_value), i128::from(counter.smax_value));
    let (bumin, bumax) = (i128::from(bound.umin_value), i128::from(bound.umax_value));
    let (bsmin, bsmax) = (i128::from(bound.smin_value), i128::from(bound.smax_value));
    let u_top = i128::from(u64::MAX);
    let s_top = i128::from(i64::MAX);
    let s_bot = i128::from(i64::MIN);

    match cond {
        Lt if step > 0 && bumax + s - 1 <= u_top => Some(ceil(bumax - umin)),
        Le if step > 0 && bumax + s <= u_top => Some(ceil(bumax - umin + 1)),
        Slt if step > 0 && bsmax + s - 1 <= s_top => Some(ceil(bsmax - smin)),
        Sle if step > 0 && bsmax + s <= s_top => Some(ceil(bsmax - smin + 1)),
        Gt if step < 0 && bumin + 1 >= s => Some(ceil(umax - bumin)),
        Ge if step < 0 && bumin >= s => Some(ceil(umax - bumin + 1)),
        Sgt if step < 0 && bsmin + 1 - s >= s_bot => Some(ceil(smax - bsmin)),
        Sge if step < 0 && bsmin - s >= s_bot => Some(ceil(smax - bsmin + 1)),
        Ne if step == 1 && umax <= bumin => Some(ceil(bumax - umin)),
        Ne if step == -1 && umin >= bumax => Some(ceil(umax - bumin)),
        _ => None,
    }
}
