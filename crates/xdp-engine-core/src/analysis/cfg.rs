// SPDX-License-Identifier: GPL-2.0

//! Control flow graph
//!
//! Per-instruction successors, basic blocks with predecessor lists and the
//! back-edges found by a depth-first walk from the entry.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::*;

/// Target of a jump at `idx`, if it lands inside `len` slots
pub fn jump_target(idx: usize, insn: &Insn, len: usize) -> Option<usize> {
    let t = idx as i64 + 1 + i64::from(insn.off);
    if t >= 0 && (t as usize) < len {
        Some(t as usize)
    } else {
        None
    }
}

/// Successors of a single instruction. A conditional jump yields the
/// fall-through first, then the target.
pub fn insn_successors(insns: &[Insn], idx: usize) -> Vec<usize> {
    let Some(insn) = insns.get(idx) else {
        return Vec::new();
    };
    let len = insns.len();
    let next = |n: usize| if idx + n < len { Some(idx + n) } else { None };
    if insn.is_ld_imm64() {
        return next(2).into_iter().collect();
    }
    if insn.is_exit() {
        return Vec::new();
    }
    if insn.is_ja() {
        return jump_target(idx, insn, len).into_iter().collect();
    }
    if insn.is_cond_jump() {
        let mut v: Vec<usize> = next(1).into_iter().collect();
        if let Some(t) = jump_target(idx, insn, len) {
            if !v.contains(&t) {
                v.push(t);
            }
        }
        return v;
    }
    next(1).into_iter().collect()
}

/// A straight-line run of instructions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction
    pub start: usize,
    /// Last instruction (inclusive)
    pub end: usize,
    /// Start indices of successor blocks
    pub successors: Vec<usize>,
    /// Start indices of predecessor blocks
    pub predecessors: Vec<usize>,
}

/// Control flow graph of a program
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    /// Blocks keyed by start index
    pub blocks: BTreeMap<usize, BasicBlock>,
    /// Back-edges `(from, to)` in DFS order, `from` being the jump
    pub back_edges: Vec<(usize, usize)>,
    /// Instructions reachable from the entry
    pub reachable: BTreeSet<usize>,
}

impl ControlFlowGraph {
    /// Build the graph
    pub fn build(insns: &[Insn]) -> Self {
        let mut cfg = Self::default();
        if insns.is_empty() {
            return cfg;
        }

        let mut leaders = BTreeSet::new();
        leaders.insert(0);
        let mut idx = 0;
        while idx < insns.len() {
            let insn = &insns[idx];
            let jumps = insn.is_ja() || insn.is_cond_jump();
            if jumps {
                if let Some(t) = jump_target(idx, insn, insns.len()) {
                    leaders.insert(t);
                }
            }
            if (jumps || insn.is_exit()) && idx + 1 < insns.len() {
                leaders.insert(idx + 1);
            }
            idx += if insn.is_ld_imm64() { 2 } else { 1 };
        }

        let starts: Vec<usize> = leaders.into_iter().collect();
        for (i, &start) in starts.iter().enumerate() {
            let limit = starts.get(i + 1).copied().unwrap_or(insns.len());
            let mut end = start;
            let mut cur = start;
            while cur < limit {
                end = cur;
                cur += if insns[cur].is_ld_imm64() { 2 } else { 1 };
            }
            cfg.blocks.insert(
                start,
                BasicBlock {
                    start,
                    end,
                    successors: insn_successors(insns, end),
                    predecessors: Vec::new(),
                },
            );
        }

        let edges: Vec<(usize, usize)> = cfg
            .blocks
            .values()
            .flat_map(|b| b.successors.iter().map(move |s| (b.start, *s)))
            .collect();
        for (from, to) in edges {
            if let Some(b) = cfg.blocks.get_mut(&to) {
                b.predecessors.push(from);
            }
        }

        cfg.find_back_edges(insns);
        cfg
    }

    /// Iterative DFS over instructions; an edge to a node still on the DFS
    /// stack is a back-edge
    fn find_back_edges(&mut self, insns: &[Insn]) {
        let mut on_stack = vec![false; insns.len()];
        let mut visited = vec![false; insns.len()];
        // (node, successors, next successor to visit)
        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        visited[0] = true;
        on_stack[0] = true;
        self.reachable.insert(0);
        stack.push((0, insn_successors(insns, 0), 0));

        while let Some((node, succs, next)) = stack.last_mut() {
            if let Some(&s) = succs.get(*next) {
                *next += 1;
                let from = *node;
                if on_stack[s] {
                    self.back_edges.push((from, s));
                } else if !visited[s] {
                    visited[s] = true;
                    on_stack[s] = true;
                    self.reachable.insert(s);
                    stack.push((s, insn_successors(insns, s), 0));
                }
            } else {
                on_stack[*node] = false;
                stack.pop();
            }
        }
    }

    /// Block containing `idx`
    pub fn block_of(&self, idx: usize) -> Option<&BasicBlock> {
        self.blocks
            .range(..=idx)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| idx <= b.end)
    }

    /// Whether `from -> to` is a back-edge
    pub fn is_back_edge(&self, from: usize, to: usize) -> bool {
        self.back_edges.contains(&(from, to))
    }

    /// Whether the program contains a cycle
    pub fn has_loops(&self) -> bool {
        !self.back_edges.is_empty()
    }

    /// Instructions of the natural loop closed by the back-edge `from -> to`:
    /// the header and every node that reaches `from` without passing it
    pub fn natural_loop(&self, insns: &[Insn], from: usize, to: usize) -> BTreeSet<usize> {
        let preds = predecessors(insns);
        let mut body = BTreeSet::new();
        body.insert(to);
        let mut work = vec![from];
        while let Some(n) = work.pop() {
            if body.insert(n) {
                if let Some(ps) = preds.get(&n) {
                    work.extend(ps.iter().copied().filter(|p| self.reachable.contains(p)));
                }
            }
        }
        body
    }
}

/// Per-instruction predecessor lists
pub fn predecessors(insns: &[Insn]) -> BTreeMap<usize, Vec<usize>> {
    let mut preds: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut idx = 0;
    while idx < insns.len() {
        for s in insn_successors(insns, idx) {
            preds.entry(s).or_default().push(idx);
        }
        idx += if insns[idx].is_ld_imm64() { 2 } else { 1 };
    }
    preds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mov(dst: u8, imm: i32) -> Insn {
        Insn::new(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
    }

    fn exit() -> Insn {
        Insn::new(BPF_JMP | BPF_EXIT, 0, 0, 0, 0)
    }

    #[test]
    fn test_straight_line() {
        let cfg = ControlFlowGraph::build(&[mov(0, 1), exit()]);
        assert_eq!(cfg.blocks.len(), 1);
        assert!(!cfg.has_loops());
    }

    #[test]
    fn test_diamond() {
        let insns = [
            Insn::new(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, 1, 0),
            mov(0, 1),
            mov(0, 2),
            exit(),
        ];
        let cfg = ControlFlowGraph::build(&insns);
        assert_eq!(insn_successors(&insns, 0), vec![1, 2]);
        assert_eq!(cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(cfg.blocks[&2].predecessors, vec![0, 1]);
        assert!(!cfg.has_loops());
    }

    #[test]
    fn test_back_edge_and_body() {
        let insns = [
            mov(1, 0),
            Insn::new(BPF_ALU64 | BPF_ADD | BPF_K, 1, 0, 0, 1),
            Insn::new(BPF_JMP | BPF_JLT | BPF_K, 1, 0, -2, 10),
            mov(0, 2),
            exit(),
        ];
        let cfg = ControlFlowGraph::build(&insns);
        assert_eq!(cfg.back_edges, vec![(2, 1)]);
        let body = cfg.natural_loop(&insns, 2, 1);
        assert_eq!(body.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(cfg.block_of(2).map(|b| b.start), Some(1));
    }

    #[test]
    fn test_ld_imm64_block() {
        let insns = [
            Insn::new(BPF_LD | BPF_IMM | BPF_DW, 0, 0, 0, 2),
            Insn::new(0, 0, 0, 0, 0),
            exit(),
        ];
        let cfg = ControlFlowGraph::build(&insns);
        assert_eq!(cfg.blocks[&0].end, 2);
        assert!(!cfg.reachable.contains(&1));
    }
}
