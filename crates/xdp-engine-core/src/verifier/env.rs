// SPDX-License-Identifier: GPL-2.0

//! Verifier environment
//!
//! Everything one verification run needs beyond the current abstract state:
//! the instructions, resolved maps, loop shapes, the explicit path stack,
//! stored states for pruning, the log and the counters.

use std::sync::Arc;

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::loop_check::{remaining_trips, LoopBound, LoopInfo};
use crate::analysis::states_equal::states_equal;
use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::log::VerifierLog;
use crate::core::types::*;
use crate::maps::{Map, MapSchema};
use crate::program::AttachKind;
use crate::state::verifier_state::VerifierState;

use super::limits::ResourceLimits;
use super::stats::VerifierStats;

/// A path waiting to be explored
#[derive(Debug, Clone)]
pub struct StackElem {
    /// State at the start of the path
    pub state: VerifierState,
    /// First instruction of the path
    pub insn_idx: usize,
    /// Instruction the path branched off from
    pub prev_insn_idx: usize,
    /// Instructions walked before reaching `insn_idx`
    pub depth: usize,
}

/// Verification environment for one program
#[derive(Debug)]
pub struct VerifierEnv<'a> {
    /// Program instructions
    pub insns: &'a [Insn],
    /// Attach point of the program
    pub attach: AttachKind,
    /// Maps resolved from the program's declarations
    pub maps: &'a [Arc<Map>],
    /// Resource limits
    pub limits: ResourceLimits,
    /// Verifier log
    pub log: VerifierLog,
    /// Counters
    pub stats: VerifierStats,
    /// Control flow graph
    pub cfg: ControlFlowGraph,
    /// Loop shapes, one per back-edge
    pub loops: Vec<LoopInfo>,
    /// State of the path being walked
    pub cur_state: VerifierState,
    /// Instruction about to be checked
    pub insn_idx: usize,
    /// Instruction checked before it
    pub prev_insn_idx: usize,
    depth: usize,
    stack: Vec<StackElem>,
    explored: Vec<Vec<VerifierState>>,
    prune_point: Vec<bool>,
    id_gen: u32,
}

impl<'a> VerifierEnv<'a> {
    /// Create an environment positioned at the entry instruction
    pub fn new(
        insns: &'a [Insn],
        attach: AttachKind,
        maps: &'a [Arc<Map>],
        limits: ResourceLimits,
        log: VerifierLog,
        cfg: ControlFlowGraph,
        loops: Vec<LoopInfo>,
    ) -> Self {
        let mut prune_point = vec![false; insns.len()];
        for &start in cfg.blocks.keys() {
            if let Some(p) = prune_point.get_mut(start) {
                *p = true;
            }
        }
        let stats = VerifierStats {
            insn_count: insns.len(),
            loops: loops.len(),
            ..Default::default()
        };
        Self {
            insns,
            attach,
            maps,
            limits,
            log,
            stats,
            cfg,
            loops,
            cur_state: VerifierState::new(),
            insn_idx: 0,
            prev_insn_idx: 0,
            depth: 0,
            stack: Vec::new(),
            explored: vec![Vec::new(); insns.len()],
            prune_point,
            id_gen: 0,
        }
    }

    /// Allocate a fresh pointer or reference id
    pub fn new_id(&mut self) -> u32 {
        self.id_gen += 1;
        self.id_gen
    }

    /// Instruction at `idx`
    pub fn insn(&self, idx: usize) -> Option<&Insn> {
        self.insns.get(idx)
    }

    /// Schema of the declared map at `map_idx`
    pub fn map_schema(&self, map_idx: u32) -> Option<&MapSchema> {
        self.maps.get(map_idx as usize).map(|m| m.schema())
    }

    /// Count one processed instruction against the complexity budget
    pub fn count_insn(&mut self) -> Result<()> {
        self.stats.insns_processed += 1;
        if self.stats.insns_processed > self.limits.max_complexity {
            return Err(reject!(
                self.insn_idx,
                ComplexityExceeded,
                "processed more than {} instructions",
                self.limits.max_complexity
            ));
        }
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
        Ok(())
    }

    /// Move the current path along the edge `from -> to`
    pub fn advance(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_edge(from, to, &self.cur_state)?;
        self.prev_insn_idx = from;
        self.insn_idx = to;
        self.depth += 1;
        Ok(())
    }

    /// Queue the edge `from -> to` with `state` for later exploration
    pub fn push_state(&mut self, state: VerifierState, from: usize, to: usize) -> Result<()> {
        self.check_edge(from, to, &state)?;
        self.stack.push(StackElem {
            state,
            insn_idx: to,
            prev_insn_idx: from,
            depth: self.depth + 1,
        });
        self.stats.branches += 1;
        self.stats.peak_worklist = self.stats.peak_worklist.max(self.stack.len());
        Ok(())
    }

    /// Continue with the most recently queued path. Returns `false` when
    /// every path has been explored.
    pub fn pop_state(&mut self) -> bool {
        let Some(elem) = self.stack.pop() else {
            return false;
        };
        self.cur_state = elem.state;
        self.insn_idx = elem.insn_idx;
        self.prev_insn_idx = elem.prev_insn_idx;
        self.depth = elem.depth;
        true
    }

    /// Whether an equivalent state was already explored at the current
    /// instruction. Otherwise the current state is stored, up to the
    /// per-instruction cap.
    pub fn is_state_visited(&mut self) -> bool {
        let idx = self.insn_idx;
        if !self.prune_point.get(idx).copied().unwrap_or(false) {
            return false;
        }
        let Some(stored) = self.explored.get_mut(idx) else {
            return false;
        };
        if stored.iter().any(|old| states_equal(&self.cur_state, old)) {
            self.stats.states_pruned += 1;
            return true;
        }
        if stored.len() < self.limits.max_states_per_insn {
            stored.push(self.cur_state.clone());
            self.stats.states_stored += 1;
        }
        false
    }

    fn loop_for_edge(&self, from: usize, to: usize) -> Option<&LoopInfo> {
        self.loops.iter().find(|l| l.latch == from && l.header == to)
    }

    /// Bound the remaining trips of the loop closed by `from -> to`
    fn check_edge(&self, from: usize, to: usize, state: &VerifierState) -> Result<()> {
        if !self.cfg.is_back_edge(from, to) {
            return Ok(());
        }
        let Some(info) = self.loop_for_edge(from, to) else {
            return Err(reject!(from, UnboundedLoop, "back-edge to {} has no loop shape", to));
        };
        let counter = state.regs[info.induction_reg as usize];
        if !counter.is_scalar() {
            return Err(reject!(
                from,
                UnboundedLoop,
                "loop counter r{} is not a scalar",
                info.induction_reg
            ));
        }
        let bound = match info.bound {
            LoopBound::Imm(v) => ScalarBounds::known(v),
            LoopBound::Reg(r) => {
                let reg = state.regs[r as usize];
                if !reg.is_scalar() {
                    return Err(reject!(from, UnboundedLoop, "loop bound r{} is not a scalar", r));
                }
                reg.bounds
            }
        };
        match remaining_trips(&counter.bounds, &bound, info.cond, info.step) {
            Some(trips) if trips <= u128::from(self.limits.max_loop_trips) => Ok(()),
            Some(trips) => Err(reject!(
                from,
                UnboundedLoop,
                "loop may run {} more times (limit {})",
                trips,
                self.limits.max_loop_trips
            )),
            None => Err(reject!(
                from,
                UnboundedLoop,
                "cannot bound trips of loop at {} from r{} range",
                to,
                info.induction_reg
            )),
        }
    }
}
