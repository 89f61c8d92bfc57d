// SPDX-License-Identifier: GPL-2.0

//! Verification statistics

use std::fmt;
use std::time::Duration;

/// Statistics collected during verification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierStats {
    /// Total number of instructions in the program
    pub insn_count: usize,
    /// Instructions processed by the walk, across all paths
    pub insns_processed: u64,
    /// States dropped because an equivalent one was already explored
    pub states_pruned: u64,
    /// States stored for pruning
    pub states_stored: u64,
    /// Peak number of pending states on the worklist
    pub peak_worklist: usize,
    /// Longest path walked, in instructions
    pub max_depth: usize,
    /// Conditional branches where both edges were explored
    pub branches: u64,
    /// Helper calls processed
    pub helper_calls: u64,
    /// Loops proven bounded
    pub loops: usize,
    /// Deepest stack byte any path touches, counted down from r10
    pub stack_depth: usize,
    /// Wall time spent verifying
    pub verification_time: Duration,
}

impl fmt::Display for VerifierStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {} insns ({} in program), {} states stored, {} pruned, \
             peak worklist {}, max depth {}, {} branches, {} loops, stack depth {}, {:?}",
            self.insns_processed,
            self.insn_count,
            self.states_stored,
            self.states_pruned,
            self.peak_worklist,
            self.max_depth,
            self.branches,
            self.loops,
            self.stack_depth,
            self.verification_time
        )
    }
}
