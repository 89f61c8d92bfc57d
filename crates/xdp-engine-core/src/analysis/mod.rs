// SPDX-License-Identifier: GPL-2.0

//! Program-level analyses: control flow, loops and state equivalence

pub mod cfg;
pub mod loop_check;
pub mod states_equal;

pub use cfg::{BasicBlock, ControlFlowGraph};
pub use loop_check::{check_loops, LoopBound, LoopInfo};
pub use states_equal::states_equal;
