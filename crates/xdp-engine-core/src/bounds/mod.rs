// SPDX-License-Identifier: GPL-2.0

//! Numeric bounds tracking: tnums, scalar ranges and branch refinement

pub mod range_refine;
pub mod scalar;
pub mod tnum;

pub use range_refine::{BranchCond, BranchOutcome};
pub use scalar::ScalarBounds;
pub use tnum::Tnum;
