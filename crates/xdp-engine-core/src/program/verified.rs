// SPDX-License-Identifier: GPL-2.0

//! Verified programs
//!
//! A [`VerifiedProgram`] can only be produced by [`crate::verifier::Verifier`].
//! It pins the exact maps it was verified against, so running it can never
//! touch a map of a different shape.

use std::sync::Arc;

use super::{AttachKind, Program};
use crate::core::types::Insn;
use crate::maps::Map;
use crate::verifier::stats::VerifierStats;

/// A program that passed verification. Immutable.
#[derive(Debug)]
pub struct VerifiedProgram {
    program: Program,
    maps: Vec<Arc<Map>>,
    stats: VerifierStats,
    log: String,
}

impl VerifiedProgram {
    pub(crate) fn new(program: Program, maps: Vec<Arc<Map>>, stats: VerifierStats, log: String) -> Self {
        Self {
            program,
            maps,
            stats,
            log,
        }
    }

    /// The source program
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Program name
    pub fn name(&self) -> &str {
        self.program.name()
    }

    /// Instructions
    pub fn insns(&self) -> &[Insn] {
        self.program.insns()
    }

    /// Attach point
    pub fn attach(&self) -> AttachKind {
        self.program.attach()
    }

    /// Resolved maps, indexed like the program's declarations
    pub fn maps(&self) -> &[Arc<Map>] {
        &self.maps
    }

    /// Resolved map by declaration index
    pub fn map(&self, idx: usize) -> Option<&Arc<Map>> {
        self.maps.get(idx)
    }

    /// Verification statistics
    pub fn stats(&self) -> &VerifierStats {
        &self.stats
    }

    /// Verifier log
    pub fn log(&self) -> &str {
        &self.log
    }
}
