// SPDX-License-Identifier: GPL-2.0

//! Program verification
//!
//! [`Verifier::verify`] runs the static passes (structure, map resolution,
//! control flow, loop shapes) and then the path-sensitive walk of
//! [`main_loop::do_check`]. A program either comes out as a
//! [`VerifiedProgram`] or is rejected with the offending instruction, the
//! reason and the tail of the verifier log.

pub mod env;
pub mod limits;
pub mod main_loop;
pub mod stats;

pub use limits::{ResourceLimits, VerifierConfig};
pub use stats::VerifierStats;

use std::sync::Arc;
use std::time::Instant;

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::loop_check::check_loops;
use crate::check::structure::{check_fall_through, check_structure};
use crate::core::error::{Rejection, RejectionReason, Result};
use crate::core::log::{log_error, VerifierLog};
use crate::maps::{Map, MapSet};
use crate::program::{Program, VerifiedProgram};

use env::VerifierEnv;

/// Bytes of log kept with a rejection
const REJECTION_LOG_TAIL: usize = 4096;

/// Verifier with a fixed configuration; reusable across programs
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    /// Create a verifier
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify `program` against the maps registered in `maps`
    pub fn verify(&self, program: &Program, maps: &MapSet) -> Result<VerifiedProgram> {
        let start = Instant::now();
        let mut log = VerifierLog::with_max_size(self.config.log_level, self.config.log_size);

        match self.run(program, maps, &mut log) {
            Ok((resolved, mut stats)) => {
                stats.verification_time = start.elapsed();
                log.info(&format!("verification succeeded: {}", stats));
                tracing::debug!(
                    program = program.name(),
                    insns = stats.insn_count,
                    processed = stats.insns_processed,
                    pruned = stats.states_pruned,
                    "program verified"
                );
                Ok(VerifiedProgram::new(
                    program.clone(),
                    resolved,
                    stats,
                    log.contents().to_string(),
                ))
            }
            Err(mut rej) => {
                log_error(&mut log, rej.insn_idx, &rej.message);
                rej.log = log.tail(REJECTION_LOG_TAIL).to_string();
                tracing::debug!(
                    program = program.name(),
                    reason = %rej.reason,
                    insn = ?rej.insn_idx,
                    "program rejected: {}",
                    rej.message
                );
                Err(rej)
            }
        }
    }

    fn run(
        &self,
        program: &Program,
        maps: &MapSet,
        log: &mut VerifierLog,
    ) -> Result<(Vec<Arc<Map>>, VerifierStats)> {
        let insns = program.insns();
        let limits = self.config.limits;

        check_structure(insns, limits.max_insns)?;
        let resolved = resolve_maps(program, maps)?;

        let cfg = ControlFlowGraph::build(insns);
        check_fall_through(insns, &cfg)?;
        let loops = check_loops(insns, &cfg)?;

        let mut env = VerifierEnv::new(
            insns,
            program.attach(),
            &resolved,
            limits,
            std::mem::take(log),
            cfg,
            loops,
        );
        let result = main_loop::do_check(&mut env);
        *log = std::mem::take(&mut env.log);
        let stats = env.stats.clone();
        result?;
        Ok((resolved, stats))
    }
}

/// Resolve the program's declared maps by name, in declaration order
fn resolve_maps(program: &Program, maps: &MapSet) -> Result<Vec<Arc<Map>>> {
    program
        .maps()
        .iter()
        .map(|binding| {
            let Some(map) = maps.get(&binding.name) else {
                return Err(Rejection::program(
                    RejectionReason::MapSchemaMismatch,
                    format!("map '{}' is not registered", binding.name),
                ));
            };
            if !binding.matches(map.schema()) {
                let schema = map.schema();
                return Err(Rejection::program(
                    RejectionReason::MapSchemaMismatch,
                    format!(
                        "map '{}' is {} key={} value={}, program expects {} key={} value={}",
                        binding.name,
                        schema.kind,
                        schema.key_size,
                        schema.value_size,
                        binding.kind,
                        binding.key_size,
                        binding.value_size
                    ),
                ));
            }
            Ok(map)
        })
        .collect()
}

/// Verify with the default configuration
pub fn verify(program: &Program, maps: &MapSet) -> Result<VerifiedProgram> {
    Verifier::default().verify(program, maps)
}
