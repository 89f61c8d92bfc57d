// SPDX-License-Identifier: GPL-2.0

//! Execution engine
//!
//! Runs a [`VerifiedProgram`] against one packet. The engine is stateless
//! apart from its configuration and clock; any number of workers may share
//! one engine and run concurrently. A worker that runs many packets passes
//! its own [`RunScratch`] so the stack is not reallocated per packet.

pub mod clock;
pub mod context;
pub mod helpers;
pub mod interpreter;
pub mod memory;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{PacketContext, RxMeta, Verdict};
pub use memory::RunScratch;

use std::sync::Arc;

use crate::core::error::ExecutionError;
use crate::core::types::MAX_STACK;
use crate::program::VerifiedProgram;

use interpreter::Interpreter;
use memory::Memory;

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Instructions a single run may execute
    pub insn_budget: u64,
    /// Stack bytes below r10
    pub stack_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            insn_budget: 1_000_000,
            stack_size: MAX_STACK,
        }
    }
}

impl EngineConfig {
    /// Set the instruction budget
    pub fn with_insn_budget(mut self, budget: u64) -> Self {
        self.insn_budget = budget;
        self
    }
}

/// Interpreter for verified programs
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// Engine on the monotonic clock
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Engine on a custom clock
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scratch sized for this engine
    pub fn scratch(&self) -> RunScratch {
        RunScratch::new(self.config.stack_size)
    }

    /// Run `prog` on `ctx`. The verdict is also left in the context; a failed
    /// run leaves [`Verdict::Error`].
    pub fn try_run(&self, prog: &VerifiedProgram, ctx: &mut PacketContext<'_>) -> Result<Verdict, ExecutionError> {
        self.try_run_with(prog, ctx, &mut self.scratch())
    }

    /// [`Engine::try_run`] on a caller-held scratch
    pub fn try_run_with(
        &self,
        prog: &VerifiedProgram,
        ctx: &mut PacketContext<'_>,
        run: &mut RunScratch,
    ) -> Result<Verdict, ExecutionError> {
        let worker = ctx.meta.worker_id as usize;
        run.reset(self.config.stack_size, prog.stats().stack_depth);
        let mem = Memory::new(&mut *ctx.packet, &mut ctx.scratch, ctx.meta, run);
        let interp = Interpreter::new(
            prog.insns(),
            prog.maps(),
            prog.attach(),
            mem,
            self.clock.as_ref(),
            worker,
            self.config.insn_budget,
        );
        let result = interp
            .run()
            .and_then(|out| {
                tracing::trace!(program = prog.name(), steps = out.steps, code = out.code, "run finished");
                Verdict::from_code(out.code, out.redirect)
            });
        ctx.verdict = Some(result.as_ref().map_or(Verdict::Error, |v| *v));
        result
    }

    /// Run `prog` on `ctx`; execution errors are logged and become
    /// [`Verdict::Error`]
    pub fn run(&self, prog: &VerifiedProgram, ctx: &mut PacketContext<'_>) -> Verdict {
        self.run_with(prog, ctx, &mut self.scratch())
    }

    /// [`Engine::run`] on a caller-held scratch
    pub fn run_with(&self, prog: &VerifiedProgram, ctx: &mut PacketContext<'_>, run: &mut RunScratch) -> Verdict {
        match self.try_run_with(prog, ctx, run) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(program = prog.name(), error = %e, "program run failed");
                Verdict::Error
            }
        }
    }
}
