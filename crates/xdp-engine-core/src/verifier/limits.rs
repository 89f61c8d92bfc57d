// SPDX-License-Identifier: GPL-2.0

//! Verifier configuration and resource limits

use crate::core::log::{LogLevel, VerifierLog};

/// Bounds on the work the verifier will do for one program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum program length in instruction slots
    pub max_insns: usize,
    /// Maximum (instruction, state) pairs processed
    pub max_complexity: u64,
    /// Maximum states stored per instruction for pruning
    pub max_states_per_insn: usize,
    /// Maximum proven remaining trips of any loop
    pub max_loop_trips: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_insns: 4096,
            max_complexity: 1_000_000,
            max_states_per_insn: 64,
            max_loop_trips: 65_536,
        }
    }
}

impl ResourceLimits {
    /// Set the maximum program length
    pub fn with_max_insns(mut self, n: usize) -> Self {
        self.max_insns = n;
        self
    }

    /// Set the complexity budget
    pub fn with_max_complexity(mut self, n: u64) -> Self {
        self.max_complexity = n;
        self
    }

    /// Set the per-instruction state cap
    pub fn with_max_states_per_insn(mut self, n: usize) -> Self {
        self.max_states_per_insn = n;
        self
    }

    /// Set the loop trip limit
    pub fn with_max_loop_trips(mut self, n: u64) -> Self {
        self.max_loop_trips = n;
        self
    }
}

/// Verifier configuration
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Resource limits
    pub limits: ResourceLimits,
    /// Log verbosity
    pub log_level: LogLevel,
    /// Log buffer size
    pub log_size: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            log_level: LogLevel::Error,
            log_size: VerifierLog::DEFAULT_SIZE,
        }
    }
}

impl VerifierConfig {
    /// Replace the resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the log level
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set the log buffer size
    pub fn with_log_size(mut self, size: usize) -> Self {
        self.log_size = size;
        self
    }
}
