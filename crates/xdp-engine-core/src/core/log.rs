// SPDX-License-Identifier: GPL-2.0

//! Verbose logging for the verifier
//!
//! The log is an in-memory buffer attached to the verification result. It
//! records processed instructions with their register state, branch
//! decisions, pruning and the final error.

use std::fmt::Write;

use crate::core::disasm::fmt_insn_body;
use crate::core::types::*;
use crate::state::reg_state::RegState;
use crate::state::verifier_state::VerifierState;

/// Log level for verifier output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// No logging
    #[default]
    Off = 0,
    /// Only errors
    Error = 1,
    /// Errors and warnings
    Warn = 2,
    /// General information (pruning, calls)
    Info = 3,
    /// Branch decisions
    Debug = 4,
    /// Every instruction
    Trace = 5,
}

/// Verifier log buffer
#[derive(Debug, Clone, Default)]
pub struct VerifierLog {
    /// Log level threshold
    pub level: LogLevel,
    buffer: String,
    max_size: usize,
    truncated: bool,
}

impl VerifierLog {
    /// Default buffer size
    pub const DEFAULT_SIZE: usize = 1024 * 1024;

    /// Create a new log with the specified level
    pub fn new(level: LogLevel) -> Self {
        Self::with_max_size(level, Self::DEFAULT_SIZE)
    }

    /// Create a log with a custom size limit
    pub fn with_max_size(level: LogLevel, max_size: usize) -> Self {
        Self {
            level,
            buffer: String::new(),
            max_size,
            truncated: false,
        }
    }

    /// Check if logging is enabled at the given level
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level && level != LogLevel::Off
    }

    /// Log a message at the given level
    pub fn log(&mut self, level: LogLevel, msg: &str) {
        if !self.enabled(level) || self.truncated {
            return;
        }
        if self.buffer.len() + msg.len() + 1 > self.max_size {
            self.truncated = true;
            self.buffer.push_str("... log truncated ...\n");
            return;
        }
        self.buffer.push_str(msg);
        self.buffer.push('\n');
    }

    /// Log an error
    pub fn error(&mut self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }

    /// Log a warning
    pub fn warn(&mut self, msg: &str) {
        self.log(LogLevel::Warn, msg);
    }

    /// Log info
    pub fn info(&mut self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    /// Log debug
    pub fn debug(&mut self, msg: &str) {
        self.log(LogLevel::Debug, msg);
    }

    /// Log trace
    pub fn trace(&mut self, msg: &str) {
        self.log(LogLevel::Trace, msg);
    }

    /// Log contents
    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// Whether the size limit was hit
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// The last `n` bytes of the log, starting on a line boundary
    pub fn tail(&self, n: usize) -> &str {
        if self.buffer.len() <= n {
            return &self.buffer;
        }
        let mut start = self.buffer.len() - n;
        while !self.buffer.is_char_boundary(start) {
            start += 1;
        }
        if self.buffer.as_bytes()[start - 1] == b'\n' {
            return &self.buffer[start..];
        }
        match self.buffer[start..].find('\n') {
            Some(nl) => &self.buffer[start + nl + 1..],
            None => &self.buffer[start..],
        }
    }

    /// Get the current length of the log buffer
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the log buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the log
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.truncated = false;
    }
}

/// Format a register state for logging
pub fn fmt_reg(reg: &RegState, regno: usize) -> String {
    let mut s = String::new();
    let _ = write!(s, "R{regno}");
    match reg.reg_type {
        RegType::NotInit => s.push_str("=<not_init>"),
        RegType::Scalar => {
            let b = &reg.bounds;
            if let Some(v) = b.const_value() {
                let _ = write!(s, "={}", v as i64);
            } else if b.is_unbounded() {
                s.push_str("=scalar()");
            } else {
                let _ = write!(
                    s,
                    "=scalar(umin={},umax={},smin={},smax={})",
                    b.umin_value, b.umax_value, b.smin_value, b.smax_value
                );
            }
        }
        other => {
            let _ = write!(s, "={}", other.name());
            if reg.maybe_null() {
                s.push_str("_or_null");
            }
            if other == RegType::PtrToMapValue || other == RegType::ConstPtrToMap {
                let _ = write!(s, "[{}]", reg.map_idx);
            }
            if reg.off != 0 {
                let _ = write!(s, "{:+}", reg.off);
            }
            if !reg.bounds.is_const() {
                let _ = write!(
                    s,
                    "(var {}..{})",
                    reg.bounds.umin_value, reg.bounds.umax_value
                );
            }
            if other == RegType::PtrToPacket {
                let _ = write!(s, " r={}", reg.range);
            }
        }
    }
    if reg.id != 0 {
        let _ = write!(s, " id={}", reg.id);
    }
    if reg.ref_obj_id != 0 {
        let _ = write!(s, " ref={}", reg.ref_obj_id);
    }
    s
}

/// Format the initialized registers of a state
pub fn fmt_regs(state: &VerifierState) -> String {
    state
        .regs
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_init())
        .map(|(i, r)| fmt_reg(r, i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log verifier progress at an instruction
pub fn log_insn(log: &mut VerifierLog, insns: &[Insn], idx: usize, state: &VerifierState) {
    if !log.enabled(LogLevel::Trace) {
        return;
    }
    let Some(insn) = insns.get(idx) else {
        return;
    };
    let msg = format!(
        "{}: {} ; {}",
        idx,
        fmt_insn_body(insn, insns.get(idx + 1)),
        fmt_regs(state)
    );
    log.trace(&msg);
}

/// Log a branch decision
pub fn log_branch(log: &mut VerifierLog, idx: usize, outcome: &str, target: usize) {
    if !log.enabled(LogLevel::Debug) {
        return;
    }
    let msg = format!("{idx}: branch {outcome} -> {target}");
    log.debug(&msg);
}

/// Log state pruning
pub fn log_prune(log: &mut VerifierLog, idx: usize) {
    if !log.enabled(LogLevel::Info) {
        return;
    }
    let msg = format!("{idx}: safe (equivalent state already verified)");
    log.info(&msg);
}

/// Log a helper call
pub fn log_call(log: &mut VerifierLog, idx: usize, helper: Helper) {
    if !log.enabled(LogLevel::Info) {
        return;
    }
    let msg = format!("{}: call {}#{}", idx, helper.name(), helper as i32);
    log.info(&msg);
}

/// Log a verification error
pub fn log_error(log: &mut VerifierLog, idx: Option<usize>, error: &str) {
    let msg = match idx {
        Some(idx) => format!("{idx}: ERROR: {error}"),
        None => format!("ERROR: {error}"),
    };
    log.error(&msg);
}
