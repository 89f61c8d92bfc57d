// SPDX-License-Identifier: GPL-2.0

//! Error types for verification, maps and execution

use std::fmt;

use thiserror::Error;

/// Result type alias for verifier operations
pub type Result<T> = core::result::Result<T, Rejection>;

/// Why a program was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// Memory access not proven to stay inside its region
    OutOfBoundsAccess,
    /// Loop without a provable trip bound
    UnboundedLoop,
    /// Operand type does not fit the operation
    TypeMismatch,
    /// Call to a helper that does not exist or is not allowed here
    DisallowedCall,
    /// Verification exceeded its complexity budget
    ComplexityExceeded,
    /// Structurally invalid program
    MalformedProgram,
    /// Read of an uninitialized register or stack byte
    UninitializedRead,
    /// Acquired reference still held at exit
    UnreleasedReference,
    /// Return value is not a valid verdict code
    InvalidReturn,
    /// Declared map is missing or has a different schema
    MapSchemaMismatch,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionReason::OutOfBoundsAccess => "out-of-bounds access",
            RejectionReason::UnboundedLoop => "unbounded loop",
            RejectionReason::TypeMismatch => "type mismatch",
            RejectionReason::DisallowedCall => "disallowed call",
            RejectionReason::ComplexityExceeded => "complexity exceeded",
            RejectionReason::MalformedProgram => "malformed program",
            RejectionReason::UninitializedRead => "uninitialized read",
            RejectionReason::UnreleasedReference => "unreleased reference",
            RejectionReason::InvalidReturn => "invalid return value",
            RejectionReason::MapSchemaMismatch => "map schema mismatch",
        };
        f.write_str(s)
    }
}

/// A structured verification failure
#[derive(Debug, Clone, Error)]
#[error("{reason}{}: {message}", at_suffix(.insn_idx))]
pub struct Rejection {
    /// Offending instruction, when the failure is tied to one
    pub insn_idx: Option<usize>,
    /// Category of the failure
    pub reason: RejectionReason,
    /// Human readable detail
    pub message: String,
    /// Tail of the verifier log at the time of rejection
    pub log: String,
}

impl Rejection {
    /// Create a rejection tied to an instruction
    pub fn at(insn_idx: usize, reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            insn_idx: Some(insn_idx),
            reason,
            message: message.into(),
            log: String::new(),
        }
    }

    /// Create a rejection for the program as a whole
    pub fn program(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            insn_idx: None,
            reason,
            message: message.into(),
            log: String::new(),
        }
    }

    /// Attach an instruction index if none is set yet
    pub fn or_at(mut self, insn_idx: usize) -> Self {
        if self.insn_idx.is_none() {
            self.insn_idx = Some(insn_idx);
        }
        self
    }
}

fn at_suffix(insn_idx: &Option<usize>) -> String {
    match insn_idx {
        Some(idx) => format!(" at insn {}", idx),
        None => String::new(),
    }
}

/// Shorthand constructors used throughout the checks
macro_rules! reject {
    ($idx:expr, $reason:ident, $($arg:tt)+) => {
        $crate::core::error::Rejection::at(
            $idx,
            $crate::core::error::RejectionReason::$reason,
            format!($($arg)+),
        )
    };
}
pub(crate) use reject;

/// Errors from map operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// Map is at capacity
    #[error("map is full")]
    Full,

    /// Key already present (create-only insert)
    #[error("key already exists")]
    Exists,

    /// Key not present
    #[error("key not found")]
    Missing,

    /// Key has the wrong size
    #[error("key size mismatch: expected {expected}, got {got}")]
    KeySize {
        /// Declared key size
        expected: usize,
        /// Supplied key size
        got: usize,
    },

    /// Value has the wrong size
    #[error("value size mismatch: expected {expected}, got {got}")]
    ValueSize {
        /// Declared value size
        expected: usize,
        /// Supplied value size
        got: usize,
    },

    /// Array or worker index out of range
    #[error("index {index} out of range (max {max})")]
    IndexOutOfRange {
        /// Requested index
        index: u64,
        /// Number of slots
        max: u64,
    },

    /// Operation not supported by this map kind
    #[error("{op} not supported on {kind} maps")]
    Unsupported {
        /// Map kind name
        kind: &'static str,
        /// Operation name
        op: &'static str,
    },

    /// Schema rejected at creation
    #[error("invalid map schema: {0}")]
    InvalidSchema(String),

    /// A map with this name already exists
    #[error("map {0:?} already exists")]
    Duplicate(String),

    /// No map with this name
    #[error("map {0:?} not found")]
    NotFound(String),

    /// Ring buffer has no free slot
    #[error("ring buffer full")]
    RingFull,
}

impl MapError {
    /// Negative errno as returned to programs by helpers
    pub fn errno(&self) -> i64 {
        match self {
            MapError::Full => -7,     // E2BIG
            MapError::Exists => -17,  // EEXIST
            MapError::Missing => -2,  // ENOENT
            MapError::RingFull => -28, // ENOSPC
            MapError::Unsupported { .. } => -95, // EOPNOTSUPP
            _ => -22,                 // EINVAL
        }
    }
}

/// Errors raised while running a verified program
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Instruction budget exhausted
    #[error("instruction budget of {budget} exceeded")]
    BudgetExceeded {
        /// Configured budget
        budget: u64,
    },

    /// Memory access outside its region
    #[error("runtime bounds violation at insn {insn_idx}: addr {addr:#x} size {size}")]
    RuntimeBoundsViolation {
        /// Instruction performing the access
        insn_idx: usize,
        /// Tagged address
        addr: u64,
        /// Access size
        size: usize,
    },

    /// Helper call rejected at run time
    #[error("disallowed call to helper {helper} at insn {insn_idx}")]
    DisallowedCall {
        /// Instruction performing the call
        insn_idx: usize,
        /// Helper id
        helper: i32,
    },

    /// Opcode the interpreter cannot execute
    #[error("invalid instruction at {insn_idx}")]
    InvalidInstruction {
        /// Instruction index
        insn_idx: usize,
    },

    /// Program returned REDIRECT without choosing a target
    #[error("redirect verdict without a target")]
    MissingRedirectTarget,

    /// Program returned a value that is not a verdict code
    #[error("invalid return code {0}")]
    InvalidReturnCode(u64),

    /// A ring buffer reservation was still open at exit
    #[error("ring buffer reservation not released")]
    UnreleasedReservation,
}

/// Errors from attaching a program to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// A per-worker map has fewer copies than the dispatcher has workers
    #[error("map {map:?} has {copies} per-worker copies but {workers} workers receive packets")]
    TooFewWorkerCopies {
        /// Map name
        map: String,
        /// Copies the map holds
        copies: usize,
        /// Configured workers
        workers: usize,
    },
}

/// Errors from the assembler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    /// Jump to a label that was never bound
    #[error("unbound label {0}")]
    UnboundLabel(usize),

    /// Label bound twice
    #[error("label {0} bound twice")]
    DuplicateLabel(usize),

    /// Jump distance does not fit in 16 bits
    #[error("jump from {from} to {to} out of range")]
    JumpOutOfRange {
        /// Jump instruction index
        from: usize,
        /// Target index
        to: usize,
    },
}
