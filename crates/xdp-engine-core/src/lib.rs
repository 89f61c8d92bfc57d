// SPDX-License-Identifier: GPL-2.0

//! # xdp-engine core
//!
//! Verified bytecode for the earliest point of the packet receive path.
//!
//! Programs are eBPF-encoded instruction sequences. They must pass the
//! [`verifier`] before the [`exec`] engine will run them, and they reach
//! shared state only through typed [`maps`]. The [`pipeline`] dispatcher
//! runs the attached program on every packet and hands the resulting action
//! to the host.
//!
//! ## Module Structure
//!
//! - [`core`]: instruction encoding, errors, verifier log, disassembler
//! - [`program`]: programs, the assembler and sealed verified programs
//! - [`bounds`]: tracked numbers and scalar range arithmetic
//! - [`state`]: abstract register, stack and path state
//! - [`analysis`]: control flow graph, loop shapes, state equivalence
//! - [`check`]: per-instruction verification
//! - [`mem`]: context, packet and region access rules
//! - [`verifier`]: the verification driver
//! - [`maps`]: map storage, typed facades and the control-plane registry
//! - [`exec`]: interpreter and per-packet context
//! - [`pipeline`]: dispatcher and host interface

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod core;

pub mod program;

pub mod bounds;

pub mod state;

pub mod analysis;

pub mod check;

pub mod mem;

pub mod verifier;

pub mod maps;

pub mod exec;

pub mod pipeline;

// ============================================================================
// Prelude - commonly used re-exports
// ============================================================================

/// Commonly used items
pub mod prelude {
    pub use crate::core::error::{
        AsmError, AttachError, ExecutionError, MapError, Rejection, RejectionReason,
    };
    pub use crate::core::log::{LogLevel, VerifierLog};
    pub use crate::core::types::{
        AbstractValue, Helper, Insn, RegType, BPF_ADD, BPF_ALU, BPF_ALU64, BPF_AND, BPF_ANY,
        BPF_ARSH, BPF_ATOMIC, BPF_B, BPF_CALL, BPF_CMPXCHG, BPF_DIV, BPF_DW, BPF_END, BPF_EXIST,
        BPF_EXIT, BPF_FETCH, BPF_H, BPF_IMM, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JLE, BPF_JLT,
        BPF_JMP, BPF_JMP32, BPF_JNE, BPF_JSET, BPF_JSGE, BPF_JSGT, BPF_JSLE, BPF_JSLT, BPF_K,
        BPF_LD, BPF_LDX, BPF_LSH, BPF_MEM, BPF_MOD, BPF_MOV, BPF_MUL, BPF_NEG, BPF_NOEXIST, BPF_OR,
        BPF_RSH, BPF_ST, BPF_STX, BPF_SUB, BPF_W, BPF_X, BPF_XCHG, BPF_XOR, CTX_OFF_DATA,
        CTX_OFF_DATA_END, CTX_OFF_IFINDEX, CTX_OFF_RX_QUEUE, CTX_OFF_SCRATCH, CTX_SCRATCH_SIZE,
        HASH_BYTES_MAX, MAX_REG, MAX_STACK, REG_FP, XDP_ABORTED, XDP_DROP, XDP_PASS, XDP_REDIRECT,
        XDP_TX,
    };

    pub use crate::program::{Asm, AttachKind, Label, MapBinding, Program, VerifiedProgram};

    pub use crate::verifier::{verify, ResourceLimits, Verifier, VerifierConfig, VerifierStats};

    pub use crate::maps::{
        Array, HashMap, LruHashMap, Map, MapKind, MapSchema, MapSet, PerWorkerArray, Pod,
        RingBuffer, UpdateMode,
    };

    pub use crate::exec::{
        Clock, Engine, EngineConfig, ManualClock, MonotonicClock, PacketContext, RunScratch, RxMeta,
        Verdict,
    };

    pub use crate::pipeline::{
        Action, CollectingHost, Dispatch, Dispatcher, DispatcherConfig, FailurePolicy, Host,
        PacketStage, StatsSnapshot,
    };
}
