// SPDX-License-Identifier: GPL-2.0

//! Core types and constants
//!
//! Instruction encoding, register numbering, the packet context layout seen
//! by programs, verdict codes and helper identifiers.

use bitflags::bitflags;

// ============================================================================
// Constants
// ============================================================================

/// Number of registers
pub const MAX_REG: usize = 11;

/// Frame pointer register
pub const REG_FP: usize = 10;

/// Return value register
pub const REG_0: usize = 0;
/// First argument register
pub const REG_1: usize = 1;
/// Second argument register
pub const REG_2: usize = 2;
/// Third argument register
pub const REG_3: usize = 3;
/// Fourth argument register
pub const REG_4: usize = 4;
/// Fifth argument register
pub const REG_5: usize = 5;

/// Size of a register in bytes
pub const REG_SIZE: usize = 8;

/// Stack size per program
pub const MAX_STACK: usize = 512;

/// Registers clobbered by a helper call
pub const CALLER_SAVED: [usize; 6] = [REG_0, REG_1, REG_2, REG_3, REG_4, REG_5];

/// Largest packet offset the verifier will reason about
pub const MAX_PACKET_OFF: u64 = 0xffff;

/// Largest packet accepted by [`crate::exec::PacketContext`]
pub const MAX_PACKET_LEN: usize = MAX_PACKET_OFF as usize;

// ============================================================================
// Instruction classes
// ============================================================================

/// Load from immediate
pub const BPF_LD: u8 = 0x00;
/// Load from register
pub const BPF_LDX: u8 = 0x01;
/// Store immediate
pub const BPF_ST: u8 = 0x02;
/// Store register
pub const BPF_STX: u8 = 0x03;
/// 32-bit ALU
pub const BPF_ALU: u8 = 0x04;
/// 64-bit jumps
pub const BPF_JMP: u8 = 0x05;
/// 32-bit jumps
pub const BPF_JMP32: u8 = 0x06;
/// 64-bit ALU
pub const BPF_ALU64: u8 = 0x07;

// Sizes
/// Word (4 bytes)
pub const BPF_W: u8 = 0x00;
/// Half word (2 bytes)
pub const BPF_H: u8 = 0x08;
/// Byte
pub const BPF_B: u8 = 0x10;
/// Double word (8 bytes)
pub const BPF_DW: u8 = 0x18;

// Modes
/// Immediate
pub const BPF_IMM: u8 = 0x00;
/// Legacy absolute packet load (unsupported)
pub const BPF_ABS: u8 = 0x20;
/// Legacy indirect packet load (unsupported)
pub const BPF_IND: u8 = 0x40;
/// Memory
pub const BPF_MEM: u8 = 0x60;
/// Sign-extending load (unsupported)
pub const BPF_MEMSX: u8 = 0x80;
/// Atomic read-modify-write
pub const BPF_ATOMIC: u8 = 0xc0;

// ALU operations
/// Addition
pub const BPF_ADD: u8 = 0x00;
/// Subtraction
pub const BPF_SUB: u8 = 0x10;
/// Multiplication
pub const BPF_MUL: u8 = 0x20;
/// Unsigned division
pub const BPF_DIV: u8 = 0x30;
/// Bitwise or
pub const BPF_OR: u8 = 0x40;
/// Bitwise and
pub const BPF_AND: u8 = 0x50;
/// Left shift
pub const BPF_LSH: u8 = 0x60;
/// Logical right shift
pub const BPF_RSH: u8 = 0x70;
/// Negation
pub const BPF_NEG: u8 = 0x80;
/// Unsigned modulo
pub const BPF_MOD: u8 = 0x90;
/// Bitwise xor
pub const BPF_XOR: u8 = 0xa0;
/// Move
pub const BPF_MOV: u8 = 0xb0;
/// Arithmetic right shift
pub const BPF_ARSH: u8 = 0xc0;
/// Byte swap
pub const BPF_END: u8 = 0xd0;

// Jump operations
/// Unconditional jump
pub const BPF_JA: u8 = 0x00;
/// Jump if equal
pub const BPF_JEQ: u8 = 0x10;
/// Jump if greater (unsigned)
pub const BPF_JGT: u8 = 0x20;
/// Jump if greater or equal (unsigned)
pub const BPF_JGE: u8 = 0x30;
/// Jump if any bit set
pub const BPF_JSET: u8 = 0x40;
/// Jump if not equal
pub const BPF_JNE: u8 = 0x50;
/// Jump if greater (signed)
pub const BPF_JSGT: u8 = 0x60;
/// Jump if greater or equal (signed)
pub const BPF_JSGE: u8 = 0x70;
/// Helper call
pub const BPF_CALL: u8 = 0x80;
/// Program exit
pub const BPF_EXIT: u8 = 0x90;
/// Jump if less (unsigned)
pub const BPF_JLT: u8 = 0xa0;
/// Jump if less or equal (unsigned)
pub const BPF_JLE: u8 = 0xb0;
/// Jump if less (signed)
pub const BPF_JSLT: u8 = 0xc0;
/// Jump if less or equal (signed)
pub const BPF_JSLE: u8 = 0xd0;

// Source operand
/// Immediate operand
pub const BPF_K: u8 = 0x00;
/// Register operand
pub const BPF_X: u8 = 0x08;

// Byte swap direction (shares the source bit)
/// Convert to little endian
pub const BPF_TO_LE: u8 = 0x00;
/// Convert to big endian
pub const BPF_TO_BE: u8 = 0x08;

// Atomic operations (carried in imm)
/// Fetch flag: old value is written back to src
pub const BPF_FETCH: i32 = 0x01;
/// Atomic exchange
pub const BPF_XCHG: i32 = 0xe0 | BPF_FETCH;
/// Atomic compare and exchange against r0
pub const BPF_CMPXCHG: i32 = 0xf0 | BPF_FETCH;

/// `src_reg` marker of a 64-bit immediate load that yields a map handle
pub const PSEUDO_MAP_IDX: u8 = 1;
/// `src_reg` marker of a bpf-to-bpf call (unsupported)
pub const PSEUDO_CALL: u8 = 1;

// ============================================================================
// Packet context layout
// ============================================================================

/// Offset of the packet start pointer
pub const CTX_OFF_DATA: i32 = 0;
/// Offset of the packet end pointer
pub const CTX_OFF_DATA_END: i32 = 8;
/// Offset of the ingress interface index (u32)
pub const CTX_OFF_IFINDEX: i32 = 16;
/// Offset of the receive queue index (u32)
pub const CTX_OFF_RX_QUEUE: i32 = 20;
/// Offset of the scratch area
pub const CTX_OFF_SCRATCH: i32 = 24;
/// Size of the scratch area
pub const CTX_SCRATCH_SIZE: usize = 32;
/// Total size of the context as seen by programs
pub const CTX_SIZE: usize = CTX_OFF_SCRATCH as usize + CTX_SCRATCH_SIZE;

// ============================================================================
// Verdict codes
// ============================================================================

/// Program aborted: treated as an error verdict
pub const XDP_ABORTED: u64 = 0;
/// Drop the packet
pub const XDP_DROP: u64 = 1;
/// Forward into the host stack
pub const XDP_PASS: u64 = 2;
/// Transmit back out of the receiving interface
pub const XDP_TX: u64 = 3;
/// Redirect to the target chosen by the redirect helper
pub const XDP_REDIRECT: u64 = 4;

// ============================================================================
// Register types
// ============================================================================

/// Abstract type of a register or spilled stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegType {
    /// Register is not initialized
    #[default]
    NotInit,
    /// Scalar value (not a pointer)
    Scalar,
    /// Pointer to the packet context
    PtrToCtx,
    /// Pointer into the stack frame
    PtrToStack,
    /// Pointer into packet data
    PtrToPacket,
    /// The packet end pointer
    PtrToPacketEnd,
    /// Handle of a declared map
    ConstPtrToMap,
    /// Pointer into a map value
    PtrToMapValue,
    /// Pointer into a reserved ring buffer record
    PtrToRingbufRecord,
}

impl RegType {
    /// Check if this is a pointer type
    pub fn is_pointer(&self) -> bool {
        !matches!(self, RegType::NotInit | RegType::Scalar)
    }

    /// Short name used in logs and rejection messages
    pub fn name(&self) -> &'static str {
        match self {
            RegType::NotInit => "?",
            RegType::Scalar => "scalar",
            RegType::PtrToCtx => "ctx",
            RegType::PtrToStack => "fp",
            RegType::PtrToPacket => "pkt",
            RegType::PtrToPacketEnd => "pkt_end",
            RegType::ConstPtrToMap => "map_ptr",
            RegType::PtrToMapValue => "map_value",
            RegType::PtrToRingbufRecord => "ringbuf_mem",
        }
    }
}

bitflags! {
    /// Flags qualifying a pointer type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlag: u8 {
        /// Pointer may be NULL until checked
        const MAYBE_NULL = 1 << 0;
        /// Memory may only be read
        const RDONLY = 1 << 1;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Helper functions callable from programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Helper {
    /// Look up a map value
    MapLookupElem = 1,
    /// Insert or update a map entry
    MapUpdateElem = 2,
    /// Delete a map entry
    MapDeleteElem = 3,
    /// Monotonic clock in nanoseconds
    KtimeGetNs = 4,
    /// Choose the redirect target
    Redirect = 5,
    /// Hash a memory region
    HashBytes = 6,
    /// Copy a record into a ring buffer
    RingbufOutput = 7,
    /// Reserve a ring buffer record
    RingbufReserve = 8,
    /// Publish a reserved record
    RingbufSubmit = 9,
    /// Drop a reserved record
    RingbufDiscard = 10,
    /// Index of the worker running the program
    GetWorkerId = 11,
}

impl Helper {
    /// Every helper, in id order
    pub const ALL: [Helper; 11] = [
        Helper::MapLookupElem,
        Helper::MapUpdateElem,
        Helper::MapDeleteElem,
        Helper::KtimeGetNs,
        Helper::Redirect,
        Helper::HashBytes,
        Helper::RingbufOutput,
        Helper::RingbufReserve,
        Helper::RingbufSubmit,
        Helper::RingbufDiscard,
        Helper::GetWorkerId,
    ];

    /// Resolve a helper from its call immediate
    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|h| *h as i32 == id)
    }

    /// Helper name as printed by the disassembler
    pub fn name(&self) -> &'static str {
        match self {
            Helper::MapLookupElem => "map_lookup_elem",
            Helper::MapUpdateElem => "map_update_elem",
            Helper::MapDeleteElem => "map_delete_elem",
            Helper::KtimeGetNs => "ktime_get_ns",
            Helper::Redirect => "redirect",
            Helper::HashBytes => "hash_bytes",
            Helper::RingbufOutput => "ringbuf_output",
            Helper::RingbufReserve => "ringbuf_reserve",
            Helper::RingbufSubmit => "ringbuf_submit",
            Helper::RingbufDiscard => "ringbuf_discard",
            Helper::GetWorkerId => "get_worker_id",
        }
    }
}

/// Upper bound on the length argument of `hash_bytes`
pub const HASH_BYTES_MAX: u64 = 64;

/// Update flag: create or replace
pub const BPF_ANY: u64 = 0;
/// Update flag: create only
pub const BPF_NOEXIST: u64 = 1;
/// Update flag: replace only
pub const BPF_EXIST: u64 = 2;

// ============================================================================
// Instructions
// ============================================================================

/// A single instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Insn {
    /// Opcode
    pub code: u8,
    /// Destination register
    pub dst_reg: u8,
    /// Source register
    pub src_reg: u8,
    /// Signed offset
    pub off: i16,
    /// Signed immediate
    pub imm: i32,
}

impl Insn {
    /// Create a new instruction
    pub const fn new(code: u8, dst_reg: u8, src_reg: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            dst_reg,
            src_reg,
            off,
            imm,
        }
    }

    /// Instruction class
    pub fn class(&self) -> u8 {
        self.code & 0x07
    }

    /// Memory access size field
    pub fn size(&self) -> u8 {
        self.code & 0x18
    }

    /// Memory mode field
    pub fn mode(&self) -> u8 {
        self.code & 0xe0
    }

    /// ALU or jump operation
    pub fn op(&self) -> u8 {
        self.code & 0xf0
    }

    /// Source operand selector
    pub fn src(&self) -> u8 {
        self.code & 0x08
    }

    /// Whether this is the first slot of a 64-bit immediate load
    pub fn is_ld_imm64(&self) -> bool {
        self.code == (BPF_LD | BPF_IMM | BPF_DW)
    }

    /// Whether this is a conditional jump
    pub fn is_cond_jump(&self) -> bool {
        matches!(self.class(), BPF_JMP | BPF_JMP32)
            && !matches!(self.op(), BPF_JA | BPF_CALL | BPF_EXIT)
    }

    /// Whether this is an unconditional jump
    pub fn is_ja(&self) -> bool {
        self.class() == BPF_JMP && self.op() == BPF_JA
    }

    /// Whether this is a helper call
    pub fn is_call(&self) -> bool {
        self.class() == BPF_JMP && self.op() == BPF_CALL
    }

    /// Whether this is a program exit
    pub fn is_exit(&self) -> bool {
        self.class() == BPF_JMP && self.op() == BPF_EXIT
    }
}

/// Access size in bytes for a size field
pub fn bytes_for_size(size: u8) -> usize {
    match size {
        BPF_B => 1,
        BPF_H => 2,
        BPF_W => 4,
        _ => 8,
    }
}

// ============================================================================
// Abstract values
// ============================================================================

/// Coarse view of what the verifier knows about a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractValue {
    /// Scalar with no useful bound
    ScalarUnknownRange,
    /// Scalar proven to lie in `lo..=hi` (unsigned)
    ScalarBoundedRange {
        /// Lower bound
        lo: u64,
        /// Upper bound
        hi: u64,
    },
    /// Pointer into the packet, with `range` bytes proven readable from its base
    PacketPointer {
        /// Fixed offset from the base
        off: i32,
        /// Proven accessible bytes
        range: u32,
    },
    /// Pointer into a value of the declared map at `map_idx`
    MapValuePointer {
        /// Index of the map in the program's declarations
        map_idx: u32,
        /// Fixed offset into the value
        off: i32,
    },
    /// Any other pointer kind
    Pointer(RegType),
    /// Uninitialized or invalidated
    Invalid,
}
