// SPDX-License-Identifier: GPL-2.0

//! Context access verification
//!
//! The context is a fixed 56-byte record: two packet pointers, two 32-bit
//! receive attributes and a scratch area the program may freely use for
//! scalars. Pointer fields must be loaded whole; the attributes may be read
//! narrowly.

use crate::bounds::scalar::ScalarBounds;
use crate::core::error::{reject, Result};
use crate::core::types::*;
use crate::state::reg_state::RegState;

/// What a context field holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxField {
    /// Start of packet data
    Data,
    /// End of packet data
    DataEnd,
    /// Ingress interface index
    IngressIfindex,
    /// Receive queue index
    RxQueueIndex,
    /// Program scratch area
    Scratch,
}

/// Access rules of one context field
#[derive(Debug, Clone, Copy)]
pub struct CtxFieldAccess {
    /// Offset in the context
    pub offset: i32,
    /// Size of the field
    pub size: usize,
    /// Whether programs may store to it
    pub writable: bool,
    /// Field kind
    pub field: CtxField,
}

impl CtxFieldAccess {
    const fn readable(offset: i32, size: usize, field: CtxField) -> Self {
        Self {
            offset,
            size,
            writable: false,
            field,
        }
    }

    fn end(&self) -> i64 {
        i64::from(self.offset) + self.size as i64
    }

    fn is_pointer(&self) -> bool {
        matches!(self.field, CtxField::Data | CtxField::DataEnd)
    }
}

/// Context layout
pub const CTX_FIELDS: [CtxFieldAccess; 5] = [
    CtxFieldAccess::readable(CTX_OFF_DATA, 8, CtxField::Data),
    CtxFieldAccess::readable(CTX_OFF_DATA_END, 8, CtxField::DataEnd),
    CtxFieldAccess::readable(CTX_OFF_IFINDEX, 4, CtxField::IngressIfindex),
    CtxFieldAccess::readable(CTX_OFF_RX_QUEUE, 4, CtxField::RxQueueIndex),
    CtxFieldAccess {
        offset: CTX_OFF_SCRATCH,
        size: CTX_SCRATCH_SIZE,
        writable: true,
        field: CtxField::Scratch,
    },
];

/// Field containing byte `off`
pub fn ctx_field(off: i32) -> Option<&'static CtxFieldAccess> {
    CTX_FIELDS
        .iter()
        .find(|f| off >= f.offset && i64::from(off) < f.end())
}

/// Check a context access of `size` bytes at `off`.
///
/// `value` is the stored register for writes, `None` for reads. Returns the
/// abstract value a read produces.
pub fn check_ctx_access(
    insn_idx: usize,
    off: i32,
    size: usize,
    value: Option<&RegState>,
) -> Result<RegState> {
    if off < 0 || i64::from(off) + size as i64 > CTX_SIZE as i64 {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid ctx access off={} size={}",
            off,
            size
        ));
    }
    let Some(field) = ctx_field(off) else {
        return Err(reject!(insn_idx, OutOfBoundsAccess, "invalid ctx access off={}", off));
    };
    if i64::from(off) + size as i64 > field.end() {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "ctx access off={} size={} crosses field boundary",
            off,
            size
        ));
    }

    if let Some(value) = value {
        if !field.writable {
            return Err(reject!(insn_idx, TypeMismatch, "ctx field at off={} is read-only", off));
        }
        if !value.is_scalar() {
            return Err(reject!(
                insn_idx,
                TypeMismatch,
                "cannot store {} into ctx scratch",
                value.reg_type.name()
            ));
        }
        return Ok(*value);
    }

    if field.is_pointer() && (off != field.offset || size != REG_SIZE) {
        return Err(reject!(
            insn_idx,
            TypeMismatch,
            "ctx pointer field at off={} must be loaded with 8 bytes",
            field.offset
        ));
    }
    Ok(match field.field {
        CtxField::Data => RegState::packet(),
        CtxField::DataEnd => RegState::packet_end(),
        _ => RegState::scalar(ScalarBounds::of_width(size)),
    })
}
