// SPDX-License-Identifier: GPL-2.0

//! Register state tracking
//!
//! This module tracks the abstract state of each register during
//! verification: its type, its fixed and variable offset for pointers, and
//! numeric bounds for scalars.

use crate::bounds::scalar::ScalarBounds;
use crate::core::types::*;

/// State of a single register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegState {
    /// Type of value in this register
    pub reg_type: RegType,
    /// Pointer qualifiers
    pub type_flags: TypeFlag,
    /// Fixed offset for pointer types
    pub off: i32,
    /// Scalar value, or the variable part of a pointer offset
    pub bounds: ScalarBounds,
    /// Identity shared by copies of the same pointer. Packet pointers with the
    /// same id share a proven range; nullable pointers with the same id are
    /// checked together.
    pub id: u32,
    /// Reference this pointer holds, 0 if none
    pub ref_obj_id: u32,
    /// Map index for map handles and map value pointers
    pub map_idx: u32,
    /// Bytes proven accessible past the base of a packet pointer
    pub range: u32,
    /// Size of the memory behind a ring buffer record pointer
    pub mem_size: u32,
}

impl RegState {
    /// An uninitialized register
    pub fn not_init() -> Self {
        Self {
            bounds: ScalarBounds::unknown(),
            ..Default::default()
        }
    }

    /// A scalar with the given bounds
    pub fn scalar(bounds: ScalarBounds) -> Self {
        Self {
            reg_type: RegType::Scalar,
            bounds,
            ..Self::not_init()
        }
    }

    /// A scalar with unknown value
    pub fn unknown_scalar() -> Self {
        Self::scalar(ScalarBounds::unknown())
    }

    /// A known constant
    pub fn known(val: u64) -> Self {
        Self::scalar(ScalarBounds::known(val))
    }

    fn pointer(reg_type: RegType) -> Self {
        Self {
            reg_type,
            bounds: ScalarBounds::known(0),
            ..Self::not_init()
        }
    }

    /// The context pointer passed in r1
    pub fn ctx() -> Self {
        Self::pointer(RegType::PtrToCtx)
    }

    /// Frame pointer plus a fixed offset
    pub fn stack(off: i32) -> Self {
        Self {
            off,
            ..Self::pointer(RegType::PtrToStack)
        }
    }

    /// Packet start as loaded from the context
    pub fn packet() -> Self {
        Self::pointer(RegType::PtrToPacket)
    }

    /// Packet end as loaded from the context
    pub fn packet_end() -> Self {
        Self::pointer(RegType::PtrToPacketEnd)
    }

    /// Handle of the declared map at `map_idx`
    pub fn map_ptr(map_idx: u32) -> Self {
        Self {
            map_idx,
            ..Self::pointer(RegType::ConstPtrToMap)
        }
    }

    /// Result of a map lookup, NULL until checked
    pub fn map_value_or_null(map_idx: u32, id: u32) -> Self {
        Self {
            map_idx,
            id,
            type_flags: TypeFlag::MAYBE_NULL,
            ..Self::pointer(RegType::PtrToMapValue)
        }
    }

    /// Result of a ring buffer reservation, NULL until checked
    pub fn ringbuf_or_null(mem_size: u32, ref_obj_id: u32) -> Self {
        Self {
            mem_size,
            id: ref_obj_id,
            ref_obj_id,
            type_flags: TypeFlag::MAYBE_NULL,
            ..Self::pointer(RegType::PtrToRingbufRecord)
        }
    }

    /// Whether the register holds anything
    pub fn is_init(&self) -> bool {
        self.reg_type != RegType::NotInit
    }

    /// Whether the register is a scalar
    pub fn is_scalar(&self) -> bool {
        self.reg_type == RegType::Scalar
    }

    /// Whether the register holds a pointer
    pub fn is_pointer(&self) -> bool {
        self.reg_type.is_pointer()
    }

    /// Whether the pointer still needs a NULL check
    pub fn maybe_null(&self) -> bool {
        self.type_flags.contains(TypeFlag::MAYBE_NULL)
    }

    /// Whether the register is a known scalar constant
    pub fn is_const(&self) -> bool {
        self.is_scalar() && self.bounds.is_const()
    }

    /// The constant value, if this is a known scalar
    pub fn const_value(&self) -> Option<u64> {
        if self.is_scalar() {
            self.bounds.const_value()
        } else {
            None
        }
    }

    /// Forget everything but the scalar type
    pub fn mark_unknown(&mut self) {
        *self = Self::unknown_scalar();
    }

    /// Replace with a known scalar
    pub fn mark_known(&mut self, val: u64) {
        *self = Self::known(val);
    }

    /// Coarse view of this register
    pub fn abstract_value(&self) -> AbstractValue {
        match self.reg_type {
            RegType::NotInit => AbstractValue::Invalid,
            RegType::Scalar => {
                if self.bounds.umin_value == 0 && self.bounds.umax_value == u64::MAX {
                    AbstractValue::ScalarUnknownRange
                } else {
                    AbstractValue::ScalarBoundedRange {
                        lo: self.bounds.umin_value,
                        hi: self.bounds.umax_value,
                    }
                }
            }
            RegType::PtrToPacket => AbstractValue::PacketPointer {
                off: self.off,
                range: self.range,
            },
            RegType::PtrToMapValue => AbstractValue::MapValuePointer {
                map_idx: self.map_idx,
                off: self.off,
            },
            other => AbstractValue::Pointer(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abstract_value_views() {
        assert_eq!(RegState::not_init().abstract_value(), AbstractValue::Invalid);
        assert_eq!(
            RegState::unknown_scalar().abstract_value(),
            AbstractValue::ScalarUnknownRange
        );
        assert_eq!(
            RegState::known(7).abstract_value(),
            AbstractValue::ScalarBoundedRange { lo: 7, hi: 7 }
        );
        assert_eq!(
            RegState::packet().abstract_value(),
            AbstractValue::PacketPointer { off: 0, range: 0 }
        );
    }

    #[test]
    fn test_nullable_lookup() {
        let r = RegState::map_value_or_null(2, 5);
        assert!(r.maybe_null());
        assert!(r.is_pointer());
        assert_eq!(r.const_value(), None);
    }
}
