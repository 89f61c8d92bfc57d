// SPDX-License-Identifier: GPL-2.0

//! Signed and unsigned bounds tracking
//!
//! A scalar is described by a tnum plus unsigned and signed 64-bit ranges.
//! The three views are kept consistent by [`ScalarBounds::sync`]. 32-bit ALU
//! operations are evaluated on the zero-extended low halves and the result is
//! kept only when it provably did not wrap.

use super::tnum::Tnum;
use crate::core::types::*;

/// Bounds for a scalar value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScalarBounds {
    /// Tracked bits (known value/unknown mask)
    pub var_off: Tnum,
    /// Minimum unsigned 64-bit value
    pub umin_value: u64,
    /// Maximum unsigned 64-bit value
    pub umax_value: u64,
    /// Minimum signed 64-bit value
    pub smin_value: i64,
    /// Maximum signed 64-bit value
    pub smax_value: i64,
}

impl Default for ScalarBounds {
    fn default() -> Self {
        Self::unknown()
    }
}

impl ScalarBounds {
    /// Fully unknown bounds
    pub const fn unknown() -> Self {
        Self {
            var_off: Tnum::unknown(),
            umin_value: 0,
            umax_value: u64::MAX,
            smin_value: i64::MIN,
            smax_value: i64::MAX,
        }
    }

    /// Bounds of a known constant
    pub const fn known(val: u64) -> Self {
        Self {
            var_off: Tnum::const_value(val),
            umin_value: val,
            umax_value: val,
            smin_value: val as i64,
            smax_value: val as i64,
        }
    }

    /// Bounds of a value in `[umin, umax]`
    pub fn from_range(umin: u64, umax: u64) -> Self {
        let mut b = Self {
            var_off: Tnum::range(umin, umax),
            umin_value: umin,
            umax_value: umax,
            smin_value: i64::MIN,
            smax_value: i64::MAX,
        };
        if !b.sync() {
            return Self::unknown();
        }
        b
    }

    /// Bounds of a value read from `bytes` bytes of memory
    pub fn of_width(bytes: usize) -> Self {
        if bytes >= 8 {
            Self::unknown()
        } else {
            Self::from_range(0, (1u64 << (bytes * 8)) - 1)
        }
    }

    /// Check if this is a known constant
    pub fn is_const(&self) -> bool {
        self.var_off.is_const() && self.umin_value == self.umax_value
    }

    /// The constant value, if known
    pub fn const_value(&self) -> Option<u64> {
        if self.is_const() {
            Some(self.umin_value)
        } else {
            None
        }
    }

    /// Whether nothing is known about the value
    pub fn is_unbounded(&self) -> bool {
        self.umin_value == 0
            && self.umax_value == u64::MAX
            && self.smin_value == i64::MIN
            && self.smax_value == i64::MAX
    }

    /// Check that min <= max in both domains
    pub fn is_sane(&self) -> bool {
        self.umin_value <= self.umax_value && self.smin_value <= self.smax_value
    }

    /// Whether the value is definitely non-negative when read as signed
    pub fn is_non_negative(&self) -> bool {
        self.smin_value >= 0
    }

    /// Whether `v` may be the value
    pub fn contains(&self, v: u64) -> bool {
        self.var_off.contains(v)
            && self.umin_value <= v
            && v <= self.umax_value
            && self.smin_value <= v as i64
            && v as i64 <= self.smax_value
    }

    fn tighten_from_tnum(&mut self) {
        self.umin_value = self.umin_value.max(self.var_off.min());
        self.umax_value = self.umax_value.min(self.var_off.max());
        self.smin_value = self.smin_value.max(self.var_off.smin());
        self.smax_value = self.smax_value.min(self.var_off.smax());
    }

    fn deduce_bounds(&mut self) {
        if self.smin_value >= 0 || self.smax_value < 0 {
            // Signed range does not cross the sign boundary, so it orders
            // values the same way as the unsigned range.
            let lo = self.umin_value.max(self.smin_value as u64);
            let hi = self.umax_value.min(self.smax_value as u64);
            self.umin_value = lo;
            self.umax_value = hi;
            self.smin_value = lo as i64;
            self.smax_value = hi as i64;
            return;
        }
        if (self.umax_value as i64) >= 0 {
            self.smin_value = self.umin_value as i64;
            let hi = self.umax_value.min(self.smax_value as u64);
            self.umax_value = hi;
            self.smax_value = hi as i64;
        } else if (self.umin_value as i64) < 0 {
            let lo = self.umin_value.max(self.smin_value as u64);
            self.umin_value = lo;
            self.smin_value = lo as i64;
            self.smax_value = self.umax_value as i64;
        }
    }

    /// Bring tnum, unsigned and signed views into agreement.
    ///
    /// Returns `false` when the bounds describe no value at all, which marks
    /// an infeasible branch.
    pub fn sync(&mut self) -> bool {
        self.tighten_from_tnum();
        if !self.is_sane() {
            return false;
        }
        self.deduce_bounds();
        if !self.is_sane() {
            return false;
        }
        match self
            .var_off
            .intersect(Tnum::range(self.umin_value, self.umax_value))
        {
            Some(t) => self.var_off = t,
            None => return false,
        }
        self.tighten_from_tnum();
        self.is_sane()
    }

    fn synced(mut self) -> Self {
        if self.sync() {
            self
        } else {
            Self::unknown()
        }
    }

    fn with_tnum(var_off: Tnum) -> Self {
        Self {
            var_off,
            ..Self::unknown()
        }
        .synced()
    }

    /// Addition
    pub fn add(&self, other: &ScalarBounds) -> ScalarBounds {
        let mut r = Self::with_tnum(self.var_off.add(other.var_off));
        if let (Some(lo), Some(hi)) = (
            self.smin_value.checked_add(other.smin_value),
            self.smax_value.checked_add(other.smax_value),
        ) {
            r.smin_value = lo;
            r.smax_value = hi;
        } else {
            r.smin_value = i64::MIN;
            r.smax_value = i64::MAX;
        }
        if let (Some(lo), Some(hi)) = (
            self.umin_value.checked_add(other.umin_value),
            self.umax_value.checked_add(other.umax_value),
        ) {
            r.umin_value = lo;
            r.umax_value = hi;
        } else {
            r.umin_value = 0;
            r.umax_value = u64::MAX;
        }
        r.synced()
    }

    /// Subtraction
    pub fn sub(&self, other: &ScalarBounds) -> ScalarBounds {
        let mut r = Self::with_tnum(self.var_off.sub(other.var_off));
        if let (Some(lo), Some(hi)) = (
            self.smin_value.checked_sub(other.smax_value),
            self.smax_value.checked_sub(other.smin_value),
        ) {
            r.smin_value = lo;
            r.smax_value = hi;
        } else {
            r.smin_value = i64::MIN;
            r.smax_value = i64::MAX;
        }
        if self.umin_value < other.umax_value {
            r.umin_value = 0;
            r.umax_value = u64::MAX;
        } else {
            r.umin_value = self.umin_value - other.umax_value;
            r.umax_value = self.umax_value - other.umin_value;
        }
        r.synced()
    }

    /// Multiplication
    pub fn mul(&self, other: &ScalarBounds) -> ScalarBounds {
        let mut r = Self::with_tnum(self.var_off.mul(other.var_off));
        if self.umax_value <= u64::from(u32::MAX) && other.umax_value <= u64::from(u32::MAX) {
            r.umin_value = self.umin_value * other.umin_value;
            r.umax_value = self.umax_value * other.umax_value;
            r.smin_value = i64::MIN;
            r.smax_value = i64::MAX;
            r.synced()
        } else {
            r
        }
    }

    /// Unsigned division; division by zero yields zero
    pub fn div(&self, other: &ScalarBounds) -> ScalarBounds {
        if other.const_value() == Some(0) {
            return Self::known(0);
        }
        if other.umin_value == 0 {
            return Self::from_range(0, self.umax_value);
        }
        Self::from_range(
            self.umin_value / other.umax_value,
            self.umax_value / other.umin_value,
        )
    }

    /// Unsigned modulo; modulo by zero leaves the dividend unchanged
    pub fn modulo(&self, other: &ScalarBounds) -> ScalarBounds {
        if other.const_value() == Some(0) {
            return *self;
        }
        if other.umin_value > 0 && self.umax_value < other.umin_value {
            return *self;
        }
        if other.umin_value == 0 {
            return Self::from_range(0, self.umax_value);
        }
        Self::from_range(0, self.umax_value.min(other.umax_value - 1))
    }

    /// Bitwise and
    pub fn and(&self, other: &ScalarBounds) -> ScalarBounds {
        let var_off = self.var_off & other.var_off;
        let mut r = Self::with_tnum(var_off);
        r.umin_value = var_off.min();
        r.umax_value = self.umax_value.min(other.umax_value).min(var_off.max());
        r.smin_value = i64::MIN;
        r.smax_value = i64::MAX;
        r.synced()
    }

    /// Bitwise or
    pub fn or(&self, other: &ScalarBounds) -> ScalarBounds {
        let var_off = self.var_off | other.var_off;
        let mut r = Self::with_tnum(var_off);
        r.umin_value = self.umin_value.max(other.umin_value).max(var_off.min());
        r.umax_value = var_off.max();
        r.smin_value = i64::MIN;
        r.smax_value = i64::MAX;
        r.synced()
    }

    /// Bitwise xor
    pub fn xor(&self, other: &ScalarBounds) -> ScalarBounds {
        Self::with_tnum(self.var_off ^ other.var_off)
    }

    /// Left shift. Shift amounts of 64 or more give an unknown result.
    pub fn lsh(&self, other: &ScalarBounds) -> ScalarBounds {
        if other.umax_value >= 64 {
            return Self::unknown();
        }
        let var_off = match other.const_value() {
            Some(s) => self.var_off.lsh(s as u8),
            None => Tnum::unknown(),
        };
        let mut r = Self::with_tnum(var_off);
        if u64::from(self.umax_value.leading_zeros()) >= other.umax_value {
            r.umin_value = self.umin_value << other.umin_value;
            r.umax_value = self.umax_value << other.umax_value;
            r.smin_value = i64::MIN;
            r.smax_value = i64::MAX;
            r.synced()
        } else {
            r
        }
    }

    /// Logical right shift
    pub fn rsh(&self, other: &ScalarBounds) -> ScalarBounds {
        if other.umax_value >= 64 {
            return Self::unknown();
        }
        let var_off = match other.const_value() {
            Some(s) => self.var_off.rsh(s as u8),
            None => Tnum::unknown(),
        };
        let mut r = Self::with_tnum(var_off);
        r.umin_value = self.umin_value >> other.umax_value;
        r.umax_value = self.umax_value >> other.umin_value;
        r.smin_value = i64::MIN;
        r.smax_value = i64::MAX;
        r.synced()
    }

    /// Arithmetic right shift
    pub fn arsh(&self, other: &ScalarBounds) -> ScalarBounds {
        match other.const_value() {
            Some(s) if s < 64 => {
                let mut r = Self::with_tnum(self.var_off.arsh(s as u8));
                r.smin_value = self.smin_value >> s;
                r.smax_value = self.smax_value >> s;
                r.umin_value = 0;
                r.umax_value = u64::MAX;
                r.synced()
            }
            _ => Self::unknown(),
        }
    }

    /// Two's complement negation
    pub fn neg(&self) -> ScalarBounds {
        Self::known(0).sub(self)
    }

    /// Apply a 64-bit ALU operation
    pub fn alu64(&self, op: u8, other: &ScalarBounds) -> ScalarBounds {
        match op {
            BPF_ADD => self.add(other),
            BPF_SUB => self.sub(other),
            BPF_MUL => self.mul(other),
            BPF_DIV => self.div(other),
            BPF_MOD => self.modulo(other),
            BPF_OR => self.or(other),
            BPF_AND => self.and(other),
            BPF_XOR => self.xor(other),
            BPF_LSH => self.lsh(other),
            BPF_RSH => self.rsh(other),
            BPF_ARSH => self.arsh(other),
            BPF_NEG => self.neg(),
            BPF_MOV => *other,
            _ => Self::unknown(),
        }
    }

    /// The zero-extended low 32 bits of this value
    pub fn subreg(&self) -> ScalarBounds {
        if let Some(v) = self.const_value() {
            return Self::known(v & 0xFFFF_FFFF);
        }
        if self.umax_value <= u64::from(u32::MAX) {
            return *self;
        }
        Self {
            var_off: self.var_off.cast_u32(),
            umin_value: 0,
            umax_value: u64::from(u32::MAX),
            smin_value: 0,
            smax_value: i64::from(u32::MAX),
        }
        .synced()
    }

    /// Apply a 32-bit ALU operation; the result is zero-extended
    pub fn alu32(&self, op: u8, other: &ScalarBounds) -> ScalarBounds {
        let a = self.subreg();
        let b = other.subreg();
        let r = match op {
            BPF_LSH | BPF_RSH | BPF_ARSH if b.umax_value >= 32 => return Self::of_width(4),
            BPF_ARSH if a.umax_value > i32::MAX as u64 => return Self::of_width(4),
            BPF_ARSH => a.rsh(&b),
            _ => a.alu64(op, &b),
        };
        r.subreg()
    }

    /// Byte swap or truncation to `bits` bits
    pub fn endian(&self, to_be: bool, bits: u32) -> ScalarBounds {
        let bytes = (bits / 8) as usize;
        if to_be {
            if let Some(v) = self.const_value() {
                let swapped = match bits {
                    16 => u64::from((v as u16).swap_bytes()),
                    32 => u64::from((v as u32).swap_bytes()),
                    _ => v.swap_bytes(),
                };
                return Self::known(swapped);
            }
            return Self::of_width(bytes);
        }
        if bits >= 64 {
            return *self;
        }
        if self.umax_value <= (1u64 << bits) - 1 {
            return *self;
        }
        Self::with_tnum(self.var_off.cast(bytes))
    }
}
