// SPDX-License-Identifier: GPL-2.0

//! Tracked numbers (tnum) - representing partially known values
//!
//! A tnum represents a value where some bits are known and others are unknown.
//! It consists of a `value` (known bits) and a `mask` (unknown bits).
//!
//! For any bit position:
//! - If mask bit is 0, the actual value at that position equals the value bit
//! - If mask bit is 1, the actual value at that position is unknown

use core::ops::{BitAnd, BitOr, BitXor};

/// A tracked number with known and unknown bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tnum {
    /// Known bit values (only valid where mask is 0)
    pub value: u64,
    /// Mask of unknown bits (1 = unknown, 0 = known)
    pub mask: u64,
}

impl Tnum {
    /// Create a new tnum with given value and mask
    pub fn new(value: u64, mask: u64) -> Self {
        Self {
            value: value & !mask,
            mask,
        }
    }

    /// A fully known constant
    pub const fn const_value(value: u64) -> Self {
        Self { value, mask: 0 }
    }

    /// A completely unknown value
    pub const fn unknown() -> Self {
        Self {
            value: 0,
            mask: u64::MAX,
        }
    }

    /// Smallest tnum covering every value in `[min, max]`
    pub fn range(min: u64, max: u64) -> Self {
        if min > max {
            return Self::unknown();
        }
        let chi = min ^ max;
        let bits = 64 - chi.leading_zeros();
        if bits >= 64 {
            return Self::unknown();
        }
        let mask = (1u64 << bits) - 1;
        Self {
            value: min & !mask,
            mask,
        }
    }

    /// All bits known
    pub fn is_const(&self) -> bool {
        self.mask == 0
    }

    /// No bit known
    pub fn is_unknown(&self) -> bool {
        self.mask == u64::MAX
    }

    /// Smallest possible value
    pub fn min(&self) -> u64 {
        self.value
    }

    /// Largest possible value
    pub fn max(&self) -> u64 {
        self.value | self.mask
    }

    /// Smallest possible value read as signed
    pub fn smin(&self) -> i64 {
        (self.value | (self.mask & (1 << 63))) as i64
    }

    /// Largest possible value read as signed
    pub fn smax(&self) -> i64 {
        (self.value | (self.mask & !(1 << 63))) as i64
    }

    /// Whether `v` is a possible value
    pub fn contains(&self, v: u64) -> bool {
        (v & !self.mask) == self.value
    }

    /// Intersect two tnums. `None` when their known bits conflict.
    pub fn intersect(self, other: Tnum) -> Option<Self> {
        let known_both = !self.mask & !other.mask;
        if (self.value ^ other.value) & known_both != 0 {
            return None;
        }
        let mu = self.mask & other.mask;
        Some(Self {
            value: (self.value | other.value) & !mu,
            mask: mu,
        })
    }

    /// Arithmetic right shift
    pub fn arsh(self, shift: u8) -> Self {
        let shift = u32::from(shift.min(63));
        Self {
            value: ((self.value as i64) >> shift) as u64,
            mask: ((self.mask as i64) >> shift) as u64,
        }
    }

    /// Logical right shift
    pub fn rsh(self, shift: u8) -> Self {
        let shift = u32::from(shift.min(63));
        Self {
            value: self.value >> shift,
            mask: self.mask >> shift,
        }
    }

    /// Left shift
    pub fn lsh(self, shift: u8) -> Self {
        let shift = u32::from(shift.min(63));
        Self {
            value: self.value << shift,
            mask: self.mask << shift,
        }
    }

    /// Add two tnums
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: Tnum) -> Self {
        let sm = self.mask.wrapping_add(other.mask);
        let sv = self.value.wrapping_add(other.value);
        let sigma = sm.wrapping_add(sv);
        let chi = sigma ^ sv;
        let mu = chi | self.mask | other.mask;
        Self {
            value: sv & !mu,
            mask: mu,
        }
    }

    /// Subtract two tnums
    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, other: Tnum) -> Self {
        let dv = self.value.wrapping_sub(other.value);
        let alpha = dv.wrapping_add(self.mask);
        let beta = dv.wrapping_sub(other.mask);
        let chi = alpha ^ beta;
        let mu = chi | self.mask | other.mask;
        Self {
            value: dv & !mu,
            mask: mu,
        }
    }

    /// Multiply two tnums
    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, other: Tnum) -> Self {
        if self.is_const() && other.is_const() {
            return Self::const_value(self.value.wrapping_mul(other.value));
        }
        // Shift-and-add over the known-one and unknown bits of `self`.
        let mut a = self;
        let mut b = other;
        let acc_v = a.value.wrapping_mul(b.value);
        let mut acc_m = Tnum::const_value(0);
        while a.value != 0 || a.mask != 0 {
            if a.value & 1 != 0 {
                acc_m = acc_m.add(Tnum::new(0, b.mask));
            } else if a.mask & 1 != 0 {
                acc_m = acc_m.add(Tnum::new(0, b.value | b.mask));
            }
            a = a.rsh(1);
            b = b.lsh(1);
        }
        Tnum::const_value(acc_v).add(acc_m)
    }

    /// Keep only the low 32 bits
    pub fn cast_u32(self) -> Self {
        Self {
            value: self.value & 0xFFFF_FFFF,
            mask: self.mask & 0xFFFF_FFFF,
        }
    }

    /// Keep only the low `bytes` bytes
    pub fn cast(self, bytes: usize) -> Self {
        if bytes >= 8 {
            return self;
        }
        let keep = (1u64 << (bytes * 8)) - 1;
        Self {
            value: self.value & keep,
            mask: self.mask & keep,
        }
    }
}

impl BitAnd for Tnum {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        let alpha = self.value | self.mask;
        let beta = other.value | other.mask;
        let v = self.value & other.value;
        Self {
            value: v,
            mask: alpha & beta & !v,
        }
    }
}

impl BitOr for Tnum {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        let v = self.value | other.value;
        let mu = self.mask | other.mask;
        Self {
            value: v,
            mask: mu & !v,
        }
    }
}

impl BitXor for Tnum {
    type Output = Self;

    fn bitxor(self, other: Self) -> Self {
        let v = self.value ^ other.value;
        let mu = self.mask | other.mask;
        Self {
            value: v & !mu,
            mask: mu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_covers_endpoints() {
        let t = Tnum::range(5, 12);
        assert!(t.contains(5));
        assert!(t.contains(12));
        assert!(t.min() <= 5 && t.max() >= 12);
    }

    #[test]
    fn test_add_const() {
        let t = Tnum::const_value(40).add(Tnum::const_value(2));
        assert_eq!(t, Tnum::const_value(42));
    }

    #[test]
    fn test_and_clears_bits() {
        let t = Tnum::unknown() & Tnum::const_value(0xff);
        assert_eq!(t.max(), 0xff);
        assert_eq!(t.min(), 0);
    }

    #[test]
    fn test_intersect_conflict() {
        assert!(Tnum::const_value(1).intersect(Tnum::const_value(2)).is_none());
        let t = Tnum::range(0, 15).intersect(Tnum::const_value(7)).unwrap();
        assert_eq!(t, Tnum::const_value(7));
    }

    #[test]
    fn test_mul_partial() {
        let t = Tnum::range(0, 3).mul(Tnum::const_value(4));
        assert!(t.contains(0) && t.contains(12));
        assert_eq!(t.value & 0b11, 0);
        assert_eq!(t.mask & 0b11, 0);
    }

    #[test]
    fn test_signed_extremes() {
        let t = Tnum::unknown();
        assert_eq!(t.smin(), i64::MIN);
        assert_eq!(t.smax(), i64::MAX);
    }
}
