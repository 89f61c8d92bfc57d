// SPDX-License-Identifier: GPL-2.0

//! Range refinement for conditional branches
//!
//! Decides branch outcomes from known bounds and narrows both operands on
//! each edge of a conditional jump.

use super::scalar::ScalarBounds;
use super::tnum::Tnum;
use crate::core::types::*;

/// Branch condition, always read as `dst <cond> src`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// unsigned `>`
    Gt,
    /// unsigned `>=`
    Ge,
    /// unsigned `<`
    Lt,
    /// unsigned `<=`
    Le,
    /// signed `>`
    Sgt,
    /// signed `>=`
    Sge,
    /// signed `<`
    Slt,
    /// signed `<=`
    Sle,
    /// `dst & src != 0`
    Set,
    /// `dst & src == 0`
    NotSet,
}

impl BranchCond {
    /// Decode from a jump opcode
    pub fn from_opcode(op: u8) -> Option<Self> {
        Some(match op {
            BPF_JEQ => Self::Eq,
            BPF_JNE => Self::Ne,
            BPF_JGT => Self::Gt,
            BPF_JGE => Self::Ge,
            BPF_JLT => Self::Lt,
            BPF_JLE => Self::Le,
            BPF_JSGT => Self::Sgt,
            BPF_JSGE => Self::Sge,
            BPF_JSLT => Self::Slt,
            BPF_JSLE => Self::Sle,
            BPF_JSET => Self::Set,
            _ => return None,
        })
    }

    /// The condition that holds on the fall-through edge
    pub fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Sgt => Self::Sle,
            Self::Sge => Self::Slt,
            Self::Slt => Self::Sge,
            Self::Sle => Self::Sgt,
            Self::Set => Self::NotSet,
            Self::NotSet => Self::Set,
        }
    }

    /// The same condition with operands exchanged (`a < b` becomes `b > a`)
    pub fn swap(self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Sgt => Self::Slt,
            Self::Sge => Self::Sle,
            Self::Slt => Self::Sgt,
            Self::Sle => Self::Sge,
            other => other,
        }
    }

    /// Whether the comparison is signed
    pub fn is_signed(self) -> bool {
        matches!(self, Self::Sgt | Self::Sge | Self::Slt | Self::Sle)
    }

    /// `dst` is bounded from above by `src`
    pub fn is_upper_bound(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Slt | Self::Sle)
    }

    /// `dst` is bounded from below by `src`
    pub fn is_lower_bound(self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Sgt | Self::Sge)
    }

    /// Whether the bound itself is excluded
    pub fn is_strict(self) -> bool {
        matches!(self, Self::Lt | Self::Gt | Self::Slt | Self::Sgt)
    }

    /// Operator as printed by the disassembler
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Sgt => "s>",
            Self::Sge => "s>=",
            Self::Slt => "s<",
            Self::Sle => "s<=",
            Self::Set => "&",
            Self::NotSet => "!&",
        }
    }
}

/// Result of analysing a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Condition holds for every possible value
    AlwaysTaken,
    /// Condition holds for no possible value
    NeverTaken,
    /// Both edges are feasible
    Unknown,
}

impl From<Option<bool>> for BranchOutcome {
    fn from(v: Option<bool>) -> Self {
        match v {
            Some(true) => Self::AlwaysTaken,
            Some(false) => Self::NeverTaken,
            None => Self::Unknown,
        }
    }
}

/// Decide `a <cond> b` from bounds alone
pub fn is_branch_taken(a: &ScalarBounds, b: &ScalarBounds, cond: BranchCond) -> Option<bool> {
    match cond {
        BranchCond::Eq => {
            if let (Some(x), Some(y)) = (a.const_value(), b.const_value()) {
                return Some(x == y);
            }
            let disjoint = a.umax_value < b.umin_value
                || a.umin_value > b.umax_value
                || a.smax_value < b.smin_value
                || a.smin_value > b.smax_value
                || a.var_off.intersect(b.var_off).is_none();
            if disjoint {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::Ne => is_branch_taken(a, b, BranchCond::Eq).map(|t| !t),
        BranchCond::Gt => {
            if a.umin_value > b.umax_value {
                Some(true)
            } else if a.umax_value <= b.umin_value {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::Ge => {
            if a.umin_value >= b.umax_value {
                Some(true)
            } else if a.umax_value < b.umin_value {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::Sgt => {
            if a.smin_value > b.smax_value {
                Some(true)
            } else if a.smax_value <= b.smin_value {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::Sge => {
            if a.smin_value >= b.smax_value {
                Some(true)
            } else if a.smax_value < b.smin_value {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::Lt | BranchCond::Le | BranchCond::Slt | BranchCond::Sle => {
            is_branch_taken(b, a, cond.swap())
        }
        BranchCond::Set => {
            if a.var_off.value & b.var_off.value != 0 {
                Some(true)
            } else if a.var_off.max() & b.var_off.max() == 0 {
                Some(false)
            } else {
                None
            }
        }
        BranchCond::NotSet => is_branch_taken(a, b, BranchCond::Set).map(|t| !t),
    }
}

/// Decide a 32-bit comparison, when the 64-bit view is exact
pub fn is_branch32_taken(a: &ScalarBounds, b: &ScalarBounds, cond: BranchCond) -> Option<bool> {
    if fits_subreg(a, cond) && fits_subreg(b, cond) {
        is_branch_taken(a, b, cond)
    } else {
        None
    }
}

/// Whether a 32-bit comparison on this value equals the 64-bit one
pub fn fits_subreg(v: &ScalarBounds, cond: BranchCond) -> bool {
    if cond.is_signed() {
        v.umax_value <= i32::MAX as u64
    } else {
        v.umax_value <= u64::from(u32::MAX)
    }
}

/// Narrow `a` and `b` assuming `a <cond> b` holds.
///
/// Returns `None` when the condition cannot hold.
pub fn refine_regs(
    a: &ScalarBounds,
    b: &ScalarBounds,
    cond: BranchCond,
) -> Option<(ScalarBounds, ScalarBounds)> {
    let mut a = *a;
    let mut b = *b;
    match cond {
        BranchCond::Eq => {
            let var_off = a.var_off.intersect(b.var_off)?;
            let mut r = ScalarBounds {
                var_off,
                umin_value: a.umin_value.max(b.umin_value),
                umax_value: a.umax_value.min(b.umax_value),
                smin_value: a.smin_value.max(b.smin_value),
                smax_value: a.smax_value.min(b.smax_value),
            };
            if !r.sync() {
                return None;
            }
            return Some((r, r));
        }
        BranchCond::Ne => {
            if let Some(v) = b.const_value() {
                exclude_const(&mut a, v)?;
            }
            if let Some(v) = a.const_value() {
                exclude_const(&mut b, v)?;
            }
        }
        BranchCond::Gt => {
            a.umin_value = a.umin_value.max(b.umin_value.checked_add(1)?);
            b.umax_value = b.umax_value.min(a.umax_value.checked_sub(1)?);
        }
        BranchCond::Ge => {
            a.umin_value = a.umin_value.max(b.umin_value);
            b.umax_value = b.umax_value.min(a.umax_value);
        }
        BranchCond::Sgt => {
            a.smin_value = a.smin_value.max(b.smin_value.checked_add(1)?);
            b.smax_value = b.smax_value.min(a.smax_value.checked_sub(1)?);
        }
        BranchCond::Sge => {
            a.smin_value = a.smin_value.max(b.smin_value);
            b.smax_value = b.smax_value.min(a.smax_value);
        }
        BranchCond::Lt | BranchCond::Le | BranchCond::Slt | BranchCond::Sle => {
            let (nb, na) = refine_regs(&b, &a, cond.swap())?;
            return Some((na, nb));
        }
        BranchCond::Set => {
            if let Some(v) = b.const_value() {
                if v.is_power_of_two() {
                    a.var_off = a.var_off.intersect(Tnum::new(v, !v))?;
                }
            }
        }
        BranchCond::NotSet => {
            if let Some(v) = b.const_value() {
                a.var_off = a.var_off.intersect(Tnum::new(0, !v))?;
            }
        }
    }
    if a.sync() && b.sync() {
        Some((a, b))
    } else {
        None
    }
}

fn exclude_const(r: &mut ScalarBounds, v: u64) -> Option<()> {
    if r.const_value() == Some(v) {
        return None;
    }
    if r.umin_value == v {
        r.umin_value += 1;
    }
    if r.umax_value == v {
        r.umax_value -= 1;
    }
    if r.smin_value == v as i64 {
        r.smin_value += 1;
    }
    if r.smax_value == v as i64 {
        r.smax_value -= 1;
    }
    Some(())
}
