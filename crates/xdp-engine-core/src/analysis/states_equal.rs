// SPDX-License-Identifier: GPL-2.0

//! State equivalence for pruning
//!
//! Two states are equivalent when they agree on every register, every stack
//! byte and the set of held references, up to a consistent renaming of
//! pointer ids. Ids are allocated per path, so the same shape reached along
//! two paths usually carries different numbers.

use std::collections::BTreeMap;

use crate::state::reg_state::RegState;
use crate::state::stack_state::StackSlot;
use crate::state::verifier_state::VerifierState;

/// Bijection between ids of the current and the stored state
#[derive(Debug, Default)]
pub struct IdMap {
    cur_to_old: BTreeMap<u32, u32>,
    old_to_cur: BTreeMap<u32, u32>,
}

impl IdMap {
    /// Create a new empty ID map
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if two IDs are equivalent, recording the mapping if new
    pub fn check_ids(&mut self, cur: u32, old: u32) -> bool {
        if cur == 0 || old == 0 {
            return cur == old;
        }
        match (self.cur_to_old.get(&cur), self.old_to_cur.get(&old)) {
            (Some(&o), Some(&c)) => o == old && c == cur,
            (None, None) => {
                self.cur_to_old.insert(cur, old);
                self.old_to_cur.insert(old, cur);
                true
            }
            _ => false,
        }
    }
}

/// Register equality modulo id renaming
pub fn regs_equal(cur: &RegState, old: &RegState, idmap: &mut IdMap) -> bool {
    cur.reg_type == old.reg_type
        && cur.type_flags == old.type_flags
        && cur.off == old.off
        && cur.bounds == old.bounds
        && cur.map_idx == old.map_idx
        && cur.range == old.range
        && cur.mem_size == old.mem_size
        && idmap.check_ids(cur.id, old.id)
        && idmap.check_ids(cur.ref_obj_id, old.ref_obj_id)
}

fn slots_equal(cur: &StackSlot, old: &StackSlot, idmap: &mut IdMap) -> bool {
    if cur.kinds != old.kinds {
        return false;
    }
    match (&cur.spilled, &old.spilled) {
        (Some(c), Some(o)) => regs_equal(c, o, idmap),
        (None, None) => true,
        _ => false,
    }
}

/// Whether `cur` is equivalent to the already explored `old`
pub fn states_equal(cur: &VerifierState, old: &VerifierState) -> bool {
    let mut idmap = IdMap::new();
    if cur.refs.len() != old.refs.len() {
        return false;
    }
    let regs = cur
        .regs
        .iter()
        .zip(old.regs.iter())
        .all(|(c, o)| regs_equal(c, o, &mut idmap));
    if !regs {
        return false;
    }
    let stack = cur
        .stack
        .slots()
        .iter()
        .zip(old.stack.slots().iter())
        .all(|(c, o)| slots_equal(c, o, &mut idmap));
    stack
        && cur
            .refs
            .iter()
            .zip(old.refs.iter())
            .all(|(c, o)| idmap.check_ids(*c, *o))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamed_ids_equal() {
        let mut a = VerifierState::new();
        let mut b = VerifierState::new();
        a.regs[6] = RegState::map_value_or_null(0, 3);
        a.regs[7] = RegState::map_value_or_null(0, 3);
        b.regs[6] = RegState::map_value_or_null(0, 9);
        b.regs[7] = RegState::map_value_or_null(0, 9);
        assert!(states_equal(&a, &b));
        b.regs[7].id = 10;
        assert!(!states_equal(&a, &b));
    }

    #[test]
    fn test_bounds_differ() {
        let mut a = VerifierState::new();
        let b = VerifierState::new();
        a.regs[0] = RegState::known(1);
        assert!(!states_equal(&a, &b));
    }

    #[test]
    fn test_idmap_is_bijective() {
        let mut m = IdMap::new();
        assert!(m.check_ids(1, 5));
        assert!(!m.check_ids(2, 5));
        assert!(!m.check_ids(1, 6));
        assert!(m.check_ids(0, 0));
        assert!(!m.check_ids(0, 4));
    }
}
