// SPDX-License-Identifier: GPL-2.0

//! Memory access verification for the context, packet and fixed-size regions

pub mod context;
pub mod packet;

use crate::core::error::{reject, Result};
use crate::state::reg_state::RegState;

pub use context::{check_ctx_access, CtxField};
pub use packet::{check_packet_access, find_good_pkt_pointers, mark_pkt_range};

/// Check an access of `size` bytes at `reg + insn_off` into a region of
/// `region_size` bytes, such as a map value or a ring buffer record.
/// Variable offsets are covered by the pointer's bounds.
pub fn check_mem_region(
    insn_idx: usize,
    reg: &RegState,
    insn_off: i32,
    size: usize,
    region_size: u32,
) -> Result<()> {
    let fixed = i128::from(reg.off) + i128::from(insn_off);
    let lo = fixed + i128::from(reg.bounds.smin_value);
    let hi = fixed + i128::from(reg.bounds.umax_value) + size as i128;
    if reg.bounds.smin_value < 0 || lo < 0 {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid access to {}, min offset {} is negative",
            reg.reg_type.name(),
            lo
        ));
    }
    if hi > i128::from(region_size) {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid access to {}, off={} size={} value_size={}",
            reg.reg_type.name(),
            fixed,
            size,
            region_size
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::scalar::ScalarBounds;
    use crate::core::error::RejectionReason;

    #[test]
    fn test_fixed_offsets() {
        let v = RegState::map_value_or_null(0, 0);
        assert!(check_mem_region(0, &v, 0, 8, 8).is_ok());
        assert!(check_mem_region(0, &v, 4, 4, 8).is_ok());
        let e = check_mem_region(5, &v, 4, 8, 8).unwrap_err();
        assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
        assert!(check_mem_region(0, &v, -1, 1, 8).is_err());
    }

    #[test]
    fn test_variable_offset_bounded() {
        let mut v = RegState::map_value_or_null(0, 0);
        v.bounds = ScalarBounds::from_range(0, 24);
        assert!(check_mem_region(0, &v, 0, 8, 32).is_ok());
        assert!(check_mem_region(0, &v, 0, 8, 31).is_err());
        v.bounds = ScalarBounds::unknown();
        assert!(check_mem_region(0, &v, 0, 1, 32).is_err());
    }
}
