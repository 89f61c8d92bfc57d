// SPDX-License-Identifier: GPL-2.0

//! Packet data access verification
//!
//! Packet pointers carry a fixed offset, an optional variable part and a
//! proven `range`: the number of bytes past `pkt + var` known to be inside
//! the packet. Ranges are granted by comparing a packet pointer against
//! `pkt_end`:
//!
//! ```text
//! r2 = r1 + 14
//! if r2 > pkt_end goto drop   // fall-through: range(r1) = 14
//! r3 = *(u16 *)(r1 + 12)      // ok: 12 + 2 <= 14
//! ```
//!
//! All copies of a pointer share its id, so a proof made through one copy
//! holds for all of them.

use crate::bounds::range_refine::BranchCond;
use crate::core::error::{reject, Result};
use crate::core::types::*;
use crate::state::reg_state::RegState;
use crate::state::verifier_state::VerifierState;

/// Ethernet header length
pub const ETH_HLEN: i32 = 14;

/// Minimum IPv4 header length
pub const IPV4_HLEN_MIN: i32 = 20;

/// Check an access of `size` bytes at `reg + insn_off`
pub fn check_packet_access(
    insn_idx: usize,
    reg: &RegState,
    insn_off: i32,
    size: usize,
) -> Result<()> {
    let lo = i64::from(reg.off) + i64::from(insn_off);
    let hi = lo + size as i64;
    if lo < 0 {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid access to packet, off={} size={}",
            lo,
            size
        ));
    }
    if reg.bounds.smin_value < 0 {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "packet pointer has negative variable offset"
        ));
    }
    if reg.bounds.umax_value.saturating_add(hi as u64) > MAX_PACKET_OFF {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "packet offset {}+{} too large",
            reg.bounds.umax_value,
            hi
        ));
    }
    if hi > i64::from(reg.range) {
        return Err(reject!(
            insn_idx,
            OutOfBoundsAccess,
            "invalid access to packet, off={} size={}, R range={}",
            lo,
            size,
            reg.range
        ));
    }
    Ok(())
}

/// Range granted to `reg` on an edge where `reg <rel> pkt_end` holds
pub fn range_from_compare(reg: &RegState, rel: BranchCond) -> Option<u32> {
    if reg.off < 0 {
        return None;
    }
    let off = reg.off as u32;
    match rel {
        BranchCond::Le => Some(off),
        BranchCond::Lt => Some(off + 1),
        _ => None,
    }
}

/// Grant `range` to every packet pointer sharing `id`
pub fn mark_pkt_range(state: &mut VerifierState, id: u32, range: u32) {
    state.for_each_reg_mut(|r| {
        if r.reg_type == RegType::PtrToPacket && r.id == id && r.range < range {
            r.range = range;
        }
    });
}

/// Apply what `pkt <rel> pkt_end` proves, with `pkt` the packet operand
pub fn find_good_pkt_pointers(state: &mut VerifierState, pkt: &RegState, rel: BranchCond) {
    if let Some(range) = range_from_compare(pkt, rel) {
        mark_pkt_range(state, pkt.id, range);
    }
}

/// Whether two registers are a packet pointer and the packet end, in
/// either order. Returns the condition with the packet pointer on the left.
pub fn pkt_end_compare(dst: &RegState, src: &RegState, cond: BranchCond) -> Option<BranchCond> {
    match (dst.reg_type, src.reg_type) {
        (RegType::PtrToPacket, RegType::PtrToPacketEnd) => Some(cond),
        (RegType::PtrToPacketEnd, RegType::PtrToPacket) => Some(cond.swap()),
        _ => None,
    }
}
