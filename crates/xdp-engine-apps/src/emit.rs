// SPDX-License-Identifier: GPL-2.0

//! Bytecode snippets shared by the application programs
//!
//! Register use after [`parse_ipv4`]:
//!
//! - r6: packet start, 34 bytes proven readable
//! - r7: packet end
//! - r8: IPv4 header length, proven in `[20, 60]`
//!
//! The flow key under construction lives at `fp-16`.

use xdp_engine_core::core::types::*;
use xdp_engine_core::program::{Asm, Label};

use crate::flow::{
    ETH_HLEN, ETH_P_IP, IPPROTO_TCP, IPPROTO_UDP, IPV4_HLEN_MIN, OFF_ETH_PROTO, OFF_IP_DST,
    OFF_IP_PROTO, OFF_IP_SRC, OFF_IP_VER_IHL,
};

/// Flow key, 16 bytes
pub(crate) const FP_KEY: i16 = -16;
/// Source port inside the key
const FP_KEY_SPORT: i16 = FP_KEY + 8;
/// Destination port inside the key
const FP_KEY_DPORT: i16 = FP_KEY + 10;
/// Protocol inside the key
const FP_KEY_PROTO: i16 = FP_KEY + 12;
/// Eight bytes of scratch for map values
pub(crate) const FP_VALUE: i16 = -24;
/// Four-byte array index
pub(crate) const FP_INDEX: i16 = -32;

pub(crate) const R0: u8 = 0;
pub(crate) const R1: u8 = 1;
pub(crate) const R2: u8 = 2;
pub(crate) const R3: u8 = 3;
pub(crate) const R4: u8 = 4;
pub(crate) const R6: u8 = 6;
pub(crate) const R7: u8 = 7;
pub(crate) const R8: u8 = 8;
pub(crate) const R9: u8 = 9;
pub(crate) const FP: u8 = REG_FP as u8;

/// `dst = fp + off`
pub(crate) fn stack_ptr(a: &mut Asm, dst: u8, off: i16) {
    a.mov64_reg(dst, FP).add64_imm(dst, i32::from(off));
}

/// Load packet bounds, check for an IPv4 header and copy addresses and
/// protocol into the flow key. Anything else jumps to `other`.
pub(crate) fn parse_ipv4(a: &mut Asm, other: Label) {
    let hdr_end = ETH_HLEN + IPV4_HLEN_MIN;
    a.ldx(BPF_DW, R6, 1, CTX_OFF_DATA as i16)
        .ldx(BPF_DW, R7, 1, CTX_OFF_DATA_END as i16)
        .st(BPF_DW, FP, FP_KEY, 0)
        .st(BPF_DW, FP, FP_KEY + 8, 0)
        .mov64_reg(R2, R6)
        .add64_imm(R2, hdr_end as i32)
        .jgt_reg(R2, R7, other)
        // EtherType as loaded from wire order
        .ldx(BPF_H, R3, R6, OFF_ETH_PROTO)
        .jne_imm(R3, i32::from(ETH_P_IP.swap_bytes()), other)
        .ldx(BPF_B, R3, R6, OFF_IP_VER_IHL)
        .mov64_reg(R4, R3)
        .rsh64_imm(R4, 4)
        .jne_imm(R4, 4, other)
        .and64_imm(R3, 0x0f)
        .lsh64_imm(R3, 2)
        .jlt_imm(R3, IPV4_HLEN_MIN as i32, other)
        .mov64_reg(R8, R3)
        .ldx(BPF_W, R3, R6, OFF_IP_SRC)
        .stx(BPF_W, FP, R3, FP_KEY)
        .ldx(BPF_W, R3, R6, OFF_IP_DST)
        .stx(BPF_W, FP, R3, FP_KEY + 4)
        .ldx(BPF_B, R3, R6, OFF_IP_PROTO)
        .stx(BPF_B, FP, R3, FP_KEY_PROTO);
}

/// Point `l4` at the TCP or UDP header and copy the ports into the flow
/// key. Other protocols jump to `portless`; a header cut short jumps to
/// `truncated`.
pub(crate) fn parse_ports(a: &mut Asm, l4: u8, portless: Label, truncated: Label) {
    let has_ports = a.label();
    a.ldx(BPF_B, R3, R6, OFF_IP_PROTO)
        .jeq_imm(R3, i32::from(IPPROTO_TCP), has_ports)
        .jne_imm(R3, i32::from(IPPROTO_UDP), portless)
        .bind(has_ports)
        .mov64_reg(l4, R6)
        .add64_reg(l4, R8)
        .add64_imm(l4, ETH_HLEN as i32)
        .mov64_reg(R3, l4)
        .add64_imm(R3, 4)
        .jgt_reg(R3, R7, truncated)
        .ldx(BPF_H, R4, l4, 0)
        .stx(BPF_H, FP, R4, FP_KEY_SPORT)
        .ldx(BPF_H, R4, l4, 2)
        .stx(BPF_H, FP, R4, FP_KEY_DPORT);
}

/// Look up entry `idx` of the array-like map `map` into r0, jumping to
/// `missing` when the lookup fails
pub(crate) fn lookup_index(a: &mut Asm, map: u32, idx: i32, missing: Label) {
    a.st(BPF_W, FP, FP_INDEX, idx).ld_map(R1, map);
    stack_ptr(a, R2, FP_INDEX);
    a.call(Helper::MapLookupElem).jeq_imm(R0, 0, missing);
}

/// Add one to the u64 at `idx` of the array-like map `map`
pub(crate) fn bump_counter(a: &mut Asm, map: u32, idx: i32) {
    let done = a.label();
    lookup_index(a, map, idx, done);
    a.mov64_imm(R1, 1).atomic_add(BPF_DW, R0, R1, 0).bind(done);
}
