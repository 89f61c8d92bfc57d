// SPDX-License-Identifier: GPL-2.0
//! Verifier acceptance and rejection across whole programs

use xdp_engine::prelude::*;

/// Build an ingress program from an assembler
fn ingress(a: &Asm) -> Program {
    Program::new("test", a.finish().unwrap(), AttachKind::Ingress)
}

/// Build an observe program from an assembler
fn observe(a: &Asm) -> Program {
    Program::new("observe", a.finish().unwrap(), AttachKind::Observe)
}

/// Verify against `maps` and return the rejection
fn rejected(p: &Program, maps: &MapSet) -> Rejection {
    match verify(p, maps) {
        Ok(_) => panic!("program {} unexpectedly verified", p.name()),
        Err(e) => e,
    }
}

/// r2 = data, r3 = data_end, proven `len` bytes readable or jump to `out`
fn load_packet(a: &mut Asm, len: i32, out: Label) {
    a.ldx(BPF_DW, 2, 1, CTX_OFF_DATA as i16)
        .ldx(BPF_DW, 3, 1, CTX_OFF_DATA_END as i16)
        .mov64_reg(4, 2)
        .add64_imm(4, len)
        .jgt_reg(4, 3, out);
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_empty_program_rejected() {
    let p = Program::new("empty", Vec::new(), AttachKind::Ingress);
    let e = rejected(&p, &MapSet::default());
    assert_eq!(e.reason, RejectionReason::MalformedProgram);
}

#[test]
fn test_too_many_insns() {
    let mut a = Asm::new();
    for _ in 0..20 {
        a.mov64_imm(1, 1);
    }
    a.ret(XDP_PASS);
    let v = Verifier::new(VerifierConfig::default().with_limits(ResourceLimits::default().with_max_insns(8)));
    let e = v.verify(&ingress(&a), &MapSet::default()).unwrap_err();
    assert_eq!(e.reason, RejectionReason::MalformedProgram);
}

#[test]
fn test_frame_pointer_is_read_only() {
    let mut a = Asm::new();
    a.mov64_imm(10, 0).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::MalformedProgram);
    assert_eq!(e.insn_idx, Some(0));
}

#[test]
fn test_falling_off_the_end() {
    let mut a = Asm::new();
    a.mov64_imm(0, XDP_PASS as i32);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::MalformedProgram);
}

// ============================================================================
// Registers and return values
// ============================================================================

#[test]
fn test_uninitialized_register() {
    let mut a = Asm::new();
    a.mov64_reg(0, 5).exit();
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::UninitializedRead);
    assert_eq!(e.insn_idx, Some(0));
}

#[test]
fn test_pointer_return_rejected() {
    let mut a = Asm::new();
    a.mov64_reg(0, 10).exit();
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::InvalidReturn);
    assert_eq!(e.insn_idx, Some(1));
}

#[test]
fn test_return_code_out_of_range() {
    let mut a = Asm::new();
    a.ret(7);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::InvalidReturn);
}

#[test]
fn test_every_ingress_verdict_accepted() {
    for code in [XDP_ABORTED, XDP_DROP, XDP_PASS, XDP_TX] {
        let mut a = Asm::new();
        a.ret(code);
        assert!(verify(&ingress(&a), &MapSet::default()).is_ok(), "code {}", code);
    }
}

#[test]
fn test_division_by_unknown_register_accepted() {
    let mut a = Asm::new();
    a.ldx(BPF_W, 2, 1, CTX_OFF_IFINDEX as i16)
        .mov64_imm(3, 100)
        .alu64_reg(BPF_DIV, 3, 2)
        .ret(XDP_PASS);
    assert!(verify(&ingress(&a), &MapSet::default()).is_ok());
}

// ============================================================================
// Context and packet access
// ============================================================================

#[test]
fn test_unchecked_packet_read() {
    let mut a = Asm::new();
    a.ldx(BPF_DW, 2, 1, CTX_OFF_DATA as i16)
        .ldx(BPF_B, 0, 2, 0)
        .exit();
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
    assert_eq!(e.insn_idx, Some(1));
}

#[test]
fn test_checked_packet_read() {
    let mut a = Asm::new();
    let out = a.label();
    load_packet(&mut a, 14, out);
    a.ldx(BPF_H, 5, 2, 12).bind(out).ret(XDP_PASS);
    assert!(verify(&ingress(&a), &MapSet::default()).is_ok());
}

#[test]
fn test_read_past_proven_range() {
    let mut a = Asm::new();
    let out = a.label();
    load_packet(&mut a, 14, out);
    a.ldx(BPF_H, 5, 2, 13).bind(out).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
    assert_eq!(e.insn_idx, Some(5));
}

#[test]
fn test_range_not_granted_on_taken_edge() {
    let mut a = Asm::new();
    let inside = a.label();
    load_packet(&mut a, 14, inside);
    a.ret(XDP_PASS).bind(inside).ldx(BPF_B, 5, 2, 0).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
}

#[test]
fn test_variable_offset_needs_new_check() {
    let build = |recheck: bool| {
        let mut a = Asm::new();
        let out = a.label();
        load_packet(&mut a, 34, out);
        a.ldx(BPF_B, 5, 2, 14)
            .and64_imm(5, 0x0f)
            .lsh64_imm(5, 2)
            .add64_reg(2, 5);
        if recheck {
            a.mov64_reg(6, 2).add64_imm(6, 4).jgt_reg(6, 3, out);
        }
        a.ldx(BPF_W, 7, 2, 0).bind(out).ret(XDP_PASS);
        ingress(&a)
    };
    assert!(verify(&build(true), &MapSet::default()).is_ok());
    let e = rejected(&build(false), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
}

#[test]
fn test_packet_end_arithmetic_rejected() {
    let mut a = Asm::new();
    a.ldx(BPF_DW, 3, 1, CTX_OFF_DATA_END as i16)
        .add64_imm(3, 1)
        .ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::TypeMismatch);
    assert_eq!(e.insn_idx, Some(1));
}

#[test]
fn test_ctx_fields() {
    let mut a = Asm::new();
    a.ldx(BPF_W, 2, 1, CTX_OFF_IFINDEX as i16)
        .ldx(BPF_W, 3, 1, CTX_OFF_RX_QUEUE as i16)
        .stx(BPF_DW, 1, 2, CTX_OFF_SCRATCH as i16)
        .ldx(BPF_DW, 4, 1, CTX_OFF_SCRATCH as i16)
        .ret(XDP_PASS);
    assert!(verify(&ingress(&a), &MapSet::default()).is_ok());

    let mut a = Asm::new();
    a.st(BPF_W, 1, CTX_OFF_IFINDEX as i16, 3).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::TypeMismatch);

    let mut a = Asm::new();
    a.ldx(BPF_W, 2, 1, CTX_OFF_DATA as i16).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::TypeMismatch);

    let mut a = Asm::new();
    a.ldx(BPF_DW, 2, 1, 64).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
}

#[test]
fn test_pointer_into_scratch_rejected() {
    let mut a = Asm::new();
    a.stx(BPF_DW, 1, 10, CTX_OFF_SCRATCH as i16).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::TypeMismatch);
}

// ============================================================================
// Stack
// ============================================================================

#[test]
fn test_stack_read_before_write() {
    let mut a = Asm::new();
    a.ldx(BPF_DW, 2, 10, -8).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::UninitializedRead);
    assert_eq!(e.insn_idx, Some(0));
}

#[test]
fn test_stack_out_of_frame() {
    let mut a = Asm::new();
    a.st(BPF_DW, 10, 0, 1).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);

    let mut a = Asm::new();
    a.st(BPF_DW, 10, -(MAX_STACK as i16) - 8, 1).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
}

#[test]
fn test_spilled_pointer_survives_fill() {
    let mut a = Asm::new();
    let out = a.label();
    a.ldx(BPF_DW, 2, 1, CTX_OFF_DATA as i16)
        .stx(BPF_DW, 10, 2, -8)
        .ldx(BPF_DW, 3, 1, CTX_OFF_DATA_END as i16)
        .ldx(BPF_DW, 2, 10, -8)
        .mov64_reg(4, 2)
        .add64_imm(4, 1)
        .jgt_reg(4, 3, out)
        .ldx(BPF_B, 5, 2, 0)
        .bind(out)
        .ret(XDP_PASS);
    assert!(verify(&ingress(&a), &MapSet::default()).is_ok());
}

// ============================================================================
// Helpers and maps
// ============================================================================

#[test]
fn test_unknown_helper() {
    let mut a = Asm::new();
    a.call_id(99).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::DisallowedCall);
    assert_eq!(e.insn_idx, Some(0));
}

#[test]
fn test_helper_clobbers_arguments() {
    let mut a = Asm::new();
    a.mov64_imm(3, 1)
        .call(Helper::KtimeGetNs)
        .mov64_reg(0, 3)
        .exit();
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::UninitializedRead);
    assert_eq!(e.insn_idx, Some(2));
}

#[test]
fn test_undeclared_map_index() {
    let mut a = Asm::new();
    a.ld_map(1, 3).ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::MapSchemaMismatch);
    assert_eq!(e.insn_idx, Some(0));
}

#[test]
fn test_map_value_access_bounds() {
    let maps = MapSet::default();
    let schema = MapSchema::array(8, 4);
    maps.create("values", schema).unwrap();
    let build = |off: i16| {
        let mut a = Asm::new();
        let out = a.label();
        a.st(BPF_W, 10, -4, 0)
            .ld_map(1, 0)
            .mov64_reg(2, 10)
            .add64_imm(2, -4)
            .call(Helper::MapLookupElem)
            .jeq_imm(0, 0, out)
            .ldx(BPF_DW, 3, 0, off)
            .bind(out)
            .ret(XDP_PASS);
        ingress(&a).with_map(MapBinding::from_schema("values", &schema))
    };
    assert!(verify(&build(0), &maps).is_ok());
    let e = rejected(&build(4), &maps);
    assert_eq!(e.reason, RejectionReason::OutOfBoundsAccess);
}

#[test]
fn test_map_key_must_be_initialized() {
    let maps = MapSet::default();
    let schema = MapSchema::hash(8, 8, 16);
    maps.create("h", schema).unwrap();
    let mut a = Asm::new();
    a.st(BPF_W, 10, -8, 0)
        .ld_map(1, 0)
        .mov64_reg(2, 10)
        .add64_imm(2, -8)
        .call(Helper::MapLookupElem)
        .ret(XDP_PASS);
    let p = ingress(&a).with_map(MapBinding::from_schema("h", &schema));
    let e = rejected(&p, &maps);
    assert_eq!(e.reason, RejectionReason::UninitializedRead);
}

#[test]
fn test_delete_on_array_rejected() {
    let maps = MapSet::default();
    let schema = MapSchema::array(8, 4);
    maps.create("values", schema).unwrap();
    let mut a = Asm::new();
    a.st(BPF_W, 10, -4, 0)
        .ld_map(1, 0)
        .mov64_reg(2, 10)
        .add64_imm(2, -4)
        .call(Helper::MapDeleteElem)
        .ret(XDP_PASS);
    let p = ingress(&a).with_map(MapBinding::from_schema("values", &schema));
    let e = rejected(&p, &maps);
    assert_eq!(e.reason, RejectionReason::TypeMismatch);
}

#[test]
fn test_hash_bytes_length() {
    let build = |len: i32| {
        let mut a = Asm::new();
        a.st(BPF_DW, 10, -16, 0)
            .mov64_reg(1, 10)
            .add64_imm(1, -16)
            .mov64_imm(2, len)
            .call(Helper::HashBytes)
            .ret(XDP_PASS);
        ingress(&a)
    };
    assert!(verify(&build(8), &MapSet::default()).is_ok());
    assert_eq!(rejected(&build(0), &MapSet::default()).reason, RejectionReason::TypeMismatch);
    // Only eight bytes of stack were written
    assert_eq!(
        rejected(&build(16), &MapSet::default()).reason,
        RejectionReason::UninitializedRead
    );
}

#[test]
fn test_ringbuf_record_must_be_released() {
    let maps = MapSet::default();
    let schema = MapSchema::ringbuf(16, 8);
    maps.create("events", schema).unwrap();
    let build = |submit: bool| {
        let mut a = Asm::new();
        let out = a.label();
        a.ld_map(1, 0)
            .mov64_imm(2, 16)
            .mov64_imm(3, 0)
            .call(Helper::RingbufReserve)
            .jeq_imm(0, 0, out)
            .st(BPF_DW, 0, 0, 1);
        if submit {
            a.mov64_reg(1, 0).mov64_imm(2, 0).call(Helper::RingbufSubmit);
        }
        a.ret(XDP_PASS).bind(out).ret(XDP_PASS);
        ingress(&a).with_map(MapBinding::from_schema("events", &schema))
    };
    assert!(verify(&build(true), &maps).is_ok());
    let e = rejected(&build(false), &maps);
    assert_eq!(e.reason, RejectionReason::UnreleasedReference);
    assert_eq!(e.insn_idx, Some(8));
}

// ============================================================================
// Observe attach point
// ============================================================================

#[test]
fn test_observe_cannot_write_packet() {
    let mut a = Asm::new();
    let out = a.label();
    load_packet(&mut a, 1, out);
    a.st(BPF_B, 2, 0, 0).bind(out).ret(XDP_PASS);
    assert!(verify(&ingress(&a), &MapSet::default()).is_ok());

    let e = rejected(&observe(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::TypeMismatch);
    assert_eq!(e.insn_idx, Some(5));
}

#[test]
fn test_observe_cannot_redirect() {
    let mut a = Asm::new();
    a.mov64_imm(1, 1)
        .mov64_imm(2, 0)
        .call(Helper::Redirect)
        .ret(XDP_PASS);
    let e = rejected(&observe(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::DisallowedCall);
    assert_eq!(e.insn_idx, Some(2));
}

#[test]
fn test_observe_verdicts() {
    let mut a = Asm::new();
    a.ret(XDP_DROP);
    assert!(verify(&observe(&a), &MapSet::default()).is_ok());

    let mut a = Asm::new();
    a.ret(XDP_TX);
    let e = rejected(&observe(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::InvalidReturn);
}

// ============================================================================
// Loops and limits
// ============================================================================

#[test]
fn test_loop_without_induction_rejected() {
    let mut a = Asm::new();
    let top = a.label();
    a.mov64_imm(1, 1)
        .bind(top)
        .alu64_imm(BPF_MUL, 1, 2)
        .jlt_imm(1, 100, top)
        .ret(XDP_PASS);
    let e = rejected(&ingress(&a), &MapSet::default());
    assert_eq!(e.reason, RejectionReason::UnboundedLoop);
    assert_eq!(e.insn_idx, Some(2));
}

#[test]
fn test_counting_down_loop() {
    let mut a = Asm::new();
    let top = a.label();
    a.mov64_imm(1, 16)
        .bind(top)
        .sub64_imm(1, 1)
        .jgt_imm(1, 0, top)
        .ret(XDP_PASS);
    let v = verify(&ingress(&a), &MapSet::default()).unwrap();
    assert_eq!(v.stats().loops, 1);
}

#[test]
fn test_complexity_limit() {
    let mut a = Asm::new();
    let top = a.label();
    a.mov64_imm(1, 0)
        .bind(top)
        .add64_imm(1, 1)
        .jlt_imm(1, 1000, top)
        .ret(XDP_PASS);
    let p = ingress(&a);
    assert!(verify(&p, &MapSet::default()).is_ok());

    let v = Verifier::new(
        VerifierConfig::default().with_limits(ResourceLimits::default().with_max_complexity(100)),
    );
    let e = v.verify(&p, &MapSet::default()).unwrap_err();
    assert_eq!(e.reason, RejectionReason::ComplexityExceeded);
}

// ============================================================================
// Log, statistics and disassembly
// ============================================================================

#[test]
fn test_log_and_stats() {
    let mut a = Asm::new();
    let out = a.label();
    load_packet(&mut a, 14, out);
    a.ldx(BPF_H, 5, 2, 12).bind(out).ret(XDP_PASS);
    let v = Verifier::new(VerifierConfig::default().with_log_level(LogLevel::Trace))
        .verify(&ingress(&a), &MapSet::default())
        .unwrap();
    assert!(v.log().contains("verification succeeded"));
    let stats = v.stats();
    assert_eq!(stats.insn_count, 8);
    assert!(stats.insns_processed >= 8);
    assert!(stats.branches >= 1);

    let quiet = verify(&ingress(&a), &MapSet::default()).unwrap();
    assert!(quiet.log().is_empty());
}

#[test]
fn test_disassembly() {
    let mut a = Asm::new();
    let out = a.label();
    a.st(BPF_W, 10, -4, 0)
        .ld_map(1, 0)
        .mov64_reg(2, 10)
        .add64_imm(2, -4)
        .call(Helper::MapLookupElem)
        .jeq_imm(0, 0, out)
        .bind(out)
        .ret(XDP_PASS);
    let text = ingress(&a).disasm();
    assert!(text.contains("call map_lookup_elem#1"));
    assert!(text.trim_end().ends_with("exit"));
}
