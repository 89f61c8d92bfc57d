// SPDX-License-Identifier: GPL-2.0
//! Property tests: verified programs cannot fault, and runs are deterministic

use std::net::Ipv4Addr;
use std::sync::Arc;

use proptest::prelude::*;
use xdp_engine::apps::{Backend, DdosConfig, DdosFilter, LbConfig, LoadBalancer, PacketBuilder};
use xdp_engine::prelude::*;

const ALU_OPS: [u8; 11] = [
    BPF_ADD, BPF_SUB, BPF_MUL, BPF_DIV, BPF_MOD, BPF_AND, BPF_OR, BPF_XOR, BPF_LSH, BPF_RSH,
    BPF_ARSH,
];

#[derive(Debug, Clone)]
enum Step {
    Imm { op: u8, dst: u8, imm: i32, wide: bool },
    Reg { op: u8, dst: u8, src: u8, wide: bool },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..ALU_OPS.len(), 0u8..6, any::<i32>(), any::<bool>())
            .prop_map(|(op, dst, imm, wide)| Step::Imm { op: ALU_OPS[op], dst, imm, wide }),
        (0..ALU_OPS.len(), 0u8..6, 0u8..6, any::<bool>())
            .prop_map(|(op, dst, src, wide)| Step::Reg { op: ALU_OPS[op], dst, src, wide }),
    ]
}

/// Straight-line arithmetic over r0-r5, folded into a DROP/PASS verdict
fn arithmetic(seeds: &[i32], steps: &[Step]) -> Program {
    let mut a = Asm::new();
    for (reg, seed) in seeds.iter().enumerate() {
        a.mov64_imm(reg as u8, *seed);
    }
    for s in steps {
        match *s {
            Step::Imm { op, dst, imm, wide: true } => a.alu64_imm(op, dst, imm),
            Step::Imm { op, dst, imm, wide: false } => a.alu32_imm(op, dst, imm),
            Step::Reg { op, dst, src, wide: true } => a.alu64_reg(op, dst, src),
            Step::Reg { op, dst, src, wide: false } => a.alu32_reg(op, dst, src),
        };
    }
    a.and64_imm(0, 1).add64_imm(0, XDP_DROP as i32).exit();
    Program::new("arith", a.finish().unwrap(), AttachKind::Ingress)
}

/// Reads the byte at `off` once the packet is long enough: odd bytes pass,
/// even bytes drop, short packets pass
fn byte_reader(off: i16) -> Arc<VerifiedProgram> {
    let mut a = Asm::new();
    let short = a.label();
    a.ldx(BPF_DW, 2, 1, CTX_OFF_DATA as i16)
        .ldx(BPF_DW, 3, 1, CTX_OFF_DATA_END as i16)
        .mov64_reg(4, 2)
        .add64_imm(4, i32::from(off) + 1)
        .jgt_reg(4, 3, short)
        .ldx(BPF_B, 0, 2, off)
        .and64_imm(0, 1)
        .add64_imm(0, XDP_DROP as i32)
        .exit()
        .bind(short)
        .ret(XDP_PASS);
    let p = Program::new("byte-read", a.finish().unwrap(), AttachKind::Ingress);
    Arc::new(verify(&p, &MapSet::default()).unwrap())
}

fn ddos() -> (DdosFilter, Arc<VerifiedProgram>) {
    let maps = MapSet::new(1);
    let f = DdosFilter::new(&maps, DdosConfig::default().with_threshold(3)).unwrap();
    f.block(Ipv4Addr::new(192, 0, 2, 66)).unwrap();
    let prog = f.load(&maps).unwrap();
    (f, prog)
}

fn balancer() -> (LoadBalancer, Arc<VerifiedProgram>) {
    let maps = MapSet::new(1);
    let lb = LoadBalancer::new(&maps, LbConfig::default()).unwrap();
    for i in 1..=3 {
        lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, i), 8080)).unwrap();
    }
    let prog = lb.load(&maps).unwrap();
    (lb, prog)
}

/// Random frames, plus well-formed IPv4 frames with random fields and tails
fn frame() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..96),
        (any::<[u8; 4]>(), any::<u16>(), any::<bool>(), 0usize..80).prop_map(
            |(src, port, tcp, cut)| {
                let b = PacketBuilder::new().src(Ipv4Addr::from(src), port);
                let mut pkt = if tcp { b.tcp().build() } else { b.udp().build() };
                let keep = pkt.len().saturating_sub(cut);
                pkt.truncate(keep);
                pkt
            }
        ),
    ]
}

proptest! {
    #[test]
    fn prop_verified_arithmetic_never_faults(
        seeds in prop::collection::vec(any::<i32>(), 6),
        steps in prop::collection::vec(step(), 0..24),
    ) {
        let p = arithmetic(&seeds, &steps);
        if let Ok(v) = verify(&p, &MapSet::default()) {
            let mut pkt = vec![0u8; 16];
            let mut ctx = PacketContext::new(&mut pkt, RxMeta::default());
            let verdict = Engine::default().try_run(&v, &mut ctx);
            prop_assert!(matches!(verdict, Ok(Verdict::Drop | Verdict::Forward)), "{:?}", verdict);
        }
    }

    #[test]
    fn prop_checked_reads_stay_in_bounds(
        off in 0i16..64,
        pkt in prop::collection::vec(any::<u8>(), 0..80),
    ) {
        let prog = byte_reader(off);
        let mut buf = pkt.clone();
        let mut ctx = PacketContext::new(&mut buf, RxMeta::default());
        let verdict = Engine::default().try_run(&prog, &mut ctx).unwrap();
        let expected = match pkt.get(off as usize) {
            Some(b) if b & 1 == 0 => Verdict::Drop,
            _ => Verdict::Forward,
        };
        prop_assert_eq!(verdict, expected);
        prop_assert_eq!(buf, pkt);
    }

    #[test]
    fn prop_ddos_filter_never_faults(pkts in prop::collection::vec(frame(), 1..12)) {
        let (_f, prog) = ddos();
        let engine = Engine::default();
        for mut pkt in pkts {
            let mut ctx = PacketContext::new(&mut pkt, RxMeta::default());
            let verdict = engine.try_run(&prog, &mut ctx);
            prop_assert!(matches!(verdict, Ok(Verdict::Drop | Verdict::Forward)), "{:?}", verdict);
        }
    }

    #[test]
    fn prop_balancer_never_faults(pkts in prop::collection::vec(frame(), 1..12)) {
        let (_lb, prog) = balancer();
        let engine = Engine::default();
        for mut pkt in pkts {
            let mut ctx = PacketContext::new(&mut pkt, RxMeta::default());
            let verdict = engine.try_run(&prog, &mut ctx);
            prop_assert!(
                matches!(verdict, Ok(Verdict::Forward | Verdict::Redirect(0..=2))),
                "{:?}",
                verdict
            );
        }
    }

    #[test]
    fn prop_runs_are_deterministic(pkts in prop::collection::vec(frame(), 1..12)) {
        // Two fresh instances fed the same sequence agree packet by packet
        let (first, second) = (balancer(), balancer());
        let engine = Engine::new(EngineConfig::default());
        for pkt in pkts {
            let (mut a, mut b) = (pkt.clone(), pkt);
            let va = engine.run(&first.1, &mut PacketContext::new(&mut a, RxMeta::default()));
            let vb = engine.run(&second.1, &mut PacketContext::new(&mut b, RxMeta::default()));
            prop_assert_eq!(va, vb);
            prop_assert_eq!(a, b);
        }
        prop_assert_eq!(first.0.connections(), second.0.connections());
    }
}
