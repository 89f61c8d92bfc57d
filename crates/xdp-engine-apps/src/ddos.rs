// SPDX-License-Identifier: GPL-2.0

//! DDoS mitigation filter
//!
//! Drops traffic from blocklisted sources and rate limits individual flows.
//! Per packet:
//!
//! 1. non-IPv4 or truncated frames are forwarded untracked;
//! 2. a source address found in `ddos_blocklist` is dropped, its hit count
//!    bumped and a drop event queued;
//! 3. the flow's packet count in `ddos_flows` is incremented (inserted at 1
//!    when new, or incremented if another worker inserted it first). Above
//!    the threshold in `ddos_config[0]` the packet is dropped and an event
//!    queued, otherwise forwarded. A zero threshold disables rate limiting.
//!    When the flow cannot be inserted the packet is forwarded untracked.
//!
//! Counts accumulate until the control plane calls
//! [`DdosFilter::reset_window`]; the caller picks the window length.

use std::net::Ipv4Addr;
use std::sync::Arc;

use xdp_engine_core::core::error::MapError;
use xdp_engine_core::core::types::*;
use xdp_engine_core::maps::{
    Array, HashMap, LruHashMap, MapSchema, MapSet, PerWorkerArray, Pod, RingBuffer, UpdateMode,
};
use xdp_engine_core::program::{Asm, AttachKind, Label, MapBinding, Program, VerifiedProgram};
use xdp_engine_core::verifier::verify;

use crate::emit::*;
use crate::error::Result;
use crate::flow::FlowKey;

/// Blocked source addresses and their drop counts
pub const BLOCKLIST_MAP: &str = "ddos_blocklist";
/// Per-flow packet counts
pub const FLOWS_MAP: &str = "ddos_flows";
/// Per-worker counters
pub const STATS_MAP: &str = "ddos_stats";
/// Tunables
pub const CONFIG_MAP: &str = "ddos_config";
/// Drop events
pub const EVENTS_MAP: &str = "ddos_events";

const MAP_BLOCKLIST: u32 = 0;
const MAP_FLOWS: u32 = 1;
const MAP_STATS: u32 = 2;
const MAP_CONFIG: u32 = 3;
const MAP_EVENTS: u32 = 4;

const STAT_PASSED: u32 = 0;
const STAT_BLOCKED: u32 = 1;
const STAT_RATE_LIMITED: u32 = 2;
const STAT_UNTRACKED: u32 = 3;
const STAT_COUNT: u32 = 4;

const CONFIG_THRESHOLD: u32 = 0;

/// Drop event record, 24 bytes
const FP_EVENT: i16 = -56;
const EVENT_SIZE: usize = 24;

/// Filter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdosConfig {
    /// Packets a flow may send per window; zero disables rate limiting
    pub threshold: u64,
    /// Capacity of the flow table
    pub max_flows: u32,
    /// Capacity of the blocklist
    pub max_blocked: u32,
    /// Drop events buffered before new ones are lost
    pub event_slots: u32,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            max_flows: 65_536,
            max_blocked: 16_384,
            event_slots: 1024,
        }
    }
}

impl DdosConfig {
    /// Set the per-window threshold
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the flow table capacity
    pub fn with_max_flows(mut self, max_flows: u32) -> Self {
        self.max_flows = max_flows;
        self
    }
}

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DropReason {
    /// Source address is blocklisted
    Blocked = 1,
    /// Flow exceeded the threshold
    RateLimited = 2,
}

impl DropReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(DropReason::Blocked),
            2 => Some(DropReason::RateLimited),
            _ => None,
        }
    }
}

/// A dropped packet as reported through `ddos_events`
///
/// For blocklist drops the ports are zero: the source is dropped before the
/// transport header is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropEvent {
    /// Flow of the dropped packet
    pub flow: FlowKey,
    /// Why it was dropped
    pub reason: DropReason,
    /// Engine clock at the drop
    pub timestamp_ns: u64,
}

impl DropEvent {
    /// Decode a ring buffer record
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < EVENT_SIZE {
            return None;
        }
        let mut key = [0u8; FlowKey::SIZE];
        key[..13].copy_from_slice(&b[..13]);
        Some(Self {
            flow: FlowKey::from_bytes(&key)?,
            reason: DropReason::from_u8(b[13])?,
            timestamp_ns: u64::from_le_bytes(b[16..24].try_into().ok()?),
        })
    }
}

/// Aggregated counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DdosStats {
    /// Forwarded after flow accounting
    pub passed: u64,
    /// Dropped by the blocklist
    pub blocked: u64,
    /// Dropped by the rate limit
    pub rate_limited: u64,
    /// Forwarded without flow accounting
    pub untracked: u64,
}

/// The filter's maps and control plane
#[derive(Debug, Clone)]
pub struct DdosFilter {
    blocklist: HashMap<[u8; 4], u64>,
    flows: LruHashMap<FlowKey, u64>,
    stats: PerWorkerArray<u64>,
    config: Array<u64>,
    events: RingBuffer,
    bindings: Vec<MapBinding>,
}

impl DdosFilter {
    /// Create the filter's maps in `maps` and store the configuration
    pub fn new(maps: &MapSet, config: DdosConfig) -> Result<Self> {
        let schemas = [
            (BLOCKLIST_MAP, MapSchema::hash(4, 8, config.max_blocked)),
            (FLOWS_MAP, MapSchema::lru_hash(FlowKey::SIZE as u32, 8, config.max_flows)),
            (STATS_MAP, MapSchema::per_worker_array(8, STAT_COUNT)),
            (CONFIG_MAP, MapSchema::array(8, 1)),
            (EVENTS_MAP, MapSchema::ringbuf(EVENT_SIZE as u32, config.event_slots)),
        ];
        let mut created = Vec::with_capacity(schemas.len());
        for (name, schema) in schemas {
            created.push(maps.create(name, schema)?);
        }
        let bindings = schemas
            .iter()
            .map(|(name, schema)| MapBinding::from_schema(*name, schema))
            .collect();
        let map = |idx: u32| Arc::clone(&created[idx as usize]);

        let filter = Self {
            blocklist: HashMap::new(map(MAP_BLOCKLIST))?,
            flows: LruHashMap::new(map(MAP_FLOWS))?,
            stats: PerWorkerArray::new(map(MAP_STATS))?,
            config: Array::new(map(MAP_CONFIG))?,
            events: RingBuffer::new(map(MAP_EVENTS))?,
            bindings,
        };
        filter.set_threshold(config.threshold)?;
        tracing::debug!(threshold = config.threshold, max_flows = config.max_flows, "ddos filter ready");
        Ok(filter)
    }

    /// Drop all traffic from `addr`
    pub fn block(&self, addr: Ipv4Addr) -> Result<()> {
        match self.blocklist.insert(&addr.octets(), &0, UpdateMode::CreateOnly) {
            Ok(()) | Err(MapError::Exists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop dropping traffic from `addr`. Returns whether it was blocked.
    pub fn unblock(&self, addr: Ipv4Addr) -> Result<bool> {
        Ok(self.blocklist.remove(&addr.octets())?.is_some())
    }

    /// Whether `addr` is blocklisted
    pub fn is_blocked(&self, addr: Ipv4Addr) -> Result<bool> {
        Ok(self.blocklist.get(&addr.octets())?.is_some())
    }

    /// Packets dropped for `addr` since it was blocked
    pub fn block_hits(&self, addr: Ipv4Addr) -> Result<Option<u64>> {
        Ok(self.blocklist.get(&addr.octets())?)
    }

    /// Blocklisted addresses
    pub fn blocked(&self) -> Vec<Ipv4Addr> {
        self.blocklist.keys().into_iter().map(Ipv4Addr::from).collect()
    }

    /// Change the per-window threshold; takes effect on the next packet
    pub fn set_threshold(&self, threshold: u64) -> Result<()> {
        self.config.set(CONFIG_THRESHOLD, &threshold)?;
        Ok(())
    }

    /// Current per-window threshold
    pub fn threshold(&self) -> Result<u64> {
        Ok(self.config.get(CONFIG_THRESHOLD)?.unwrap_or(0))
    }

    /// Packets counted for `flow` in the current window
    pub fn flow_count(&self, flow: &FlowKey) -> Result<Option<u64>> {
        Ok(self.flows.get(flow)?)
    }

    /// Number of flows tracked
    pub fn flows_tracked(&self) -> usize {
        self.flows.len()
    }

    /// Start a new rate-limit window by forgetting every flow. Returns the
    /// number of flows removed.
    pub fn reset_window(&self) -> usize {
        let mut removed = 0;
        for flow in self.flows.keys() {
            // A flow evicted concurrently is already gone
            if let Ok(Some(_)) = self.flows.remove(&flow) {
                removed += 1;
            }
        }
        tracing::debug!(removed, "rate limit window reset");
        removed
    }

    /// Counters summed over all workers
    pub fn stats(&self) -> DdosStats {
        DdosStats {
            passed: self.stats.sum(STAT_PASSED),
            blocked: self.stats.sum(STAT_BLOCKED),
            rate_limited: self.stats.sum(STAT_RATE_LIMITED),
            untracked: self.stats.sum(STAT_UNTRACKED),
        }
    }

    /// Take every queued drop event
    pub fn drain_events(&self) -> Vec<DropEvent> {
        let mut out = Vec::new();
        self.events.drain(|rec| out.extend(DropEvent::from_bytes(rec)));
        out
    }

    /// Events lost because the ring was full
    pub fn events_lost(&self) -> u64 {
        self.events.dropped()
    }

    /// The packet program
    pub fn program(&self) -> Result<Program> {
        let insns = build_program()?;
        Ok(Program::new("ddos_filter", insns, AttachKind::Ingress).with_maps(self.bindings.clone()))
    }

    /// Build and verify the packet program against `maps`
    pub fn load(&self, maps: &MapSet) -> Result<Arc<VerifiedProgram>> {
        Ok(Arc::new(verify(&self.program()?, maps)?))
    }
}

/// Copy the flow key into the event record, stamp it and queue it
fn emit_event(a: &mut Asm, reason: DropReason) {
    a.ldx(BPF_DW, R1, FP, FP_KEY)
        .stx(BPF_DW, FP, R1, FP_EVENT)
        .ldx(BPF_W, R1, FP, FP_KEY + 8)
        .stx(BPF_W, FP, R1, FP_EVENT + 8)
        .ldx(BPF_B, R1, FP, FP_KEY + 12)
        .stx(BPF_B, FP, R1, FP_EVENT + 12)
        .st(BPF_B, FP, FP_EVENT + 13, reason as i32)
        .st(BPF_H, FP, FP_EVENT + 14, 0)
        .call(Helper::KtimeGetNs)
        .stx(BPF_DW, FP, R0, FP_EVENT + 16)
        .ld_map(R1, MAP_EVENTS);
    stack_ptr(a, R2, FP_EVENT);
    a.mov64_imm(R3, EVENT_SIZE as i32)
        .mov64_imm(R4, 0)
        .call(Helper::RingbufOutput);
}

/// Bump the flow count r0 points at and compare it with the threshold in r9
fn count_flow(a: &mut Asm, pass: Label, limited: Label) {
    a.mov64_imm(R1, 1)
        .atomic(BPF_DW, i32::from(BPF_ADD) | BPF_FETCH, R0, R1, 0)
        .add64_imm(R1, 1)
        .jeq_imm(R9, 0, pass)
        .jgt_reg(R1, R9, limited)
        .ja(pass);
}

fn build_program() -> Result<Vec<Insn>> {
    let mut a = Asm::new();
    let untracked = a.label();
    let not_blocked = a.label();
    let flow = a.label();
    let new_flow = a.label();
    let pass = a.label();
    let limited = a.label();

    parse_ipv4(&mut a, untracked);

    // Blocklist, keyed by the source address at the start of the flow key
    a.ld_map(R1, MAP_BLOCKLIST);
    stack_ptr(&mut a, R2, FP_KEY);
    a.call(Helper::MapLookupElem)
        .jeq_imm(R0, 0, not_blocked)
        .mov64_imm(R1, 1)
        .atomic_add(BPF_DW, R0, R1, 0);
    bump_counter(&mut a, MAP_STATS, STAT_BLOCKED as i32);
    emit_event(&mut a, DropReason::Blocked);
    a.ret(XDP_DROP);

    a.bind(not_blocked);
    parse_ports(&mut a, R2, flow, untracked);
    a.bind(flow);

    // r9 = threshold, zero when unset
    let have_threshold = a.label();
    a.mov64_imm(R9, 0);
    lookup_index(&mut a, MAP_CONFIG, CONFIG_THRESHOLD as i32, have_threshold);
    a.ldx(BPF_DW, R9, R0, 0).bind(have_threshold);

    a.ld_map(R1, MAP_FLOWS);
    stack_ptr(&mut a, R2, FP_KEY);
    a.call(Helper::MapLookupElem).jeq_imm(R0, 0, new_flow);
    count_flow(&mut a, pass, limited);

    a.bind(new_flow).st(BPF_DW, FP, FP_VALUE, 1).ld_map(R1, MAP_FLOWS);
    stack_ptr(&mut a, R2, FP_KEY);
    stack_ptr(&mut a, R3, FP_VALUE);
    a.mov64_imm(R4, BPF_NOEXIST as i32)
        .call(Helper::MapUpdateElem)
        .jeq_imm(R0, 0, pass)
        .jne_imm(R0, MapError::Exists.errno() as i32, untracked);

    // Another worker inserted the flow since the lookup
    a.ld_map(R1, MAP_FLOWS);
    stack_ptr(&mut a, R2, FP_KEY);
    a.call(Helper::MapLookupElem).jeq_imm(R0, 0, untracked);
    count_flow(&mut a, pass, limited);

    a.bind(pass);
    bump_counter(&mut a, MAP_STATS, STAT_PASSED as i32);
    a.ret(XDP_PASS);

    a.bind(limited);
    bump_counter(&mut a, MAP_STATS, STAT_RATE_LIMITED as i32);
    emit_event(&mut a, DropReason::RateLimited);
    a.ret(XDP_DROP);

    a.bind(untracked);
    bump_counter(&mut a, MAP_STATS, STAT_UNTRACKED as i32);
    a.ret(XDP_PASS);

    Ok(a.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBuilder;
    use xdp_engine_core::exec::{Engine, PacketContext, RxMeta, Verdict};

    fn setup(threshold: u64) -> (MapSet, DdosFilter, Arc<VerifiedProgram>) {
        let maps = MapSet::new(2);
        let f = DdosFilter::new(&maps, DdosConfig::default().with_threshold(threshold)).unwrap();
        let prog = f.load(&maps).unwrap();
        (maps, f, prog)
    }

    fn run(prog: &VerifiedProgram, pkt: &mut [u8]) -> Verdict {
        let mut ctx = PacketContext::new(pkt, RxMeta::default());
        Engine::default().try_run(prog, &mut ctx).unwrap()
    }

    #[test]
    fn test_program_verifies() {
        let (_maps, _f, prog) = setup(100);
        assert_eq!(prog.maps().len(), 5);
        assert!(prog.stats().insns_processed > 0);
    }

    #[test]
    fn test_duplicate_maps_rejected() {
        let maps = MapSet::new(1);
        DdosFilter::new(&maps, DdosConfig::default()).unwrap();
        assert!(DdosFilter::new(&maps, DdosConfig::default()).is_err());
    }

    #[test]
    fn test_blocklist_drop_and_event() {
        let (_maps, f, prog) = setup(100);
        let bad = Ipv4Addr::new(203, 0, 113, 9);
        f.block(bad).unwrap();
        f.block(bad).unwrap();
        assert_eq!(f.blocked(), vec![bad]);

        let mut pkt = PacketBuilder::new().src(bad, 1234).build();
        assert_eq!(run(&prog, &mut pkt), Verdict::Drop);
        assert_eq!(f.block_hits(bad).unwrap(), Some(1));
        assert_eq!(f.stats().blocked, 1);

        let events = f.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DropReason::Blocked);
        assert_eq!(events[0].flow.src, bad);
        assert_eq!(events[0].flow.src_port, 0);

        assert!(f.unblock(bad).unwrap());
        assert!(!f.unblock(bad).unwrap());
        assert_eq!(run(&prog, &mut pkt), Verdict::Forward);
    }

    #[test]
    fn test_rate_limit_and_reset() {
        let (_maps, f, prog) = setup(3);
        let pkt = PacketBuilder::new().tcp().build();
        let flow = FlowKey::from_packet(&pkt).unwrap();
        for _ in 0..3 {
            assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Forward);
        }
        assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Drop);
        assert_eq!(f.flow_count(&flow).unwrap(), Some(4));

        let events = f.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DropReason::RateLimited);
        assert_eq!(events[0].flow, flow);

        assert_eq!(f.reset_window(), 1);
        assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Forward);
        let s = f.stats();
        assert_eq!((s.passed, s.rate_limited), (4, 1));
    }

    #[test]
    fn test_zero_threshold_disables_limit() {
        let (_maps, f, prog) = setup(0);
        let pkt = PacketBuilder::new().build();
        for _ in 0..10 {
            assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Forward);
        }
        assert_eq!(f.stats().passed, 10);
        f.set_threshold(5).unwrap();
        assert_eq!(f.threshold().unwrap(), 5);
        assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Drop);
    }

    #[test]
    fn test_untracked_traffic() {
        let (_maps, f, prog) = setup(1);
        let mut arp = PacketBuilder::new().ethertype(0x0806).build();
        assert_eq!(run(&prog, &mut arp), Verdict::Forward);

        let mut short = PacketBuilder::new().tcp().build();
        short.truncate(36);
        assert_eq!(run(&prog, &mut short), Verdict::Forward);
        assert_eq!(f.stats().untracked, 2);
        assert_eq!(f.flows_tracked(), 0);
    }

    #[test]
    fn test_ip_options_shift_ports() {
        let (_maps, f, prog) = setup(100);
        let pkt = PacketBuilder::new()
            .udp()
            .src(Ipv4Addr::new(10, 0, 0, 7), 5000)
            .ip_options(&[1; 12])
            .build();
        assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Forward);
        let flow = FlowKey::from_packet(&pkt).unwrap();
        assert_eq!(flow.src_port, 5000);
        assert_eq!(f.flow_count(&flow).unwrap(), Some(1));
    }

    #[test]
    fn test_concurrent_new_flow_counts_every_packet() {
        let maps = MapSet::new(4);
        let f = DdosFilter::new(&maps, DdosConfig::default().with_threshold(0)).unwrap();
        let prog = f.load(&maps).unwrap();
        let engine = Engine::default();
        let pkt = PacketBuilder::new().udp().build();
        let flow = FlowKey::from_packet(&pkt).unwrap();

        std::thread::scope(|s| {
            for worker in 0..4 {
                let (prog, engine, pkt) = (&prog, &engine, &pkt);
                s.spawn(move || {
                    for _ in 0..250 {
                        let mut p = pkt.clone();
                        let mut ctx = PacketContext::new(&mut p, RxMeta::on_worker(worker));
                        assert_eq!(engine.try_run(prog, &mut ctx).unwrap(), Verdict::Forward);
                    }
                });
            }
        });
        assert_eq!(f.flow_count(&flow).unwrap(), Some(1000));
        let s = f.stats();
        assert_eq!((s.passed, s.untracked), (1000, 0));
    }

    #[test]
    fn test_flow_seeded_by_control_plane_keeps_count() {
        let (_maps, f, prog) = setup(100);
        let pkt = PacketBuilder::new().tcp().build();
        let flow = FlowKey::from_packet(&pkt).unwrap();
        f.flows.insert(&flow, &41, UpdateMode::Upsert).unwrap();
        assert_eq!(run(&prog, &mut pkt.clone()), Verdict::Forward);
        assert_eq!(f.flow_count(&flow).unwrap(), Some(42));
    }
}
