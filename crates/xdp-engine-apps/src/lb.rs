// SPDX-License-Identifier: GPL-2.0

//! Layer-4 load balancer
//!
//! Spreads TCP and UDP flows over a set of backends and keeps each flow on
//! the backend it started on. Per packet:
//!
//! 1. a flow found in `lb_conntrack` reuses its backend;
//! 2. otherwise `hash_bytes(flow) % 1021` picks a slot of `lb_slots`, whose
//!    entry names the backend, and the choice is recorded in `lb_conntrack`;
//! 3. the destination address and port are rewritten to the backend's and
//!    the packet is redirected to the backend id.
//!
//! Everything else, and flows whose backend is gone, is forwarded
//! unchanged. Checksums are left to the egress path.
//!
//! The slot table is built with rendezvous hashing: every slot goes to the
//! active backend with the highest `hash(slot, backend)` score. Adding or
//! removing a backend therefore only moves the slots it wins or held.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use xdp_engine_core::core::hash::{hash_bytes, hash_bytes_seeded};
use xdp_engine_core::core::types::*;
use xdp_engine_core::maps::{Array, LruHashMap, MapSchema, MapSet, Pod};
use xdp_engine_core::program::{Asm, AttachKind, MapBinding, Program, VerifiedProgram};
use xdp_engine_core::verifier::verify;

use crate::emit::*;
use crate::error::{AppError, Result};
use crate::flow::{FlowKey, OFF_IP_DST};

/// Flow to backend id
pub const CONNTRACK_MAP: &str = "lb_conntrack";
/// Backend table
pub const BACKENDS_MAP: &str = "lb_backends";
/// Hash slot to backend id
pub const SLOTS_MAP: &str = "lb_slots";

/// Number of hash slots (prime)
pub const SLOT_COUNT: u32 = 1021;
/// Size of the backend table
pub const MAX_BACKENDS: u32 = 64;
/// Slot entry of an empty table
pub const NO_BACKEND: u32 = u32::MAX;

const MAP_CONNTRACK: u32 = 0;
const MAP_BACKENDS: u32 = 1;
const MAP_SLOTS: u32 = 2;

const BACKEND_ACTIVE: u8 = 1;

/// Backend entry copied out of the map
const FP_BACKEND: i16 = -40;

/// Load balancer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbConfig {
    /// Capacity of the connection table
    pub max_connections: u32,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            max_connections: 65_536,
        }
    }
}

/// A backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Address packets are rewritten to
    pub addr: Ipv4Addr,
    /// Port packets are rewritten to
    pub port: u16,
}

impl Backend {
    /// Backend at `addr:port`
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    fn identity(&self) -> [u8; 6] {
        let mut id = [0u8; 6];
        id[..4].copy_from_slice(&self.addr.octets());
        id[4..].copy_from_slice(&self.port.to_be_bytes());
        id
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// `lb_backends` entry: address, port in network order, flags, padding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct BackendEntry {
    addr: [u8; 4],
    port: [u8; 2],
    flags: u8,
}

impl BackendEntry {
    fn active(b: &Backend) -> Self {
        Self {
            addr: b.addr.octets(),
            port: b.port.to_be_bytes(),
            flags: BACKEND_ACTIVE,
        }
    }

    fn is_active(&self) -> bool {
        self.flags & BACKEND_ACTIVE != 0
    }
}

impl Pod for BackendEntry {
    const SIZE: usize = 8;

    fn write_bytes(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.addr);
        out[4..6].copy_from_slice(&self.port);
        out[6] = self.flags;
        out[7] = 0;
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            addr: [b[0], b[1], b[2], b[3]],
            port: [b[4], b[5]],
            flags: b[6],
        })
    }
}

/// Slot a flow hashes to when it has no connection entry
pub fn slot_of(flow: &FlowKey) -> u32 {
    hash_bytes(&flow.to_bytes()) % SLOT_COUNT
}

fn score(slot: u32, backend: &Backend) -> u32 {
    hash_bytes_seeded(slot, &backend.identity())
}

/// The balancer's maps and control plane
#[derive(Debug)]
pub struct LoadBalancer {
    conntrack: LruHashMap<FlowKey, u64>,
    backends: Array<BackendEntry>,
    slots: Array<u32>,
    table: Mutex<Vec<Option<Backend>>>,
    bindings: Vec<MapBinding>,
}

impl LoadBalancer {
    /// Create the balancer's maps in `maps`, with no backends
    pub fn new(maps: &MapSet, config: LbConfig) -> Result<Self> {
        let schemas = [
            (CONNTRACK_MAP, MapSchema::lru_hash(FlowKey::SIZE as u32, 8, config.max_connections)),
            (BACKENDS_MAP, MapSchema::array(BackendEntry::SIZE as u32, MAX_BACKENDS)),
            (SLOTS_MAP, MapSchema::array(4, SLOT_COUNT)),
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

        let lb = Self {
            conntrack: LruHashMap::new(map(MAP_CONNTRACK))?,
            backends: Array::new(map(MAP_BACKENDS))?,
            slots: Array::new(map(MAP_SLOTS))?,
            table: Mutex::new(vec![None; MAX_BACKENDS as usize]),
            bindings,
        };
        for slot in 0..SLOT_COUNT {
            lb.slots.set(slot, &NO_BACKEND)?;
        }
        Ok(lb)
    }

    /// Add `backend` and return its id. Adding a backend twice returns the
    /// existing id.
    pub fn add_backend(&self, backend: Backend) -> Result<u32> {
        let mut table = self.table.lock();
        if let Some(id) = table.iter().position(|b| *b == Some(backend)) {
            return Ok(id as u32);
        }
        let id = table
            .iter()
            .position(Option::is_none)
            .ok_or(AppError::BackendsFull(MAX_BACKENDS))? as u32;
        self.backends.set(id, &BackendEntry::active(&backend))?;
        table[id as usize] = Some(backend);
        let moved = self.rebuild_slots(&table)?;
        tracing::debug!(id, %backend, moved, "backend added");
        Ok(id)
    }

    /// Remove backend `id`. Its slots move to the remaining backends and its
    /// connection entries are dropped; other flows keep their backend.
    pub fn remove_backend(&self, id: u32) -> Result<Backend> {
        let mut table = self.table.lock();
        let backend = table
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(AppError::UnknownBackend(id))?;
        let mut entry = BackendEntry::active(&backend);
        entry.flags = 0;
        self.backends.set(id, &entry)?;
        let moved = self.rebuild_slots(&table)?;
        let purged = self.purge_connections(id)?;
        tracing::debug!(id, %backend, moved, purged, "backend removed");
        Ok(backend)
    }

    /// Active backends by id
    pub fn backends(&self) -> Vec<(u32, Backend)> {
        self.table
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(id, b)| b.map(|b| (id as u32, b)))
            .collect()
    }

    /// Whether the program may send traffic to backend `id`
    pub fn is_active(&self, id: u32) -> Result<bool> {
        Ok(self.backends.get(id)?.map_or(false, |e| e.is_active()))
    }

    /// Recompute every slot; returns how many changed
    fn rebuild_slots(&self, table: &[Option<Backend>]) -> Result<usize> {
        let mut moved = 0;
        for slot in 0..SLOT_COUNT {
            let best = table
                .iter()
                .enumerate()
                .filter_map(|(id, b)| b.as_ref().map(|b| (score(slot, b), id as u32)))
                .max()
                .map_or(NO_BACKEND, |(_, id)| id);
            if self.slots.get(slot)? != Some(best) {
                self.slots.set(slot, &best)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn purge_connections(&self, id: u32) -> Result<usize> {
        let mut purged = 0;
        for flow in self.conntrack.keys() {
            if self.conntrack.get(&flow)? != Some(u64::from(id)) {
                continue;
            }
            if self.conntrack.remove(&flow)?.is_some() {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Backend id of slot `slot`
    pub fn slot(&self, slot: u32) -> Result<Option<u32>> {
        Ok(self.slots.get(slot)?.filter(|id| *id != NO_BACKEND))
    }

    /// Backend a new flow would be sent to, ignoring connection entries
    pub fn hashed_backend(&self, flow: &FlowKey) -> Result<Option<u32>> {
        self.slot(slot_of(flow))
    }

    /// Backend the program picks for `flow`: its connection entry if any,
    /// else its hash slot
    pub fn select_backend(&self, flow: &FlowKey) -> Result<Option<(u32, Backend)>> {
        let id = match self.connection(flow)? {
            Some(id) => id,
            None => match self.hashed_backend(flow)? {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        Ok(self.table.lock().get(id as usize).copied().flatten().map(|b| (id, b)))
    }

    /// Backend recorded for `flow`
    pub fn connection(&self, flow: &FlowKey) -> Result<Option<u32>> {
        Ok(self.conntrack.get(flow)?.map(|id| id as u32))
    }

    /// Number of tracked connections
    pub fn connections(&self) -> usize {
        self.conntrack.len()
    }

    /// The packet program
    pub fn program(&self) -> Result<Program> {
        let insns = build_program()?;
        Ok(Program::new("l4_lb", insns, AttachKind::Ingress).with_maps(self.bindings.clone()))
    }

    /// Build and verify the packet program against `maps`
    pub fn load(&self, maps: &MapSet) -> Result<Arc<VerifiedProgram>> {
        Ok(Arc::new(verify(&self.program()?, maps)?))
    }
}

// r6 packet, r7 "new connection" flag, r8 backend id, r9 transport header
fn build_program() -> Result<Vec<Insn>> {
    let mut a = Asm::new();
    let pass = a.label();
    let miss = a.label();
    let have_backend = a.label();
    let rewrite = a.label();

    parse_ipv4(&mut a, pass);
    parse_ports(&mut a, R9, pass, pass);

    a.mov64_imm(R7, 0).ld_map(R1, MAP_CONNTRACK);
    stack_ptr(&mut a, R2, FP_KEY);
    a.call(Helper::MapLookupElem)
        .jeq_imm(R0, 0, miss)
        .ldx(BPF_DW, R8, R0, 0)
        .ja(have_backend);

    a.bind(miss);
    stack_ptr(&mut a, R1, FP_KEY);
    a.mov64_imm(R2, FlowKey::SIZE as i32)
        .call(Helper::HashBytes)
        .alu64_imm(BPF_MOD, R0, SLOT_COUNT as i32)
        .stx(BPF_W, FP, R0, FP_INDEX)
        .ld_map(R1, MAP_SLOTS);
    stack_ptr(&mut a, R2, FP_INDEX);
    a.call(Helper::MapLookupElem)
        .jeq_imm(R0, 0, pass)
        .ldx(BPF_W, R8, R0, 0)
        .mov64_imm(R7, 1);

    // Empty slots hold an id past the table, whose lookup fails
    a.bind(have_backend)
        .stx(BPF_W, FP, R8, FP_INDEX)
        .ld_map(R1, MAP_BACKENDS);
    stack_ptr(&mut a, R2, FP_INDEX);
    a.call(Helper::MapLookupElem)
        .jeq_imm(R0, 0, pass)
        .ldx(BPF_B, R1, R0, 6)
        .and64_imm(R1, i32::from(BACKEND_ACTIVE))
        .jeq_imm(R1, 0, pass)
        .ldx(BPF_DW, R1, R0, 0)
        .stx(BPF_DW, FP, R1, FP_BACKEND)
        .jeq_imm(R7, 0, rewrite)
        .stx(BPF_DW, FP, R8, FP_VALUE)
        .ld_map(R1, MAP_CONNTRACK);
    stack_ptr(&mut a, R2, FP_KEY);
    stack_ptr(&mut a, R3, FP_VALUE);
    a.mov64_imm(R4, BPF_ANY as i32).call(Helper::MapUpdateElem);

    a.bind(rewrite)
        .ldx(BPF_W, R1, FP, FP_BACKEND)
        .stx(BPF_W, R6, R1, OFF_IP_DST)
        .ldx(BPF_H, R1, FP, FP_BACKEND + 4)
        .stx(BPF_H, R9, R1, 2)
        .mov64_reg(R1, R8)
        .mov64_imm(R2, 0)
        .call(Helper::Redirect)
        .exit();

    a.bind(pass).ret(XDP_PASS);
    Ok(a.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{destination, PacketBuilder};
    use xdp_engine_core::exec::{Engine, PacketContext, RxMeta, Verdict};

    fn setup() -> (MapSet, LoadBalancer, Arc<VerifiedProgram>) {
        let maps = MapSet::new(1);
        let lb = LoadBalancer::new(&maps, LbConfig::default()).unwrap();
        let prog = lb.load(&maps).unwrap();
        (maps, lb, prog)
    }

    fn run(prog: &VerifiedProgram, pkt: &mut [u8]) -> Verdict {
        let mut ctx = PacketContext::new(pkt, RxMeta::default());
        Engine::default().try_run(prog, &mut ctx).unwrap()
    }

    fn client(i: u8) -> FlowKey {
        FlowKey::tcp(Ipv4Addr::new(10, 0, 1, i), 30000 + u16::from(i), Ipv4Addr::new(192, 0, 2, 80), 80)
    }

    #[test]
    fn test_no_backends_forwards() {
        let (_maps, lb, prog) = setup();
        let mut pkt = PacketBuilder::from_flow(&client(1)).build();
        let before = pkt.clone();
        assert_eq!(run(&prog, &mut pkt), Verdict::Forward);
        assert_eq!(pkt, before);
        assert_eq!(lb.connections(), 0);
    }

    #[test]
    fn test_redirect_and_rewrite() {
        let (_maps, lb, prog) = setup();
        let b = Backend::new(Ipv4Addr::new(172, 16, 0, 5), 8080);
        let id = lb.add_backend(b).unwrap();
        assert_eq!(lb.add_backend(b).unwrap(), id);

        let flow = client(2);
        let mut pkt = PacketBuilder::from_flow(&flow).ip_options(&[1; 4]).build();
        assert_eq!(run(&prog, &mut pkt), Verdict::Redirect(id));
        assert_eq!(destination(&pkt), Some((b.addr, b.port)));
        assert_eq!(lb.connection(&flow).unwrap(), Some(id));
        assert_eq!(lb.select_backend(&flow).unwrap(), Some((id, b)));
    }

    #[test]
    fn test_connection_affinity_survives_new_backend() {
        let (_maps, lb, prog) = setup();
        lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 1), 80)).unwrap();
        let flows: Vec<FlowKey> = (1..=50).map(client).collect();
        let first: Vec<Verdict> = flows
            .iter()
            .map(|f| run(&prog, &mut PacketBuilder::from_flow(f).build()))
            .collect();

        lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 2), 80)).unwrap();
        for (f, v) in flows.iter().zip(&first) {
            assert_eq!(run(&prog, &mut PacketBuilder::from_flow(f).build()), *v);
        }
    }

    #[test]
    fn test_remove_purges_connections() {
        let (_maps, lb, prog) = setup();
        let a = lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 1), 80)).unwrap();
        let b = lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 2), 80)).unwrap();
        for i in 1..=40 {
            run(&prog, &mut PacketBuilder::from_flow(&client(i)).build());
        }
        let on_a = (1..=40).filter(|i| lb.connection(&client(*i)).unwrap() == Some(a)).count();
        assert!(on_a > 0);

        lb.remove_backend(a).unwrap();
        assert_eq!(lb.connections(), 40 - on_a);
        assert!(matches!(lb.remove_backend(a), Err(AppError::UnknownBackend(_))));
        for i in 1..=40 {
            assert_eq!(
                run(&prog, &mut PacketBuilder::from_flow(&client(i)).build()),
                Verdict::Redirect(b)
            );
        }
    }

    #[test]
    fn test_removed_backend_marked_inactive() {
        let (_maps, lb, prog) = setup();
        let a = lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 1), 80)).unwrap();
        assert!(lb.is_active(a).unwrap());
        assert!(!lb.is_active(MAX_BACKENDS - 1).unwrap());

        lb.remove_backend(a).unwrap();
        assert!(!lb.is_active(a).unwrap());
        // A leftover connection entry does not reach an inactive backend
        let flow = client(3);
        lb.conntrack
            .insert(&flow, &u64::from(a), xdp_engine_core::maps::UpdateMode::Upsert)
            .unwrap();
        assert_eq!(run(&prog, &mut PacketBuilder::from_flow(&flow).build()), Verdict::Forward);
    }

    #[test]
    fn test_non_transport_forwarded() {
        let (_maps, lb, prog) = setup();
        lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 1), 80)).unwrap();
        let mut icmp = PacketBuilder::new().protocol(1).build();
        assert_eq!(run(&prog, &mut icmp), Verdict::Forward);
    }

    #[test]
    fn test_slot_table_uses_every_backend() {
        let (_maps, lb, _prog) = setup();
        for i in 1..=4 {
            lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, i), 80)).unwrap();
        }
        let mut per_backend = [0usize; 4];
        for s in 0..SLOT_COUNT {
            per_backend[lb.slot(s).unwrap().unwrap() as usize] += 1;
        }
        assert!(per_backend.iter().all(|n| *n > 150), "{:?}", per_backend);
    }
}
