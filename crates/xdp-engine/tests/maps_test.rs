// SPDX-License-Identifier: GPL-2.0
//! Map semantics shared between packet programs and the control plane

use std::sync::Arc;
use std::thread;

use xdp_engine::prelude::*;

/// Program that adds one to the u64 at index 0 of map 0
fn counter_program(maps: &MapSet, name: &str, schema: &MapSchema) -> Arc<VerifiedProgram> {
    let mut a = Asm::new();
    let out = a.label();
    a.st(BPF_W, 10, -4, 0)
        .ld_map(1, 0)
        .mov64_reg(2, 10)
        .add64_imm(2, -4)
        .call(Helper::MapLookupElem)
        .jeq_imm(0, 0, out)
        .mov64_imm(1, 1)
        .atomic_add(BPF_DW, 0, 1, 0)
        .bind(out)
        .ret(XDP_PASS);
    let p = Program::new("count", a.finish().unwrap(), AttachKind::Ingress)
        .with_map(MapBinding::from_schema(name, schema));
    Arc::new(verify(&p, maps).unwrap())
}

/// Run `prog` once on a blank packet as `worker`
fn run_on(engine: &Engine, prog: &VerifiedProgram, worker: u32) -> Verdict {
    let mut pkt = vec![0u8; 64];
    let mut ctx = PacketContext::new(&mut pkt, RxMeta::on_worker(worker));
    engine.try_run(prog, &mut ctx).unwrap()
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_registry_lifecycle() {
    let maps = MapSet::new(2);
    maps.create("a", MapSchema::hash(4, 8, 4)).unwrap();
    assert_eq!(
        maps.create("a", MapSchema::array(8, 1)).unwrap_err(),
        MapError::Duplicate("a".to_string())
    );
    assert!(matches!(
        maps.create("bad", MapSchema::hash(4, 8, 0)),
        Err(MapError::InvalidSchema(_))
    ));
    assert!(matches!(
        maps.create("bad", MapSchema::new(MapKind::Array, 8, 8, 4)),
        Err(MapError::InvalidSchema(_))
    ));
    assert_eq!(maps.names(), vec!["a".to_string()]);

    maps.destroy("a").unwrap();
    assert!(maps.get("a").is_none());
    assert_eq!(maps.destroy("a").unwrap_err(), MapError::NotFound("a".to_string()));
    assert!(maps.is_empty());
}

#[test]
fn test_program_keeps_destroyed_map() {
    let maps = MapSet::new(1);
    let schema = MapSchema::array(8, 1);
    let map = maps.create("c", schema).unwrap();
    let prog = counter_program(&maps, "c", &schema);
    maps.destroy("c").unwrap();

    let engine = Engine::default();
    assert_eq!(run_on(&engine, &prog, 0), Verdict::Forward);
    let arr: Array<u64> = Array::new(map).unwrap();
    assert_eq!(arr.get(0).unwrap(), Some(1));

    // A new program cannot bind the name any more
    let mut a = Asm::new();
    a.ret(XDP_PASS);
    let p = Program::new("late", a.finish().unwrap(), AttachKind::Ingress)
        .with_map(MapBinding::from_schema("c", &schema));
    assert_eq!(verify(&p, &maps).unwrap_err().reason, RejectionReason::MapSchemaMismatch);
}

// ============================================================================
// Keyed maps
// ============================================================================

#[test]
fn test_hash_update_modes_and_capacity() {
    let maps = MapSet::new(1);
    let h: HashMap<u32, u64> = HashMap::new(maps.create("h", MapSchema::hash(4, 8, 2)).unwrap()).unwrap();

    assert_eq!(h.insert(&1, &10, UpdateMode::UpdateOnly), Err(MapError::Missing));
    h.insert(&1, &10, UpdateMode::CreateOnly).unwrap();
    assert_eq!(h.insert(&1, &11, UpdateMode::CreateOnly), Err(MapError::Exists));
    h.insert(&1, &12, UpdateMode::UpdateOnly).unwrap();
    h.insert(&2, &20, UpdateMode::Upsert).unwrap();
    assert_eq!(h.insert(&3, &30, UpdateMode::Upsert), Err(MapError::Full));

    // Replacing an existing key never needs room
    h.insert(&2, &21, UpdateMode::Upsert).unwrap();
    assert_eq!(h.get(&1).unwrap(), Some(12));
    assert_eq!(h.get(&2).unwrap(), Some(21));

    assert_eq!(h.remove(&1).unwrap(), Some(12));
    assert_eq!(h.remove(&1).unwrap(), None);
    h.insert(&3, &30, UpdateMode::Upsert).unwrap();
    let mut keys = h.keys();
    keys.sort_unstable();
    assert_eq!(keys, vec![2, 3]);
}

#[test]
fn test_wrong_sizes_rejected() {
    let maps = MapSet::new(1);
    let map = maps.create("h", MapSchema::hash(4, 8, 2)).unwrap();
    assert_eq!(
        map.update(&[1, 2], &[0; 8], UpdateMode::Upsert),
        Err(MapError::KeySize { expected: 4, got: 2 })
    );
    assert_eq!(
        map.update(&[1, 2, 3, 4], &[0; 4], UpdateMode::Upsert),
        Err(MapError::ValueSize { expected: 8, got: 4 })
    );
    assert!(HashMap::<u64, u64>::new(map).is_err());
}

#[test]
fn test_lru_evicts_least_recently_used() {
    let maps = MapSet::new(1);
    let lru: LruHashMap<u32, u32> =
        LruHashMap::new(maps.create("l", MapSchema::lru_hash(4, 4, 3)).unwrap()).unwrap();
    for k in 1..=3 {
        lru.insert(&k, &(k * 10), UpdateMode::Upsert).unwrap();
    }
    // Touch 1 so that 2 becomes the oldest
    assert_eq!(lru.get(&1).unwrap(), Some(10));
    lru.insert(&4, &40, UpdateMode::Upsert).unwrap();

    assert_eq!(lru.len(), 3);
    assert_eq!(lru.get(&2).unwrap(), None);
    assert_eq!(lru.keys(), vec![4, 1, 3]);
}

#[test]
fn test_lru_never_full() {
    let maps = MapSet::new(1);
    let lru: LruHashMap<u32, u32> =
        LruHashMap::new(maps.create("l", MapSchema::lru_hash(4, 4, 8)).unwrap()).unwrap();
    for k in 0..100 {
        lru.insert(&k, &k, UpdateMode::Upsert).unwrap();
    }
    assert_eq!(lru.len(), 8);
    assert_eq!(lru.get(&99).unwrap(), Some(99));
    assert_eq!(lru.get(&0).unwrap(), None);
}

// ============================================================================
// Arrays
// ============================================================================

#[test]
fn test_array_is_preallocated() {
    let maps = MapSet::new(1);
    let arr: Array<u64> = Array::new(maps.create("a", MapSchema::array(8, 4)).unwrap()).unwrap();
    assert_eq!(arr.len(), 4);
    assert_eq!(arr.get(3).unwrap(), Some(0));
    assert_eq!(arr.get(4).unwrap(), None);

    arr.set(2, &7).unwrap();
    assert_eq!(arr.get(2).unwrap(), Some(7));
    assert_eq!(arr.set(4, &1), Err(MapError::IndexOutOfRange { index: 4, max: 4 }));
    assert!(matches!(
        arr.map().delete(&0u32.to_le_bytes()),
        Err(MapError::Unsupported { .. })
    ));
}

#[test]
fn test_per_worker_copies() {
    let maps = MapSet::new(4);
    let schema = MapSchema::per_worker_array(8, 1);
    let map = maps.create("pw", schema).unwrap();
    let prog = counter_program(&maps, "pw", &schema);
    let engine = Engine::default();
    for worker in [0, 0, 2, 3, 3, 3] {
        run_on(&engine, &prog, worker);
    }

    let pw: PerWorkerArray<u64> = PerWorkerArray::new(map.clone()).unwrap();
    assert_eq!(pw.workers(), 4);
    assert_eq!(pw.values(0), vec![2, 0, 1, 3]);
    assert_eq!(pw.get(2, 0), Some(1));
    assert_eq!(pw.sum(0), 6);
    // Control-plane lookups aggregate across workers
    assert_eq!(map.lookup(&0u32.to_le_bytes()).unwrap(), Some(6u64.to_le_bytes().to_vec()));

    pw.set_all(0, &0).unwrap();
    assert_eq!(pw.sum(0), 0);
}

// ============================================================================
// Ring buffers
// ============================================================================

#[test]
fn test_ringbuf_order_and_discard() {
    let maps = MapSet::new(1);
    let ring = RingBuffer::new(maps.create("r", MapSchema::ringbuf(8, 8)).unwrap()).unwrap();
    ring.output(&[1; 8]).unwrap();
    ring.output(&[2; 4]).unwrap();
    let dropped = ring.reserve(8).unwrap();
    ring.output(&[4; 8]).unwrap();
    dropped.discard();

    let mut seen = Vec::new();
    assert_eq!(ring.drain(|r| seen.push(r.to_vec())), 3);
    assert_eq!(seen, vec![vec![1; 8], vec![2; 4], vec![4; 8]]);
    assert!(ring.poll().is_none());
}

#[test]
fn test_ringbuf_waits_for_pending_reservation() {
    let maps = MapSet::new(1);
    let ring = RingBuffer::new(maps.create("r", MapSchema::ringbuf(8, 4)).unwrap()).unwrap();
    let mut first = ring.reserve(8).unwrap();
    ring.output(&[2; 8]).unwrap();
    assert!(ring.poll().is_none());

    first.write(0, &[1; 8]);
    first.submit();
    assert_eq!(ring.poll(), Some(vec![1; 8]));
    assert_eq!(ring.poll(), Some(vec![2; 8]));
}

#[test]
fn test_ringbuf_concurrent_producers() {
    const PRODUCERS: u32 = 4;
    const RECORDS: u32 = 500;
    let kept = |i: &u32| i % 5 != 4;
    let maps = MapSet::new(1);
    let ring = RingBuffer::new(maps.create("r", MapSchema::ringbuf(8, 64)).unwrap()).unwrap();
    let expected = PRODUCERS as usize * (0..RECORDS).filter(kept).count();

    let seen = thread::scope(|s| {
        for producer in 0..PRODUCERS {
            let ring = &ring;
            s.spawn(move || {
                for i in 0..RECORDS {
                    let mut rec = loop {
                        match ring.reserve(8) {
                            Some(rec) => break rec,
                            None => thread::yield_now(),
                        }
                    };
                    assert!(rec.write(0, &producer.to_le_bytes()));
                    assert!(rec.write(4, &i.to_le_bytes()));
                    if kept(&i) {
                        rec.submit();
                    } else {
                        rec.discard();
                    }
                }
            });
        }
        let consumer = s.spawn(|| {
            let mut seen = vec![Vec::new(); PRODUCERS as usize];
            let mut total = 0;
            while total < expected {
                match ring.poll() {
                    Some(rec) => {
                        let producer = u32::from_le_bytes(rec[..4].try_into().unwrap());
                        let i = u32::from_le_bytes(rec[4..8].try_into().unwrap());
                        seen[producer as usize].push(i);
                        total += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        });
        consumer.join().unwrap()
    });

    let want: Vec<u32> = (0..RECORDS).filter(kept).collect();
    for per_producer in &seen {
        assert_eq!(per_producer, &want);
    }
    assert!(ring.poll().is_none());
}

#[test]
fn test_ringbuf_full() {
    let maps = MapSet::new(1);
    let ring = RingBuffer::new(maps.create("r", MapSchema::ringbuf(4, 2)).unwrap()).unwrap();
    ring.output(&[1; 4]).unwrap();
    ring.output(&[2; 4]).unwrap();
    assert_eq!(ring.output(&[3; 4]), Err(MapError::RingFull));
    assert_eq!(ring.dropped(), 1);
    assert!(ring.reserve(5).is_none());

    assert!(ring.poll().is_some());
    ring.output(&[3; 4]).unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_program_updates() {
    let maps = MapSet::new(4);
    let schema = MapSchema::array(8, 1);
    let map = maps.create("shared", schema).unwrap();
    let prog = counter_program(&maps, "shared", &schema);
    let engine = Engine::default();

    thread::scope(|s| {
        for worker in 0..4u32 {
            let (engine, prog) = (&engine, &prog);
            s.spawn(move || {
                for _ in 0..1000 {
                    run_on(engine, prog, worker);
                }
            });
        }
    });
    let arr: Array<u64> = Array::new(map).unwrap();
    assert_eq!(arr.get(0).unwrap(), Some(4000));
}

#[test]
fn test_no_torn_reads() {
    let maps = MapSet::new(1);
    let arr: Array<u64> = Array::new(maps.create("a", MapSchema::array(8, 1)).unwrap()).unwrap();
    let h: HashMap<u32, u64> = HashMap::new(maps.create("h", MapSchema::hash(4, 8, 1)).unwrap()).unwrap();
    const A: u64 = 0x0101_0101_0101_0101;
    const B: u64 = 0xfefe_fefe_fefe_fefe;

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..20_000 {
                let v = if i % 2 == 0 { A } else { B };
                arr.set(0, &v).unwrap();
                h.insert(&0, &v, UpdateMode::Upsert).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..20_000 {
                let v = arr.get(0).unwrap().unwrap();
                assert!(v == 0 || v == A || v == B, "torn array read {:#x}", v);
                if let Some(v) = h.get(&0).unwrap() {
                    assert!(v == A || v == B, "torn hash read {:#x}", v);
                }
            }
        });
    });
}
