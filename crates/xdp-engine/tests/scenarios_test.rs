// SPDX-License-Identifier: GPL-2.0
//! End-to-end scenarios: reference programs behind the dispatcher

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::thread;

use xdp_engine::apps::packet::destination;
use xdp_engine::apps::{
    Backend, DdosConfig, DdosFilter, DropReason, FlowKey, LbConfig, LoadBalancer, PacketBuilder,
};
use xdp_engine::prelude::*;

fn client(i: u32) -> FlowKey {
    let [_, _, hi, lo] = i.to_be_bytes();
    let port = 20000 + (i % 40000) as u16;
    FlowKey::tcp(Ipv4Addr::new(10, 1, hi, lo), port, Ipv4Addr::new(192, 0, 2, 80), 443)
}

fn ddos_dispatcher(workers: usize, threshold: u64) -> (DdosFilter, Dispatcher) {
    let maps = MapSet::new(workers);
    let filter = DdosFilter::new(&maps, DdosConfig::default().with_threshold(threshold)).unwrap();
    let d = Dispatcher::new(DispatcherConfig::default().with_workers(workers));
    d.attach_default(filter.load(&maps).unwrap()).unwrap();
    (filter, d)
}

fn lb_dispatcher(backends: u8) -> (LoadBalancer, Dispatcher, MapSet) {
    let maps = MapSet::new(1);
    let lb = LoadBalancer::new(&maps, LbConfig::default()).unwrap();
    for i in 1..=backends {
        lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, i), 8443)).unwrap();
    }
    let d = Dispatcher::default();
    d.attach_default(lb.load(&maps).unwrap()).unwrap();
    (lb, d, maps)
}

// ============================================================================
// DDoS filter
// ============================================================================

#[test]
fn test_blocklisted_source_dropped_and_reported() {
    let (filter, d) = ddos_dispatcher(1, 100);
    let attacker = Ipv4Addr::new(10, 0, 0, 5);
    filter.block(attacker).unwrap();

    let mut host = CollectingHost::new();
    let mut bad = PacketBuilder::new().src(attacker, 5353).build();
    let mut good = PacketBuilder::new().src(Ipv4Addr::new(10, 0, 0, 6), 5353).build();
    d.process(&mut bad, RxMeta::default(), &mut host);
    d.process(&mut good, RxMeta::default(), &mut host);

    assert_eq!(host.count(Action::Drop), 1);
    assert_eq!(host.count(Action::Forward), 1);
    let events = filter.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, DropReason::Blocked);
    assert_eq!(events[0].flow.src, attacker);
    assert!(filter.drain_events().is_empty());
}

#[test]
fn test_flow_over_threshold_dropped() {
    let (filter, d) = ddos_dispatcher(1, 100);
    let pkt = PacketBuilder::from_flow(&client(1)).build();

    for n in 1..=100 {
        let r = d.receive_packet(&mut pkt.clone(), RxMeta::default());
        assert_eq!(r.action, Action::Forward, "packet {}", n);
    }
    let r = d.receive_packet(&mut pkt.clone(), RxMeta::default());
    assert_eq!(r.action, Action::Drop);

    // Another flow is unaffected
    let mut other = PacketBuilder::from_flow(&client(2)).build();
    assert_eq!(d.receive_packet(&mut other, RxMeta::default()).action, Action::Forward);

    let events = filter.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, DropReason::RateLimited);
    assert_eq!(events[0].flow, client(1));

    filter.reset_window();
    assert_eq!(d.receive_packet(&mut pkt.clone(), RxMeta::default()).action, Action::Forward);
}

#[test]
fn test_rate_limit_across_workers() {
    let (filter, d) = ddos_dispatcher(4, 100);
    thread::scope(|s| {
        for worker in 0..4u32 {
            let d = &d;
            s.spawn(move || {
                let pkt = PacketBuilder::from_flow(&client(worker + 10)).build();
                for _ in 0..150 {
                    d.receive_packet(&mut pkt.clone(), RxMeta::on_worker(worker));
                }
            });
        }
    });

    let stats = filter.stats();
    assert_eq!(stats.passed, 400);
    assert_eq!(stats.rate_limited, 200);
    let snap = d.stats().snapshot();
    assert_eq!((snap.forwarded, snap.dropped), (400, 200));
    assert_eq!(filter.drain_events().len(), 200);
}

// ============================================================================
// Load balancer
// ============================================================================

#[test]
fn test_flows_spread_over_backends() {
    let (lb, d, _maps) = lb_dispatcher(4);
    let mut per_backend: HashMap<u32, usize> = HashMap::new();
    for i in 0..1000 {
        let flow = client(i);
        let mut pkt = PacketBuilder::from_flow(&flow).build();
        let r = d.receive_packet(&mut pkt, RxMeta::default());
        let Verdict::Redirect(id) = r.verdict else {
            panic!("flow {} not balanced: {:?}", i, r);
        };
        assert_eq!(r.action, Action::Redirect(id));
        *per_backend.entry(id).or_default() += 1;

        let (_, backend) = lb.select_backend(&flow).unwrap().unwrap();
        assert_eq!(destination(&pkt), Some((backend.addr, backend.port)));
    }
    assert_eq!(per_backend.len(), 4);
    // Mean is 250 flows per backend
    assert!(per_backend.values().all(|n| *n < 500), "{:?}", per_backend);
    assert_eq!(lb.connections(), 1000);
}

#[test]
fn test_backend_removal_moves_only_its_flows() {
    let (lb, d, _maps) = lb_dispatcher(4);
    let flows: Vec<FlowKey> = (0..1000).map(client).collect();
    let route = |flow: &FlowKey| -> Verdict {
        let mut pkt = PacketBuilder::from_flow(flow).build();
        d.receive_packet(&mut pkt, RxMeta::default()).verdict
    };
    let before: Vec<Verdict> = flows.iter().map(route).collect();
    let slots_before: Vec<Option<u32>> = (0..1021).map(|s| lb.slot(s).unwrap()).collect();

    let gone = 2;
    lb.remove_backend(gone).unwrap();
    let slots_after: Vec<Option<u32>> = (0..1021).map(|s| lb.slot(s).unwrap()).collect();
    for (old, new) in slots_before.iter().zip(&slots_after) {
        if *old != Some(gone) {
            assert_eq!(old, new);
        } else {
            assert!(new.is_some() && *new != Some(gone));
        }
    }

    let mut moved = 0;
    for (flow, old) in flows.iter().zip(&before) {
        let now = route(flow);
        if *old == Verdict::Redirect(gone) {
            assert_ne!(now, Verdict::Redirect(gone));
            assert!(matches!(now, Verdict::Redirect(_)));
            moved += 1;
        } else {
            assert_eq!(now, *old);
        }
    }
    assert!(moved > 0);
}

#[test]
fn test_programs_swap_without_losing_state() {
    // Filter and balancer maps live side by side; swapping programs keeps both
    let maps = MapSet::new(1);
    let filter = DdosFilter::new(&maps, DdosConfig::default().with_threshold(2)).unwrap();
    let lb = LoadBalancer::new(&maps, LbConfig::default()).unwrap();
    lb.add_backend(Backend::new(Ipv4Addr::new(172, 16, 0, 9), 80)).unwrap();
    let d = Dispatcher::default();
    let flow = client(7);
    let pkt = PacketBuilder::from_flow(&flow).build();

    d.attach_default(filter.load(&maps).unwrap()).unwrap();
    d.receive_packet(&mut pkt.clone(), RxMeta::default());
    d.attach_default(lb.load(&maps).unwrap()).unwrap();
    assert_eq!(d.receive_packet(&mut pkt.clone(), RxMeta::default()).verdict, Verdict::Redirect(0));
    d.attach_default(filter.load(&maps).unwrap()).unwrap();
    d.receive_packet(&mut pkt.clone(), RxMeta::default());

    assert_eq!(filter.flow_count(&flow).unwrap(), Some(2));
    assert_eq!(lb.connection(&flow).unwrap(), Some(0));
    assert_eq!(d.receive_packet(&mut pkt.clone(), RxMeta::default()).action, Action::Drop);
}
