// SPDX-License-Identifier: GPL-2.0

//! Host side of the pipeline

use super::dispatcher::Action;

/// Whatever carries packets after the verdict: a NIC driver, a test harness
pub trait Host {
    /// Carry out `action` on `packet`
    fn apply(&mut self, action: Action, packet: &[u8]);
}

/// Host that records every action, for tests and tooling
#[derive(Debug, Default, Clone)]
pub struct CollectingHost {
    /// Actions applied, with a copy of the packet at that point
    pub applied: Vec<(Action, Vec<u8>)>,
}

impl CollectingHost {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets that got `action`
    pub fn count(&self, action: Action) -> usize {
        self.applied.iter().filter(|(a, _)| *a == action).count()
    }
}

impl Host for CollectingHost {
    fn apply(&mut self, action: Action, packet: &[u8]) {
        self.applied.push((action, packet.to_vec()));
    }
}
