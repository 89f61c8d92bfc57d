// SPDX-License-Identifier: GPL-2.0

//! Packet dispatcher
//!
//! Holds the attached program and runs it on every received packet. The
//! attachment is an `Arc` behind a lock taken only long enough to clone it,
//! so a swap never waits for or interrupts a run in progress: the run keeps
//! the version it started with.
//!
//! Each worker owns a [`RunScratch`] that its runs reuse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::host::Host;
use crate::core::error::AttachError;
use crate::exec::{Engine, EngineConfig, PacketContext, RunScratch, RxMeta, Verdict};
use crate::program::VerifiedProgram;

/// What to do with packets whose run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailurePolicy {
    /// Forward the packet
    #[default]
    FailOpen,
    /// Drop the packet
    FailClosed,
}

/// Action the host carries out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Up the host stack
    Forward,
    /// Discard
    Drop,
    /// Back out of the ingress interface
    Bounce,
    /// To the given target
    Redirect(u32),
}

impl Action {
    /// Resolve a verdict; `Error` goes through `policy`
    pub fn resolve(verdict: Verdict, policy: FailurePolicy) -> Self {
        match verdict {
            Verdict::Forward => Action::Forward,
            Verdict::Drop => Action::Drop,
            Verdict::Bounce => Action::Bounce,
            Verdict::Redirect(t) => Action::Redirect(t),
            Verdict::Error => match policy {
                FailurePolicy::FailOpen => Action::Forward,
                FailurePolicy::FailClosed => Action::Drop,
            },
        }
    }
}

/// How far a packet got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketStage {
    /// Handed to the dispatcher
    Received,
    /// Program run started
    Dispatched,
    /// Verdict known
    Verdicted,
    /// Action carried out by the host
    Applied,
}

/// Result of dispatching one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Program verdict; `Forward` when no program is attached
    pub verdict: Verdict,
    /// Action after the failure policy
    pub action: Action,
    /// Last stage reached
    pub stage: PacketStage,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Number of workers; receive metadata must name one of them
    pub workers: usize,
    /// Policy for attachments that do not name one
    pub failure_policy: FailurePolicy,
    /// Engine configuration
    pub engine: EngineConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            failure_policy: FailurePolicy::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    packets: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    bounced: AtomicU64,
    redirected: AtomicU64,
    errors: AtomicU64,
    no_program: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Packets received
    pub packets: u64,
    /// `Forward` verdicts
    pub forwarded: u64,
    /// `Drop` verdicts
    pub dropped: u64,
    /// `Bounce` verdicts
    pub bounced: u64,
    /// `Redirect` verdicts
    pub redirected: u64,
    /// Failed runs
    pub errors: u64,
    /// Packets seen with no program attached
    pub no_program: u64,
}

impl DispatcherStats {
    fn record(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Forward => &self.forwarded,
            Verdict::Drop => &self.dropped,
            Verdict::Bounce => &self.bounced,
            Verdict::Redirect(_) => &self.redirected,
            Verdict::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bounced: self.bounced.load(Ordering::Relaxed),
            redirected: self.redirected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            no_program: self.no_program.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Attachment {
    program: Arc<VerifiedProgram>,
    policy: FailurePolicy,
}

/// Runs the attached program on received packets
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    engine: Engine,
    attachment: RwLock<Option<Arc<Attachment>>>,
    scratch: Vec<Mutex<RunScratch>>,
    stats: DispatcherStats,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Dispatcher {
    /// Dispatcher with no program attached
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_engine(config, Engine::new(config.engine))
    }

    /// Dispatcher running programs on `engine`
    pub fn with_engine(config: DispatcherConfig, engine: Engine) -> Self {
        let scratch = (0..config.workers).map(|_| Mutex::new(engine.scratch())).collect();
        Self {
            config,
            engine,
            attachment: RwLock::new(None),
            scratch,
            stats: DispatcherStats::default(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Attach `program`, replacing the current one. Returns the replaced
    /// program.
    ///
    /// Every per-worker map the program uses must hold a copy for each
    /// configured worker; otherwise the current attachment is left in place.
    pub fn attach(
        &self,
        program: Arc<VerifiedProgram>,
        policy: FailurePolicy,
    ) -> Result<Option<Arc<VerifiedProgram>>, AttachError> {
        self.check_worker_copies(&program)?;
        tracing::debug!(program = program.name(), ?policy, "program attached");
        let next = Arc::new(Attachment { program, policy });
        Ok(self
            .attachment
            .write()
            .replace(next)
            .map(|old| old.program.clone()))
    }

    /// Attach with the configured failure policy
    pub fn attach_default(&self, program: Arc<VerifiedProgram>) -> Result<Option<Arc<VerifiedProgram>>, AttachError> {
        self.attach(program, self.config.failure_policy)
    }

    fn check_worker_copies(&self, program: &VerifiedProgram) -> Result<(), AttachError> {
        let workers = self.config.workers;
        for map in program.maps() {
            let Some(store) = map.as_per_worker() else {
                continue;
            };
            if store.workers() < workers {
                tracing::warn!(
                    program = program.name(),
                    map = map.name(),
                    copies = store.workers(),
                    workers,
                    "attach refused"
                );
                return Err(AttachError::TooFewWorkerCopies {
                    map: map.name().to_string(),
                    copies: store.workers(),
                    workers,
                });
            }
        }
        Ok(())
    }

    /// Detach the current program
    pub fn detach(&self) -> Option<Arc<VerifiedProgram>> {
        let old = self.attachment.write().take().map(|a| a.program.clone());
        if let Some(p) = &old {
            tracing::debug!(program = p.name(), "program detached");
        }
        old
    }

    /// Currently attached program
    pub fn attached(&self) -> Option<Arc<VerifiedProgram>> {
        self.attachment.read().as_ref().map(|a| a.program.clone())
    }

    /// Counters
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Run the attached program on `packet` and decide its action
    pub fn receive_packet(&self, packet: &mut [u8], meta: RxMeta) -> Dispatch {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        let current = self.attachment.read().clone();
        let Some(att) = current else {
            self.stats.no_program.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(len = packet.len(), "no program attached");
            return Dispatch {
                verdict: Verdict::Forward,
                action: Action::Forward,
                stage: PacketStage::Verdicted,
            };
        };

        let verdict = match self.scratch.get(meta.worker_id as usize) {
            Some(run) => {
                let mut ctx = PacketContext::new(packet, meta);
                self.engine.run_with(&att.program, &mut ctx, &mut run.lock())
            }
            None => {
                tracing::warn!(
                    worker = meta.worker_id,
                    workers = self.config.workers,
                    "receive metadata names an unknown worker"
                );
                Verdict::Error
            }
        };
        self.stats.record(verdict);
        let action = Action::resolve(verdict, att.policy);
        tracing::trace!(program = att.program.name(), %verdict, ?action, "packet dispatched");
        Dispatch {
            verdict,
            action,
            stage: PacketStage::Verdicted,
        }
    }

    /// Receive, run and hand the action to `host`
    pub fn process(&self, packet: &mut [u8], meta: RxMeta, host: &mut impl Host) -> Dispatch {
        let mut d = self.receive_packet(packet, meta);
        host.apply(d.action, packet);
        d.stage = PacketStage::Applied;
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::*;
    use crate::maps::MapSet;
    use crate::pipeline::CollectingHost;
    use crate::program::{Asm, AttachKind, Program};
    use crate::verifier::verify;

    fn returning(code: u64) -> Arc<VerifiedProgram> {
        let mut a = Asm::new();
        a.ret(code);
        let p = Program::new("ret", a.finish().unwrap(), AttachKind::Ingress);
        Arc::new(verify(&p, &MapSet::default()).unwrap())
    }

    #[test]
    fn test_no_program_forwards() {
        let d = Dispatcher::default();
        let mut pkt = [0u8; 64];
        let r = d.receive_packet(&mut pkt, RxMeta::default());
        assert_eq!(r.action, Action::Forward);
        assert_eq!(d.stats().snapshot().no_program, 1);
    }

    #[test]
    fn test_attach_swap_and_detach() {
        let d = Dispatcher::default();
        assert!(d.attach(returning(XDP_DROP), FailurePolicy::FailOpen).unwrap().is_none());
        let mut pkt = [0u8; 64];
        assert_eq!(d.receive_packet(&mut pkt, RxMeta::default()).verdict, Verdict::Drop);

        let old = d.attach(returning(XDP_TX), FailurePolicy::FailOpen).unwrap().unwrap();
        assert_eq!(old.name(), "ret");
        assert_eq!(d.receive_packet(&mut pkt, RxMeta::default()).action, Action::Bounce);

        assert!(d.detach().is_some());
        assert!(d.attached().is_none());
        let s = d.stats().snapshot();
        assert_eq!((s.packets, s.dropped, s.bounced), (2, 1, 1));
    }

    #[test]
    fn test_failure_policy() {
        let d = Dispatcher::default();
        d.attach(returning(XDP_ABORTED), FailurePolicy::FailClosed).unwrap();
        let mut host = CollectingHost::new();
        let mut pkt = [0u8; 64];
        let r = d.process(&mut pkt, RxMeta::default(), &mut host);
        assert_eq!(r.verdict, Verdict::Error);
        assert_eq!(r.action, Action::Drop);
        assert_eq!(r.stage, PacketStage::Applied);
        assert_eq!(host.count(Action::Drop), 1);

        d.attach(returning(XDP_ABORTED), FailurePolicy::FailOpen).unwrap();
        assert_eq!(d.receive_packet(&mut pkt, RxMeta::default()).action, Action::Forward);
    }

    #[test]
    fn test_unknown_worker() {
        let d = Dispatcher::new(DispatcherConfig::default().with_workers(2));
        d.attach(returning(XDP_PASS), FailurePolicy::FailClosed).unwrap();
        let mut pkt = [0u8; 64];
        assert_eq!(d.receive_packet(&mut pkt, RxMeta::on_worker(1)).action, Action::Forward);
        assert_eq!(d.receive_packet(&mut pkt, RxMeta::on_worker(2)).action, Action::Drop);
    }

    #[test]
    fn test_runs_reuse_worker_stack() {
        let mut a = Asm::new();
        a.st(BPF_DW, 10, -16, XDP_DROP as i32)
            .ldx(BPF_DW, 0, 10, -16)
            .exit();
        let p = Program::new("stack", a.finish().unwrap(), AttachKind::Ingress);
        let v = Arc::new(verify(&p, &MapSet::default()).unwrap());
        assert_eq!(v.stats().stack_depth, 16);

        let d = Dispatcher::new(DispatcherConfig::default().with_workers(2));
        d.attach_default(v).unwrap();
        let mut pkt = [0u8; 64];
        for worker in [0, 1, 0, 0] {
            assert_eq!(d.receive_packet(&mut pkt, RxMeta::on_worker(worker)).verdict, Verdict::Drop);
        }
        assert_eq!(d.stats().snapshot().dropped, 4);
    }
}
