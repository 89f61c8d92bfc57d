// SPDX-License-Identifier: GPL-2.0

//! Per-packet execution context and verdicts

use std::fmt;

use crate::core::error::ExecutionError;
use crate::core::types::*;

/// Receive metadata supplied by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RxMeta {
    /// Interface the packet arrived on
    pub ingress_ifindex: u32,
    /// Receive queue
    pub rx_queue_index: u32,
    /// Worker running the program; selects per-worker map copies
    pub worker_id: u32,
}

impl RxMeta {
    /// Metadata for `worker_id` with interface and queue zero
    pub fn on_worker(worker_id: u32) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }
}

/// Outcome of one program run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Continue up the host stack
    Forward,
    /// Drop the packet
    Drop,
    /// Send back out of the ingress interface
    Bounce,
    /// Send to the given target
    Redirect(u32),
    /// The run aborted
    Error,
}

impl Verdict {
    /// Decode the value of r0 at exit. `redirect` is the target chosen by
    /// the last successful `redirect` call.
    pub fn from_code(code: u64, redirect: Option<u32>) -> Result<Self, ExecutionError> {
        match code {
            XDP_ABORTED => Ok(Verdict::Error),
            XDP_DROP => Ok(Verdict::Drop),
            XDP_PASS => Ok(Verdict::Forward),
            XDP_TX => Ok(Verdict::Bounce),
            XDP_REDIRECT => redirect
                .map(Verdict::Redirect)
                .ok_or(ExecutionError::MissingRedirectTarget),
            other => Err(ExecutionError::InvalidReturnCode(other)),
        }
    }

    /// Return code a program produces for this verdict
    pub fn code(&self) -> u64 {
        match self {
            Verdict::Error => XDP_ABORTED,
            Verdict::Drop => XDP_DROP,
            Verdict::Forward => XDP_PASS,
            Verdict::Bounce => XDP_TX,
            Verdict::Redirect(_) => XDP_REDIRECT,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Forward => f.write_str("forward"),
            Verdict::Drop => f.write_str("drop"),
            Verdict::Bounce => f.write_str("bounce"),
            Verdict::Redirect(t) => write!(f, "redirect({})", t),
            Verdict::Error => f.write_str("error"),
        }
    }
}

/// What a program sees of one packet.
///
/// Borrows the packet bytes for the duration of the run; the host cannot
/// touch them until the run is over.
#[derive(Debug)]
pub struct PacketContext<'a> {
    pub(crate) packet: &'a mut [u8],
    pub(crate) meta: RxMeta,
    pub(crate) scratch: [u8; CTX_SCRATCH_SIZE],
    pub(crate) verdict: Option<Verdict>,
}

impl<'a> PacketContext<'a> {
    /// Context over `packet`
    pub fn new(packet: &'a mut [u8], meta: RxMeta) -> Self {
        Self {
            packet,
            meta,
            scratch: [0; CTX_SCRATCH_SIZE],
            verdict: None,
        }
    }

    /// Packet bytes, as rewritten by the program
    pub fn packet(&self) -> &[u8] {
        self.packet
    }

    /// Receive metadata
    pub fn meta(&self) -> &RxMeta {
        &self.meta
    }

    /// Scratch area
    pub fn scratch(&self) -> &[u8; CTX_SCRATCH_SIZE] {
        &self.scratch
    }

    /// Verdict of the last run; `None` before any run
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_codes() {
        assert_eq!(Verdict::from_code(XDP_PASS, None), Ok(Verdict::Forward));
        assert_eq!(Verdict::from_code(XDP_ABORTED, None), Ok(Verdict::Error));
        assert_eq!(Verdict::from_code(XDP_REDIRECT, Some(3)), Ok(Verdict::Redirect(3)));
        assert_eq!(
            Verdict::from_code(XDP_REDIRECT, None),
            Err(ExecutionError::MissingRedirectTarget)
        );
        assert_eq!(Verdict::from_code(9, None), Err(ExecutionError::InvalidReturnCode(9)));
        assert_eq!(Verdict::Bounce.code(), XDP_TX);
    }
}
