// SPDX-License-Identifier: GPL-2.0

//! # xdp-engine apps
//!
//! Reference packet programs built on `xdp-engine-core`:
//!
//! - [`ddos`]: blocklist and per-flow rate limiting
//! - [`lb`]: layer-4 load balancing with connection tracking
//!
//! Each application owns its maps and a control-plane handle to them, and
//! assembles the packet program that uses them. Programs still go through
//! the verifier like any other.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod ddos;
pub mod error;
pub mod flow;
pub mod lb;
pub mod packet;

mod emit;

pub use ddos::{DdosConfig, DdosFilter, DdosStats, DropEvent, DropReason};
pub use error::{AppError, Result};
pub use flow::FlowKey;
pub use lb::{Backend, LbConfig, LoadBalancer};
pub use packet::PacketBuilder;
