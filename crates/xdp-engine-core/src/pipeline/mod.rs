// SPDX-License-Identifier: GPL-2.0

//! Packet pipeline: received, dispatched, verdicted, applied

pub mod dispatcher;
pub mod host;

pub use dispatcher::{
    Action, Dispatch, Dispatcher, DispatcherConfig, DispatcherStats, FailurePolicy, PacketStage,
    StatsSnapshot,
};
pub use host::{CollectingHost, Host};
