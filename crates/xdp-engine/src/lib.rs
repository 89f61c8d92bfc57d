// SPDX-License-Identifier: GPL-2.0

//! # xdp-engine
//!
//! Convenience crate that re-exports the engine core and the reference
//! applications.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use xdp_engine::prelude::*;
//! use xdp_engine::apps::{DdosConfig, DdosFilter, PacketBuilder};
//!
//! let maps = MapSet::new(1);
//! let filter = DdosFilter::new(&maps, DdosConfig::default()).unwrap();
//! let dispatcher = Dispatcher::default();
//! dispatcher.attach_default(filter.load(&maps).unwrap()).unwrap();
//!
//! let mut pkt = PacketBuilder::new().build();
//! let d = dispatcher.receive_packet(&mut pkt, RxMeta::default());
//! assert_eq!(d.action, Action::Forward);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Re-export core crate modules
pub use xdp_engine_core::analysis;
pub use xdp_engine_core::bounds;
pub use xdp_engine_core::check;
pub use xdp_engine_core::exec;
pub use xdp_engine_core::maps;
pub use xdp_engine_core::mem;
pub use xdp_engine_core::pipeline;
pub use xdp_engine_core::program;
pub use xdp_engine_core::state;
pub use xdp_engine_core::verifier;
pub use xdp_engine_core::core as engine_core;

// Re-export crates
pub use xdp_engine_apps as apps;
pub use xdp_engine_core as engine;

// Convenient re-exports (prelude)
pub use xdp_engine_core::prelude;
pub use xdp_engine_core::prelude::*;
