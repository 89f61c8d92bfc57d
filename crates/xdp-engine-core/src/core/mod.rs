// SPDX-License-Identifier: GPL-2.0

//! Core types, errors, logging and disassembly

pub mod disasm;
pub mod error;
pub mod hash;
pub mod log;
pub mod types;
