// SPDX-License-Identifier: GPL-2.0

//! Abstract state tracked along each verification path

pub mod reg_state;
pub mod stack_state;
pub mod verifier_state;

pub use reg_state::RegState;
pub use stack_state::{SlotKind, StackError, StackState};
pub use verifier_state::VerifierState;
