// SPDX-License-Identifier: GPL-2.0

//! Application errors

use thiserror::Error;
use xdp_engine_core::core::error::{AsmError, MapError, Rejection};

/// Result type alias for application operations
pub type Result<T> = core::result::Result<T, AppError>;

/// Errors from setting up or driving an application
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Map creation or access failed
    #[error("map error: {0}")]
    Map(#[from] MapError),

    /// Program assembly failed
    #[error("assembler error: {0}")]
    Asm(#[from] AsmError),

    /// The program was rejected by the verifier
    #[error("program rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Every backend id is in use
    #[error("backend table full ({0} entries)")]
    BackendsFull(u32),

    /// No active backend with this id
    #[error("unknown backend {0}")]
    UnknownBackend(u32),
}
