// SPDX-License-Identifier: GPL-2.0

//! Program representation
//!
//! A [`Program`] is unverified input: instructions, the maps it expects and
//! where it attaches. Only the verifier turns it into a [`VerifiedProgram`].

pub mod asm;
pub mod verified;

use std::fmt;
use std::sync::Arc;

use crate::analysis::cfg::ControlFlowGraph;
use crate::core::disasm::{disasm_program, DisasmOptions};
use crate::core::types::*;
use crate::maps::{MapKind, MapSchema};

pub use asm::{Asm, Label};
pub use verified::VerifiedProgram;

/// Where a program runs and what it may do there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttachKind {
    /// Full packet program: may rewrite packets and redirect
    #[default]
    Ingress,
    /// Read-only tap: no packet writes, no redirect, only drop or pass
    Observe,
}

impl AttachKind {
    /// Whether packet bytes may be written
    pub fn allows_packet_write(&self) -> bool {
        matches!(self, AttachKind::Ingress)
    }

    /// Whether the redirect helper may be called
    pub fn allows_redirect(&self) -> bool {
        matches!(self, AttachKind::Ingress)
    }

    /// Inclusive range of valid return codes
    pub fn verdict_range(&self) -> (u64, u64) {
        match self {
            AttachKind::Ingress => (XDP_ABORTED, XDP_REDIRECT),
            AttachKind::Observe => (XDP_DROP, XDP_PASS),
        }
    }
}

impl fmt::Display for AttachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachKind::Ingress => f.write_str("ingress"),
            AttachKind::Observe => f.write_str("observe"),
        }
    }
}

/// A map a program declares it will use
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapBinding {
    /// Name the map is registered under
    pub name: String,
    /// Expected kind
    pub kind: MapKind,
    /// Expected key size
    pub key_size: u32,
    /// Expected value size
    pub value_size: u32,
}

impl MapBinding {
    /// Declare a map
    pub fn new(name: impl Into<String>, kind: MapKind, key_size: u32, value_size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            key_size,
            value_size,
        }
    }

    /// Declare a map with the shape of `schema`
    pub fn from_schema(name: impl Into<String>, schema: &MapSchema) -> Self {
        Self::new(name, schema.kind, schema.key_size, schema.value_size)
    }

    /// Whether `schema` has exactly the declared shape
    pub fn matches(&self, schema: &MapSchema) -> bool {
        self.kind == schema.kind
            && self.key_size == schema.key_size
            && self.value_size == schema.value_size
    }
}

/// An unverified program
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    insns: Arc<[Insn]>,
    maps: Vec<MapBinding>,
    attach: AttachKind,
}

impl Program {
    /// Create a program with no map declarations
    pub fn new(name: impl Into<String>, insns: impl Into<Arc<[Insn]>>, attach: AttachKind) -> Self {
        Self {
            name: name.into(),
            insns: insns.into(),
            maps: Vec::new(),
            attach,
        }
    }

    /// Declare a map; its index is the position in declaration order
    pub fn with_map(mut self, binding: MapBinding) -> Self {
        self.maps.push(binding);
        self
    }

    /// Declare several maps
    pub fn with_maps(mut self, bindings: impl IntoIterator<Item = MapBinding>) -> Self {
        self.maps.extend(bindings);
        self
    }

    /// Program name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instructions
    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    /// Shared instruction buffer
    pub fn insns_arc(&self) -> &Arc<[Insn]> {
        &self.insns
    }

    /// Declared maps, in index order
    pub fn maps(&self) -> &[MapBinding] {
        &self.maps
    }

    /// Attach point
    pub fn attach(&self) -> AttachKind {
        self.attach
    }

    /// Number of instruction slots
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Whether the program has no instructions
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Control-flow graph of the instructions
    pub fn cfg(&self) -> ControlFlowGraph {
        ControlFlowGraph::build(&self.insns)
    }

    /// Disassembly with default options
    pub fn disasm(&self) -> String {
        disasm_program(&self.insns, &DisasmOptions::default())
    }
}
