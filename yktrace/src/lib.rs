//! Trace representation: the ordered record of basic blocks the program
//! executed while tracing was active.
//!
//! The block tracer reports each executed block either as a concrete
//! `(function, block index)` location or as an unmappable "hole" where
//! execution passed through code for which no IR is available (e.g. an
//! external library call).

mod errors;

pub use errors::InvalidTraceError;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use ykir::BasicBlockIndex;

/// The tracing-start marker symbol.
pub const YKTRACE_START: &str = "__yktrace_start_tracing";
/// The tracing-stop marker symbol.
pub const YKTRACE_STOP: &str = "__yktrace_stop_tracing";
/// The control point symbol. Argument 1 of a call to this carries the live
/// interpreter state.
pub const NEW_CONTROL_POINT: &str = "yk_new_control_point";

/// One mappable location in a trace: a basic block within a named function of
/// the AOT module.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IrLoc {
    pub func_name: String,
    pub bb_idx: BasicBlockIndex,
}

impl IrLoc {
    pub fn new(func_name: &str, bb_idx: BasicBlockIndex) -> Self {
        Self {
            func_name: String::from(func_name),
            bb_idx,
        }
    }
}

impl Display for IrLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:bb{}", self.func_name, self.bb_idx)
    }
}

/// One entry of a trace.
///
/// A `Hole` marks a region of execution for which no IR was available. It is
/// only legal immediately after a call to an external function and is
/// consumed by the trace compiler's "expect unmappable" state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TraceLocation {
    Mapped(IrLoc),
    Hole,
}

impl TraceLocation {
    pub fn is_hole(&self) -> bool {
        matches!(self, TraceLocation::Hole)
    }
}

impl Display for TraceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceLocation::Mapped(loc) => write!(f, "{}", loc),
            TraceLocation::Hole => write!(f, "<hole>"),
        }
    }
}

/// A random-access view over a recorded trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrTrace {
    locs: Vec<TraceLocation>,
}

impl IrTrace {
    pub fn new(locs: Vec<TraceLocation>) -> Self {
        Self { locs }
    }

    /// Build a trace from the tracer's parallel arrays. A `None` function
    /// name denotes a hole; the block index of a hole entry is ignored.
    pub fn from_arrays(func_names: &[Option<&str>], bb_idxs: &[BasicBlockIndex]) -> Self {
        debug_assert_eq!(func_names.len(), bb_idxs.len());
        let locs = func_names
            .iter()
            .zip(bb_idxs.iter())
            .map(|(name, bb)| match name {
                Some(name) => TraceLocation::Mapped(IrLoc::new(name, *bb)),
                None => TraceLocation::Hole,
            })
            .collect();
        Self { locs }
    }

    /// Return the length of the trace, measured in blocks (holes included).
    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    /// Return the trace location at index `idx`.
    pub fn loc(&self, idx: usize) -> &TraceLocation {
        &self.locs[idx]
    }

    /// Return the mapped location at index `idx`.
    /// The caller must have already excluded holes.
    pub fn mapped(&self, idx: usize) -> &IrLoc {
        match &self.locs[idx] {
            TraceLocation::Mapped(loc) => loc,
            TraceLocation::Hole => panic!("expected a mapped location at trace index {}", idx),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TraceLocation> {
        self.locs.iter()
    }
}
