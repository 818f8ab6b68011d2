//! The trace compiler: synthesise an executable IR module from a trace.
//!
//! Given the AOT module, an ordered record of executed blocks and a table of
//! symbol addresses, `compile_trace` produces a fresh module holding a single
//! straight-line function which reproduces the behaviour observed during
//! tracing. The module is handed to the machine-code back-end for lowering;
//! the AOT module is never mutated.

#[macro_use]
extern crate lazy_static;

mod aot;
mod dump;
mod jitmod;

pub use aot::{register_aot_image, with_thread_aot_module};

use fxhash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use ykir::Module;
use yktrace::{InvalidTraceError, IrTrace};

use dump::{DebugIrPrinter, DumpStage};
use jitmod::JitModBuilder;

pub use yktrace::{NEW_CONTROL_POINT, YKTRACE_START, YKTRACE_STOP};

/// The prefix of every compiled trace's function name.
pub const TRACE_FUNC_PREFIX: &str = "__yk_compiled_trace_";

// An atomic counter used to issue compiled traces with unique names.
static NEXT_TRACE_IDX: AtomicUsize = AtomicUsize::new(0);

/// Virtual addresses for binary symbols, used to bind outlined and
/// externally-defined callees.
#[derive(Debug, Default)]
pub struct FuncAddrs {
    map: FxHashMap<String, u64>,
}

impl FuncAddrs {
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
        }
    }

    /// Build the table from the embedder's parallel arrays. Duplicate names
    /// keep the last address.
    pub fn from_arrays(names: &[&str], addrs: &[u64]) -> Self {
        debug_assert_eq!(names.len(), addrs.len());
        let mut map = FxHashMap::default();
        for (name, addr) in names.iter().zip(addrs.iter()) {
            map.insert(String::from(*name), *addr);
        }
        Self { map }
    }

    pub fn insert(&mut self, name: &str, addr: u64) {
        self.map.insert(String::from(name), addr);
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.map.get(name).copied()
    }
}

/// The product of one trace compilation. Ownership of the JIT module
/// transfers to the back-end along with the name/address bindings it must
/// install before lowering.
#[derive(Debug)]
pub struct CompiledTrace {
    pub jitmod: Module,
    pub trace_name: String,
    pub global_mappings: FxHashMap<String, u64>,
}

/// Compile a trace over `aot` into a fresh module containing one function
/// named `__yk_compiled_trace_<n>`.
pub fn compile_trace(
    aot: &Module,
    trace: &IrTrace,
    faddrs: &FuncAddrs,
) -> Result<CompiledTrace, InvalidTraceError> {
    let dip = DebugIrPrinter::from_env()?;
    dip.print_module(DumpStage::Aot, aot);

    let trace_idx = NEXT_TRACE_IDX.fetch_add(1, Ordering::Relaxed);
    if trace_idx == usize::MAX {
        return Err(InvalidTraceError::TraceIndexOverflow);
    }
    let trace_name = format!("{}{}", TRACE_FUNC_PREFIX, trace_idx);

    let out = JitModBuilder::new(aot, trace, faddrs, trace_name.clone())?.build()?;

    dip.print_module(DumpStage::JitPreOpt, &out.jitmod);
    dip.print_sbs(aot, &out.jitmod, &out.rev_map);
    // No optimisation passes run here; the post-opt stage shows the module
    // as handed to the back-end.
    dip.print_module(DumpStage::JitPostOpt, &out.jitmod);

    Ok(CompiledTrace {
        jitmod: out.jitmod,
        trace_name,
        global_mappings: out.global_mappings,
    })
}
