//! Environment-variable-gated IR dumps.
//!
//! `YKD_PRINT_IR` takes a comma-separated list of stages to dump to stderr.
//! Each dump is bracketed by `--- Begin <stage> ---` / `--- End <stage> ---`
//! lines so tests can anchor matches to a specific stage.

use std::io::{self, Write};
use ykir::{BasicBlockIndex, DebugLoc, FuncIndex, InstrIndex, Module};
use yktrace::InvalidTraceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DumpStage {
    Aot,
    JitPreOpt,
    /// The side-by-side view pairing each cloned instruction with the AOT
    /// instruction it came from. Intended for debugging the compiler itself.
    JitPreOptSbs,
    JitPostOpt,
}

impl DumpStage {
    fn as_str(self) -> &'static str {
        match self {
            DumpStage::Aot => "aot",
            DumpStage::JitPreOpt => "jit-pre-opt",
            DumpStage::JitPreOptSbs => "jit-pre-opt-sbs",
            DumpStage::JitPostOpt => "jit-post-opt",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "aot" => Some(DumpStage::Aot),
            "jit-pre-opt" => Some(DumpStage::JitPreOpt),
            "jit-pre-opt-sbs" => Some(DumpStage::JitPreOptSbs),
            "jit-post-opt" => Some(DumpStage::JitPostOpt),
            _ => None,
        }
    }
}

pub(crate) struct DebugIrPrinter {
    to_print: Vec<DumpStage>,
}

impl DebugIrPrinter {
    /// Parse `YKD_PRINT_IR`. An unknown stage name is a hard error.
    pub(crate) fn from_env() -> Result<Self, InvalidTraceError> {
        match std::env::var("YKD_PRINT_IR") {
            Ok(val) => Self::from_str(&val),
            Err(_) => Ok(Self {
                to_print: Vec::new(),
            }),
        }
    }

    fn from_str(val: &str) -> Result<Self, InvalidTraceError> {
        let mut to_print = Vec::new();
        for tok in val.split(',').filter(|t| !t.is_empty()) {
            match DumpStage::from_str(tok) {
                Some(stage) => to_print.push(stage),
                None => return Err(InvalidTraceError::BadDumpStage(String::from(tok))),
            }
        }
        Ok(Self { to_print })
    }

    fn enabled(&self, stage: DumpStage) -> bool {
        self.to_print.contains(&stage)
    }

    pub(crate) fn print_module(&self, stage: DumpStage, m: &Module) {
        if self.enabled(stage) {
            let stderr = io::stderr();
            let mut lock = stderr.lock();
            write_module(&mut lock, stage, m).ok();
        }
    }

    pub(crate) fn print_sbs(
        &self,
        aot: &Module,
        jitmod: &Module,
        rev_map: &[Option<(FuncIndex, BasicBlockIndex, InstrIndex)>],
    ) {
        if self.enabled(DumpStage::JitPreOptSbs) {
            let stderr = io::stderr();
            let mut lock = stderr.lock();
            write_sbs(&mut lock, aot, jitmod, rev_map).ok();
        }
    }
}

pub(crate) fn write_module(w: &mut dyn Write, stage: DumpStage, m: &Module) -> io::Result<()> {
    writeln!(w, "--- Begin {} ---", stage.as_str())?;
    write!(w, "{}", m)?;
    writeln!(w, "--- End {} ---", stage.as_str())
}

/// Print the compiled trace's instructions side-by-side with the AOT
/// instructions they were cloned from. A function-scope header is printed
/// whenever the AOT function changes and a source-location header whenever
/// the debug location changes.
pub(crate) fn write_sbs(
    w: &mut dyn Write,
    aot: &Module,
    jitmod: &Module,
    rev_map: &[Option<(FuncIndex, BasicBlockIndex, InstrIndex)>],
) -> io::Result<()> {
    let jit_func = &jitmod.funcs[0];
    let instrs: Vec<_> = jit_func
        .blocks
        .iter()
        .flat_map(|bb| bb.instrs.iter())
        .collect();

    let jit_lines: Vec<String> = instrs.iter().map(|i| jitmod.display_instr(i)).collect();
    let header = "Trace";
    let longest = jit_lines
        .iter()
        .map(|l| l.len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);

    writeln!(w, "--- Begin jit-pre-opt-sbs ---")?;
    writeln!(w, "{}{}  | AOT", header, " ".repeat(longest - header.len()))?;

    let mut last_func: Option<FuncIndex> = None;
    let mut last_dloc: Option<DebugLoc> = None;
    for (pos, inst) in instrs.iter().enumerate() {
        let jit_line = &jit_lines[pos];
        let site = rev_map.get(pos).copied().flatten();
        let (fidx, bbidx, iidx) = match site {
            Some(site) => site,
            None => {
                // Not cloned from the AOT module; only the JIT column.
                writeln!(w, "{}", jit_line)?;
                continue;
            }
        };
        if last_func != Some(fidx) {
            writeln!(w, "# {}()", aot.func(fidx).name)?;
            last_func = Some(fidx);
        }
        if inst.dloc != last_dloc {
            if let Some(dloc) = inst.dloc {
                writeln!(w, "# {}", dloc)?;
            }
            last_dloc = inst.dloc;
        }
        let aot_inst = &aot.funcs[fidx as usize].blocks[bbidx as usize].instrs[iidx];
        let pad = " ".repeat(longest - jit_line.len());
        writeln!(w, "{}{}  |  {}", jit_line, pad, aot.display_instr(aot_inst))?;
    }
    writeln!(w, "--- End jit-pre-opt-sbs ---")
}
