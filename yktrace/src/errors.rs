use std::fmt::{self, Display, Formatter};

#[derive(Debug, PartialEq, Eq)]
/// Reasons that a trace cannot be compiled.
pub enum InvalidTraceError {
    /// The trace contains no mappable blocks.
    EmptyTrace,
    /// There is no IR for a location in the trace.
    /// The string inside is the binary symbol name in which the location appears.
    NoIr(String),
    /// A block index is out of range for its function.
    BadBlockIndex(String, u32),
    /// The AOT module contains no call to the control point, or more than one.
    MissingControlPoint,
    /// An unmappable hole appeared without a preceding external call.
    /// The number inside is the trace index of the hole.
    UnexpectedHole(usize),
    /// The trace ended without a call to the tracing-stop marker.
    NoStopMarker,
    /// An operand could not be materialised in the JIT module.
    /// The string inside is the rendered operand.
    UnmappedOperand(String),
    /// An outlined callee has no entry in the function address table.
    NoAddressBinding(String),
    /// The process-wide trace index counter saturated.
    TraceIndexOverflow,
    /// An unknown stage name was passed in `YKD_PRINT_IR`.
    BadDumpStage(String),
}

impl InvalidTraceError {
    /// A helper function to create a `InvalidTraceError::NoIr`.
    pub fn no_ir(symbol_name: &str) -> Self {
        InvalidTraceError::NoIr(String::from(symbol_name))
    }
}

impl Display for InvalidTraceError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            InvalidTraceError::EmptyTrace => write!(f, "Empty trace"),
            InvalidTraceError::NoIr(symbol_name) => {
                write!(f, "No IR for location in symbol: {}", symbol_name)
            }
            InvalidTraceError::BadBlockIndex(symbol_name, bb) => {
                write!(f, "No block {} in symbol: {}", bb, symbol_name)
            }
            InvalidTraceError::MissingControlPoint => {
                write!(f, "Expected exactly one control point call in the AOT module")
            }
            InvalidTraceError::UnexpectedHole(idx) => {
                write!(f, "Unexpected unmappable block at trace index {}", idx)
            }
            InvalidTraceError::NoStopMarker => {
                write!(f, "Trace ended before the stop tracing marker")
            }
            InvalidTraceError::UnmappedOperand(op) => {
                write!(f, "don't know how to handle operand: {}", op)
            }
            InvalidTraceError::NoAddressBinding(symbol_name) => {
                write!(f, "No virtual address known for symbol: {}", symbol_name)
            }
            InvalidTraceError::TraceIndexOverflow => write!(f, "Trace index counter overflowed"),
            InvalidTraceError::BadDumpStage(stage) => {
                write!(f, "invalid parameter for YKD_PRINT_IR: '{}'", stage)
            }
        }
    }
}
