//! Types for the SSA intermediate representation shared by the AOT and JIT
//! sides of the tracer.
//!
//! An AOT module is serialised into the binary at compile time and
//! deserialised back into these types at runtime. The trace compiler reads
//! one `Module` (the AOT module, never mutated) and builds another (the JIT
//! module) containing a single straight-line function.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Write as _};

pub type BasicBlockIndex = u32;
pub type InstrIndex = usize;
pub type FuncIndex = u32;
pub type GlobalIndex = u32;
pub type LocalIndex = u32;

/// rmp-serde serialisable 128-bit numeric type, to work around:
/// https://github.com/3Hren/msgpack-rust/issues/169
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Hash)]
pub struct SerU128 {
    hi: u64,
    lo: u64,
}

impl SerU128 {
    pub fn new(val: u128) -> Self {
        Self {
            hi: (val >> 64) as u64,
            lo: val as u64,
        }
    }

    pub fn val(&self) -> u128 {
        (self.hi as u128) << 64 | self.lo as u128
    }
}

impl Display for SerU128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.val())
    }
}

/// A first-class type.
///
/// Types are structural: two types are the same type if and only if they
/// compare equal, so the AOT and JIT modules "share a type context" for free.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Hash)]
pub enum Ty {
    Void,
    /// An integer of the given bit width.
    Int(u32),
    /// A pointer to the given type, in the given address space.
    Ptr(Box<Ty>, u32),
    /// A structure with the given field types.
    Struct(Vec<Ty>),
    /// A fixed-size array.
    Array { elem: Box<Ty>, len: u64 },
    /// A function signature.
    Func(FuncTy),
}

impl Ty {
    /// Shorthand for a pointer to `self` in address space zero.
    pub fn ptr_to(self) -> Ty {
        Ty::Ptr(Box::new(self), 0)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Ty::Ptr(..))
    }

    /// The type pointed to, if this is a pointer type.
    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Ptr(p, _) => Some(p),
            _ => None,
        }
    }
}

impl Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int(bits) => write!(f, "i{}", bits),
            Ty::Ptr(t, 0) => write!(f, "*{}", t),
            Ty::Ptr(t, asp) => write!(f, "*as{} {}", asp, t),
            Ty::Struct(fields) => {
                let fs = fields
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "{{{}}}", fs)
            }
            Ty::Array { elem, len } => write!(f, "[{}; {}]", elem, len),
            Ty::Func(fty) => write!(f, "{}", fty),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Hash)]
pub struct FuncTy {
    pub params: Vec<Ty>,
    pub ret: Box<Ty>,
    pub is_vararg: bool,
}

impl FuncTy {
    pub fn new(params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            params,
            ret: Box::new(ret),
            is_vararg: false,
        }
    }

    pub fn new_vararg(params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            params,
            ret: Box::new(ret),
            is_vararg: true,
        }
    }
}

impl Display for FuncTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ps = self
            .params
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<String>>();
        if self.is_vararg {
            ps.push(String::from("..."));
        }
        write!(f, "fn({}) -> {}", ps.join(", "), self.ret)
    }
}

/// A compile-time constant.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Const {
    /// An integer constant. The bits are zero-extended.
    Int { ty: Ty, bits: SerU128 },
    /// A typed null pointer.
    Null(Ty),
    /// The zero initialiser of an aggregate type.
    ZeroAggregate(Ty),
    /// A constant struct.
    Struct(Ty, Vec<Const>),
    /// A byte string (including any nul terminator).
    Str(Vec<u8>),
    /// The address of a global variable.
    GlobalAddr(GlobalIndex),
    /// A constant expression over other constants.
    Expr(ConstExpr),
}

impl Const {
    pub fn int(ty: Ty, val: u64) -> Self {
        Const::Int {
            ty,
            bits: SerU128::new(val as u128),
        }
    }

    pub fn i32(val: i32) -> Self {
        Const::Int {
            ty: Ty::Int(32),
            bits: SerU128::new(val as u32 as u128),
        }
    }

    /// The type of the constant. `GlobalAddr` needs the module to recover the
    /// pointee type.
    pub fn ty(&self, m: &Module) -> Ty {
        match self {
            Const::Int { ty, .. } => ty.clone(),
            Const::Null(ty) => ty.clone(),
            Const::ZeroAggregate(ty) => ty.clone(),
            Const::Struct(ty, _) => ty.clone(),
            Const::Str(bytes) => Ty::Array {
                elem: Box::new(Ty::Int(8)),
                len: bytes.len() as u64,
            },
            Const::GlobalAddr(gidx) => m.global(*gidx).ty.clone().ptr_to(),
            Const::Expr(ce) => ce.ty.clone(),
        }
    }
}

impl Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int { ty, bits } => write!(f, "{}{}", bits, ty),
            Const::Null(_) => write!(f, "null"),
            Const::ZeroAggregate(ty) => write!(f, "zeroinit {}", ty),
            Const::Struct(_, fields) => {
                let fs = fields
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "{{{}}}", fs)
            }
            Const::Str(bytes) => {
                write!(f, "\"")?;
                for b in bytes {
                    if b.is_ascii_graphic() || *b == b' ' {
                        f.write_char(*b as char)?;
                    } else {
                        write!(f, "\\{:02x}", b)?;
                    }
                }
                write!(f, "\"")
            }
            Const::GlobalAddr(gidx) => write!(f, "@g{}", gidx),
            Const::Expr(ce) => write!(f, "{}", ce),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct ConstExpr {
    pub op: ConstOp,
    pub operands: Vec<Const>,
    pub ty: Ty,
}

impl Display for ConstExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = self
            .operands
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "{}({})", self.op, os)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum ConstOp {
    PtrAdd,
    IntToPtr,
    PtrToInt,
}

impl Display for ConstOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstOp::PtrAdd => "ptradd",
            ConstOp::IntToPtr => "inttoptr",
            ConstOp::PtrToInt => "ptrtoint",
        };
        write!(f, "{}", s)
    }
}

/// An SSA value id, unique within one function.
///
/// Function parameters occupy `$0..$n`; instruction results are assigned by
/// whoever builds the function.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Local(pub LocalIndex);

impl Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// An instruction operand.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Operand {
    /// An SSA value of the containing function.
    Local(Local),
    /// A constant.
    Const(Const),
    /// The address of a global variable of the containing module.
    Global(GlobalIndex),
    /// A function of the containing module.
    Func(FuncIndex),
}

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Local(l) => write!(f, "{}", l),
            Operand::Const(c) => write!(f, "{}", c),
            Operand::Global(gidx) => write!(f, "@g{}", gidx),
            Operand::Func(fidx) => write!(f, "@f{}", fidx),
        }
    }
}

impl From<Local> for Operand {
    fn from(l: Local) -> Self {
        Operand::Local(l)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

/// A call target.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Callee {
    /// A statically-known function of the containing module.
    Func(FuncIndex),
    /// A call through a pointer; the target is not statically known.
    Indirect(Operand),
    /// An inline assembly fragment.
    Asm { asm: String, constraints: String },
}

/// Binary operations.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitXor,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

impl Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::BitXor => "bit_xor",
            BinOp::BitAnd => "bit_and",
            BinOp::BitOr => "bit_or",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
        };
        write!(f, "{}", s)
    }
}

/// Integer comparison predicates.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum CmpPred {
    Eq,
    Ne,
    SLt,
    SLe,
    SGt,
    SGe,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl Display for CmpPred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::SLt => "slt",
            CmpPred::SLe => "sle",
            CmpPred::SGt => "sgt",
            CmpPred::SGe => "sge",
            CmpPred::ULt => "ult",
            CmpPred::ULe => "ule",
            CmpPred::UGt => "ugt",
            CmpPred::UGe => "uge",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    Bitcast,
    PtrToInt,
    IntToPtr,
}

impl Display for CastOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::Trunc => "trunc",
            CastOp::Bitcast => "bitcast",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
        };
        write!(f, "{}", s)
    }
}

/// A source location attached to an instruction.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
}

impl Display for DebugLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum InstrKind {
    Alloca {
        ty: Ty,
        count: u64,
    },
    Load {
        ptr: Operand,
    },
    Store {
        val: Operand,
        ptr: Operand,
    },
    BinOp {
        op: BinOp,
        a: Operand,
        b: Operand,
    },
    Icmp {
        pred: CmpPred,
        a: Operand,
        b: Operand,
    },
    Cast {
        op: CastOp,
        val: Operand,
    },
    /// Pointer arithmetic: `ptr` offset by each element of `offs` in turn.
    PtrAdd {
        ptr: Operand,
        offs: Vec<Operand>,
    },
    InsertValue {
        agg: Operand,
        val: Operand,
        index: u32,
    },
    ExtractValue {
        agg: Operand,
        index: u32,
    },
    Phi {
        incoming: Vec<(BasicBlockIndex, Operand)>,
    },
    Call {
        callee: Callee,
        args: Vec<Operand>,
    },
    Br {
        target: BasicBlockIndex,
    },
    CondBr {
        cond: Operand,
        on_true: BasicBlockIndex,
        on_false: BasicBlockIndex,
    },
    Switch {
        val: Operand,
        default: BasicBlockIndex,
        cases: Vec<(SerU128, BasicBlockIndex)>,
    },
    IndirectBr {
        addr: Operand,
        possible: Vec<BasicBlockIndex>,
    },
    Ret {
        val: Option<Operand>,
    },
    /// A pseudo-call carrying debugging information only.
    DebugIntrinsic {
        msg: String,
    },
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Instruction {
    /// The SSA value this instruction defines, if it produces one.
    pub dest: Option<Local>,
    /// The type of the produced value (`Void` if none).
    pub ty: Ty,
    pub kind: InstrKind,
    pub dloc: Option<DebugLoc>,
}

impl Instruction {
    pub fn is_debug_intrinsic(&self) -> bool {
        matches!(self.kind, InstrKind::DebugIntrinsic { .. })
    }

    /// References to every operand of the instruction, in a fixed order.
    pub fn operands(&self) -> Vec<&Operand> {
        let mut ops = Vec::new();
        match &self.kind {
            InstrKind::Alloca { .. } => (),
            InstrKind::Load { ptr } => ops.push(ptr),
            InstrKind::Store { val, ptr } => {
                ops.push(val);
                ops.push(ptr);
            }
            InstrKind::BinOp { a, b, .. } | InstrKind::Icmp { a, b, .. } => {
                ops.push(a);
                ops.push(b);
            }
            InstrKind::Cast { val, .. } => ops.push(val),
            InstrKind::PtrAdd { ptr, offs } => {
                ops.push(ptr);
                ops.extend(offs.iter());
            }
            InstrKind::InsertValue { agg, val, .. } => {
                ops.push(agg);
                ops.push(val);
            }
            InstrKind::ExtractValue { agg, .. } => ops.push(agg),
            InstrKind::Phi { incoming } => ops.extend(incoming.iter().map(|(_, o)| o)),
            InstrKind::Call { callee, args } => {
                if let Callee::Indirect(target) = callee {
                    ops.push(target);
                }
                ops.extend(args.iter());
            }
            InstrKind::Br { .. } => (),
            InstrKind::CondBr { cond, .. } => ops.push(cond),
            InstrKind::Switch { val, .. } => ops.push(val),
            InstrKind::IndirectBr { addr, .. } => ops.push(addr),
            InstrKind::Ret { val } => ops.extend(val.iter()),
            InstrKind::DebugIntrinsic { .. } => (),
        }
        ops
    }

    /// Mutable references to every operand, in the same order as
    /// `operands()`.
    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        let mut ops = Vec::new();
        match &mut self.kind {
            InstrKind::Alloca { .. } => (),
            InstrKind::Load { ptr } => ops.push(ptr),
            InstrKind::Store { val, ptr } => {
                ops.push(val);
                ops.push(ptr);
            }
            InstrKind::BinOp { a, b, .. } | InstrKind::Icmp { a, b, .. } => {
                ops.push(a);
                ops.push(b);
            }
            InstrKind::Cast { val, .. } => ops.push(val),
            InstrKind::PtrAdd { ptr, offs } => {
                ops.push(ptr);
                ops.extend(offs.iter_mut());
            }
            InstrKind::InsertValue { agg, val, .. } => {
                ops.push(agg);
                ops.push(val);
            }
            InstrKind::ExtractValue { agg, .. } => ops.push(agg),
            InstrKind::Phi { incoming } => ops.extend(incoming.iter_mut().map(|(_, o)| o)),
            InstrKind::Call { callee, args } => {
                if let Callee::Indirect(target) = callee {
                    ops.push(target);
                }
                ops.extend(args.iter_mut());
            }
            InstrKind::Br { .. } => (),
            InstrKind::CondBr { cond, .. } => ops.push(cond),
            InstrKind::Switch { val, .. } => ops.push(val),
            InstrKind::IndirectBr { addr, .. } => ops.push(addr),
            InstrKind::Ret { val } => ops.extend(val.iter_mut()),
            InstrKind::DebugIntrinsic { .. } => (),
        }
        ops
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct BasicBlock {
    pub instrs: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(instrs: Vec<Instruction>) -> Self {
        Self { instrs }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ty: FuncTy,
    /// Internal linkage. External otherwise.
    pub internal: bool,
    /// Empty for declarations.
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn num_params(&self) -> usize {
        self.ty.params.len()
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    /// The type of the value stored in the global (not the pointer type).
    pub ty: Ty,
    pub is_const: bool,
    pub internal: bool,
    pub tls: bool,
    pub addr_space: u32,
    pub init: Option<Const>,
    /// Attributes carried over verbatim (alignment, sections).
    pub attrs: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Module {
    pub name: String,
    pub funcs: Vec<Function>,
    pub globals: Vec<GlobalVar>,
    /// Names of the compilation units this module was built from.
    pub compile_units: Vec<String>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            funcs: Vec::new(),
            globals: Vec::new(),
            compile_units: Vec::new(),
        }
    }

    pub fn func_idx(&self, name: &str) -> Option<FuncIndex> {
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(|p| p as FuncIndex)
    }

    pub fn func(&self, idx: FuncIndex) -> &Function {
        &self.funcs[idx as usize]
    }

    pub fn global(&self, idx: GlobalIndex) -> &GlobalVar {
        &self.globals[idx as usize]
    }

    pub fn block(&self, fidx: FuncIndex, bbidx: BasicBlockIndex) -> Option<&BasicBlock> {
        self.funcs
            .get(fidx as usize)
            .and_then(|f| f.blocks.get(bbidx as usize))
    }

    /// Render one operand with module-level names substituted for indices.
    pub fn display_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Local(l) => l.to_string(),
            Operand::Const(c) => self.display_const(c),
            Operand::Global(gidx) => format!("@{}", self.global(*gidx).name),
            Operand::Func(fidx) => format!("@{}", self.func(*fidx).name),
        }
    }

    pub fn display_const(&self, c: &Const) -> String {
        match c {
            Const::GlobalAddr(gidx) => format!("@{}", self.global(*gidx).name),
            Const::Expr(ce) => {
                let os = ce
                    .operands
                    .iter()
                    .map(|o| self.display_const(o))
                    .collect::<Vec<String>>()
                    .join(", ");
                format!("{}({})", ce.op, os)
            }
            Const::Struct(_, fields) => {
                let fs = fields
                    .iter()
                    .map(|o| self.display_const(o))
                    .collect::<Vec<String>>()
                    .join(", ");
                format!("{{{}}}", fs)
            }
            _ => c.to_string(),
        }
    }

    /// Render one instruction with module-level names substituted for
    /// indices. Used for IR dumps and the side-by-side trace view.
    pub fn display_instr(&self, inst: &Instruction) -> String {
        let rhs = match &inst.kind {
            InstrKind::Alloca { ty, count } => format!("alloca {}, {}", ty, count),
            InstrKind::Load { ptr } => format!("load {}", self.display_operand(ptr)),
            InstrKind::Store { val, ptr } => format!(
                "store {}, {}",
                self.display_operand(val),
                self.display_operand(ptr)
            ),
            InstrKind::BinOp { op, a, b } => format!(
                "{} {}, {}",
                op,
                self.display_operand(a),
                self.display_operand(b)
            ),
            InstrKind::Icmp { pred, a, b } => format!(
                "icmp {} {}, {}",
                pred,
                self.display_operand(a),
                self.display_operand(b)
            ),
            InstrKind::Cast { op, val } => format!("cast {} {}", op, self.display_operand(val)),
            InstrKind::PtrAdd { ptr, offs } => format!(
                "ptradd {}, [{}]",
                self.display_operand(ptr),
                offs.iter()
                    .map(|o| self.display_operand(o))
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            InstrKind::InsertValue { agg, val, index } => format!(
                "insertvalue {}, {}, {}",
                self.display_operand(agg),
                self.display_operand(val),
                index
            ),
            InstrKind::ExtractValue { agg, index } => {
                format!("extractvalue {}, {}", self.display_operand(agg), index)
            }
            InstrKind::Phi { incoming } => {
                let inc = incoming
                    .iter()
                    .map(|(bb, o)| format!("[bb{}: {}]", bb, self.display_operand(o)))
                    .collect::<Vec<String>>()
                    .join(", ");
                format!("phi {}", inc)
            }
            InstrKind::Call { callee, args } => {
                let args_s = args
                    .iter()
                    .map(|a| self.display_operand(a))
                    .collect::<Vec<String>>()
                    .join(", ");
                match callee {
                    Callee::Func(fidx) => {
                        format!("call @{}({})", self.func(*fidx).name, args_s)
                    }
                    Callee::Indirect(target) => {
                        format!("icall {}({})", self.display_operand(target), args_s)
                    }
                    Callee::Asm { asm, .. } => format!("call asm(\"{}\")({})", asm, args_s),
                }
            }
            InstrKind::Br { target } => format!("br bb{}", target),
            InstrKind::CondBr {
                cond,
                on_true,
                on_false,
            } => format!(
                "condbr {}, bb{}, bb{}",
                self.display_operand(cond),
                on_true,
                on_false
            ),
            InstrKind::Switch {
                val,
                default,
                cases,
            } => format!(
                "switch {}, bb{}, [{}]",
                self.display_operand(val),
                default,
                cases
                    .iter()
                    .map(|(v, bb)| format!("{}: bb{}", v, bb))
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            InstrKind::IndirectBr { addr, possible } => format!(
                "indirectbr {}, [{}]",
                self.display_operand(addr),
                possible
                    .iter()
                    .map(|bb| format!("bb{}", bb))
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            InstrKind::Ret { val } => match val {
                Some(v) => format!("ret {}", self.display_operand(v)),
                None => String::from("ret"),
            },
            InstrKind::DebugIntrinsic { msg } => format!("debug \"{}\"", msg),
        };
        match inst.dest {
            Some(d) => format!("{}: {} = {}", d, inst.ty, rhs),
            None => rhs,
        }
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for g in &self.globals {
            let kind = if g.is_const { "const" } else { "global" };
            write!(f, "{} @{}: {}", kind, g.name, g.ty)?;
            if let Some(init) = &g.init {
                write!(f, " = {}", self.display_const(init))?;
            }
            writeln!(f)?;
        }
        for func in &self.funcs {
            if func.is_declaration() {
                writeln!(f, "declare @{}: {}", func.name, func.ty)?;
                continue;
            }
            let params = func
                .ty
                .params
                .iter()
                .enumerate()
                .map(|(i, t)| format!("${}: {}", i, t))
                .collect::<Vec<String>>()
                .join(", ");
            let link = if func.internal { "internal " } else { "" };
            writeln!(
                f,
                "func {}@{}({}) -> {} {{",
                link, func.name, params, func.ty.ret
            )?;
            for (bbidx, bb) in func.blocks.iter().enumerate() {
                writeln!(f, "  bb{}:", bbidx)?;
                for inst in &bb.instrs {
                    writeln!(f, "    {}", self.display_instr(inst))?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

/// The top-level pack type.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub enum Pack {
    Module(Module),
}
