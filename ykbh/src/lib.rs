//! ykbh -- the "black hole": an IR evaluator.
//!
//! Executes functions of a `ykir::Module` over simulated global and stack
//! storage. The test suite uses it to run an AOT program and the compiled
//! trace over the same state and compare the observable results. It is not a
//! performance tool.

use fxhash::FxHashMap;
use ykir::{
    BasicBlockIndex, BinOp, Callee, CastOp, CmpPred, Const, FuncIndex, InstrKind, Local, Module,
    Operand, Ty,
};
use yktrace::{NEW_CONTROL_POINT, YKTRACE_START, YKTRACE_STOP};

/// A pointer value. Globals are addressed by name so that a JIT module's
/// re-declared globals alias the AOT program's storage, as they do at link
/// time in the real system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ptr {
    Null,
    Global(String),
    /// An allocation in the evaluator's slot arena.
    Slot(usize),
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Val {
    Int(i64),
    Ptr(Ptr),
    Struct(Vec<Val>),
}

impl Val {
    pub fn as_int(&self) -> i64 {
        match self {
            Val::Int(v) => *v,
            _ => panic!("expected an integer, got {:?}", self),
        }
    }

    pub fn as_ptr(&self) -> &Ptr {
        match self {
            Val::Ptr(p) => p,
            _ => panic!("expected a pointer, got {:?}", self),
        }
    }

    /// The zero value of a type.
    fn zero_of(ty: &Ty) -> Val {
        match ty {
            Ty::Int(_) => Val::Int(0),
            Ty::Ptr(..) | Ty::Func(_) => Val::Ptr(Ptr::Null),
            Ty::Struct(fields) => Val::Struct(fields.iter().map(Val::zero_of).collect()),
            Ty::Array { elem, len } => {
                Val::Struct((0..*len).map(|_| Val::zero_of(elem)).collect())
            }
            Ty::Void => panic!("zero of void"),
        }
    }
}

/// One call frame's SSA bindings.
struct Frame {
    locals: FxHashMap<Local, Val>,
}

impl Frame {
    fn new(args: Vec<Val>) -> Self {
        let mut locals = FxHashMap::default();
        for (i, arg) in args.into_iter().enumerate() {
            locals.insert(Local(i as u32), arg);
        }
        Self { locals }
    }

    fn get(&self, l: Local) -> Val {
        self.locals
            .get(&l)
            .unwrap_or_else(|| panic!("read of undefined local {}", l))
            .clone()
    }
}

pub struct Interp<'a> {
    /// The module whose functions are executed.
    m: &'a Module,
    /// Fallback for resolving declarations by name. The compiled trace's
    /// outlined calls resolve back into the AOT module this way.
    resolve: Option<&'a Module>,
    /// Global storage, keyed by symbol name.
    pub globals: FxHashMap<String, Val>,
    /// The stack-slot arena backing allocas and driver-created slots.
    slots: Vec<Val>,
}

impl<'a> Interp<'a> {
    pub fn new(m: &'a Module) -> Self {
        let mut interp = Self {
            m,
            resolve: None,
            globals: FxHashMap::default(),
            slots: Vec::new(),
        };
        interp.seed_globals(m);
        interp
    }

    /// An interpreter for `m` whose unresolved callees and globals fall back
    /// to `resolve`.
    pub fn with_resolver(m: &'a Module, resolve: &'a Module) -> Self {
        let mut interp = Self {
            m,
            resolve: Some(resolve),
            globals: FxHashMap::default(),
            slots: Vec::new(),
        };
        interp.seed_globals(resolve);
        interp.seed_globals(m);
        interp
    }

    fn seed_globals(&mut self, m: &'a Module) {
        for g in &m.globals {
            if let Some(init) = &g.init {
                let v = self.const_val(m, init);
                self.globals.insert(g.name.clone(), v);
            } else {
                self.globals
                    .entry(g.name.clone())
                    .or_insert_with(|| Val::zero_of(&g.ty));
            }
        }
    }

    /// Create a stack slot the driver can point the live-vars aggregate at.
    pub fn alloc_slot(&mut self, v: Val) -> Ptr {
        self.slots.push(v);
        Ptr::Slot(self.slots.len() - 1)
    }

    pub fn read_ptr(&self, p: &Ptr) -> Val {
        match p {
            Ptr::Null => panic!("read through null pointer"),
            Ptr::Global(name) => self.globals[name].clone(),
            Ptr::Slot(i) => self.slots[*i].clone(),
        }
    }

    fn write_ptr(&mut self, p: &Ptr, v: Val) {
        match p {
            Ptr::Null => panic!("write through null pointer"),
            Ptr::Global(name) => {
                self.globals.insert(name.clone(), v);
            }
            Ptr::Slot(i) => self.slots[*i] = v,
        }
    }

    /// Execute the named function. Returns its value unless it is void.
    pub fn run(&mut self, fname: &str, args: Vec<Val>) -> Option<Val> {
        let fidx = self
            .m
            .func_idx(fname)
            .unwrap_or_else(|| panic!("no function named {}", fname));
        self.exec_func(self.m, fidx, args)
    }

    fn exec_func(&mut self, m: &'a Module, fidx: FuncIndex, args: Vec<Val>) -> Option<Val> {
        let func = m.func(fidx);
        debug_assert!(!func.is_declaration());
        let mut frame = Frame::new(args);
        let mut cur: BasicBlockIndex = 0;
        let mut prev: Option<BasicBlockIndex> = None;

        loop {
            let bb = &func.blocks[cur as usize];
            let mut next: Option<BasicBlockIndex> = None;
            for inst in &bb.instrs {
                match &inst.kind {
                    InstrKind::Alloca { ty, .. } => {
                        let p = self.alloc_slot(Val::zero_of(ty));
                        frame.locals.insert(inst.dest.unwrap(), Val::Ptr(p));
                    }
                    InstrKind::Load { ptr } => {
                        let p = self.eval(m, &frame, ptr);
                        let v = self.read_ptr(p.as_ptr());
                        frame.locals.insert(inst.dest.unwrap(), v);
                    }
                    InstrKind::Store { val, ptr } => {
                        let v = self.eval(m, &frame, val);
                        let p = self.eval(m, &frame, ptr);
                        self.write_ptr(p.as_ptr(), v);
                    }
                    InstrKind::BinOp { op, a, b } => {
                        let a = self.eval(m, &frame, a).as_int();
                        let b = self.eval(m, &frame, b).as_int();
                        frame
                            .locals
                            .insert(inst.dest.unwrap(), Val::Int(eval_binop(*op, a, b)));
                    }
                    InstrKind::Icmp { pred, a, b } => {
                        let a = self.eval(m, &frame, a).as_int();
                        let b = self.eval(m, &frame, b).as_int();
                        let r = eval_icmp(*pred, a, b);
                        frame.locals.insert(inst.dest.unwrap(), Val::Int(r as i64));
                    }
                    InstrKind::Cast { op, val } => {
                        let v = self.eval(m, &frame, val);
                        let r = match op {
                            CastOp::Trunc => match &inst.ty {
                                Ty::Int(bits) if *bits < 64 => {
                                    Val::Int(v.as_int() & ((1i64 << bits) - 1))
                                }
                                _ => v,
                            },
                            _ => v,
                        };
                        frame.locals.insert(inst.dest.unwrap(), r);
                    }
                    InstrKind::PtrAdd { ptr, .. } => {
                        // Offsets are not modelled; a ptradd designates its
                        // base allocation.
                        let p = self.eval(m, &frame, ptr);
                        frame.locals.insert(inst.dest.unwrap(), p);
                    }
                    InstrKind::InsertValue { agg, val, index } => {
                        let mut a = self.eval(m, &frame, agg);
                        let v = self.eval(m, &frame, val);
                        match &mut a {
                            Val::Struct(fields) => fields[*index as usize] = v,
                            _ => panic!("insertvalue into a non-aggregate"),
                        }
                        frame.locals.insert(inst.dest.unwrap(), a);
                    }
                    InstrKind::ExtractValue { agg, index } => {
                        let a = self.eval(m, &frame, agg);
                        let v = match a {
                            Val::Struct(fields) => fields[*index as usize].clone(),
                            _ => panic!("extractvalue from a non-aggregate"),
                        };
                        frame.locals.insert(inst.dest.unwrap(), v);
                    }
                    InstrKind::Phi { incoming } => {
                        let p = prev.expect("phi in an entry block");
                        let (_, op) = incoming
                            .iter()
                            .find(|(bb, _)| *bb == p)
                            .expect("phi has no incoming value for predecessor");
                        let v = self.eval(m, &frame, op);
                        frame.locals.insert(inst.dest.unwrap(), v);
                    }
                    InstrKind::Call { callee, args } => {
                        let argvals: Vec<Val> =
                            args.iter().map(|a| self.eval(m, &frame, a)).collect();
                        let ret = self.exec_call(m, callee, argvals);
                        if let Some(dest) = inst.dest {
                            frame.locals.insert(
                                dest,
                                ret.expect("non-void call returned nothing"),
                            );
                        }
                    }
                    InstrKind::Br { target } => {
                        next = Some(*target);
                        break;
                    }
                    InstrKind::CondBr {
                        cond,
                        on_true,
                        on_false,
                    } => {
                        let c = self.eval(m, &frame, cond).as_int();
                        next = Some(if c != 0 { *on_true } else { *on_false });
                        break;
                    }
                    InstrKind::Switch {
                        val,
                        default,
                        cases,
                    } => {
                        let v = self.eval(m, &frame, val).as_int();
                        let target = cases
                            .iter()
                            .find(|(c, _)| c.val() as i64 == v)
                            .map(|(_, bb)| *bb)
                            .unwrap_or(*default);
                        next = Some(target);
                        break;
                    }
                    InstrKind::IndirectBr { .. } => {
                        panic!("indirect branches cannot be evaluated")
                    }
                    InstrKind::Ret { val } => {
                        return val.as_ref().map(|v| self.eval(m, &frame, v));
                    }
                    InstrKind::DebugIntrinsic { .. } => (),
                }
            }
            match next {
                Some(n) => {
                    prev = Some(cur);
                    cur = n;
                }
                None => panic!("fell off the end of bb{}", cur),
            }
        }
    }

    fn exec_call(&mut self, m: &'a Module, callee: &Callee, args: Vec<Val>) -> Option<Val> {
        let fidx = match callee {
            Callee::Func(fidx) => *fidx,
            Callee::Indirect(_) => panic!("indirect calls cannot be evaluated"),
            Callee::Asm { .. } => panic!("inline asm cannot be evaluated"),
        };
        let func = m.func(fidx);
        if !func.is_declaration() {
            return self.exec_func(m, fidx, args);
        }
        // Well-known markers have fixed semantics; everything else must
        // resolve to a definition somewhere.
        match func.name.as_str() {
            NEW_CONTROL_POINT => Some(args.into_iter().nth(1).expect("control point without live vars")),
            YKTRACE_START | YKTRACE_STOP => None,
            name => {
                let (rm, rf) = self
                    .resolve_decl(name)
                    .unwrap_or_else(|| panic!("call to external function {}", name));
                self.exec_func(rm, rf, args)
            }
        }
    }

    fn resolve_decl(&self, name: &str) -> Option<(&'a Module, FuncIndex)> {
        for m in std::iter::once(self.m).chain(self.resolve.into_iter()) {
            if let Some(fidx) = m.func_idx(name) {
                if !m.func(fidx).is_declaration() {
                    return Some((m, fidx));
                }
            }
        }
        None
    }

    fn eval(&self, m: &'a Module, frame: &Frame, op: &Operand) -> Val {
        match op {
            Operand::Local(l) => frame.get(*l),
            Operand::Const(c) => self.const_val(m, c),
            Operand::Global(g) => Val::Ptr(Ptr::Global(m.global(*g).name.clone())),
            Operand::Func(_) => panic!("function pointers cannot be evaluated"),
        }
    }

    fn const_val(&self, m: &'a Module, c: &Const) -> Val {
        match c {
            Const::Int { bits, .. } => Val::Int(bits.val() as i64),
            Const::Null(_) => Val::Ptr(Ptr::Null),
            Const::ZeroAggregate(ty) => Val::zero_of(ty),
            Const::Struct(_, fields) => {
                Val::Struct(fields.iter().map(|f| self.const_val(m, f)).collect())
            }
            Const::Str(bytes) => Val::Struct(
                bytes.iter().map(|b| Val::Int(*b as i64)).collect(),
            ),
            Const::GlobalAddr(g) => Val::Ptr(Ptr::Global(m.global(*g).name.clone())),
            Const::Expr(_) => panic!("constant expressions cannot be evaluated"),
        }
    }
}

fn eval_binop(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        BinOp::BitXor => a ^ b,
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => a.wrapping_shr(b as u32),
    }
}

fn eval_icmp(pred: CmpPred, a: i64, b: i64) -> bool {
    match pred {
        CmpPred::Eq => a == b,
        CmpPred::Ne => a != b,
        CmpPred::SLt => a < b,
        CmpPred::SLe => a <= b,
        CmpPred::SGt => a > b,
        CmpPred::SGe => a >= b,
        CmpPred::ULt => (a as u64) < (b as u64),
        CmpPred::ULe => (a as u64) <= (b as u64),
        CmpPred::UGt => (a as u64) > (b as u64),
        CmpPred::UGe => (a as u64) >= (b as u64),
    }
}
