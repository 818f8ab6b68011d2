//! Programmatic construction of IR modules.
//!
//! The AOT side of the pipeline normally emits modules directly; the builders
//! here exist so that tests (and tools) can synthesise small whole-program
//! modules without hand-writing the data structures.

use crate::types::{
    BasicBlock, BasicBlockIndex, BinOp, Callee, CastOp, CmpPred, Const, DebugLoc, FuncIndex,
    FuncTy, Function, GlobalIndex, GlobalVar, Instruction, InstrKind, Local, Module, Operand,
    SerU128, Ty,
};

pub struct ModuleBuilder {
    m: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            m: Module::new(name),
        }
    }

    /// Add a global variable definition.
    pub fn global(&mut self, name: &str, ty: Ty, init: Option<Const>) -> GlobalIndex {
        self.add_global(name, ty, false, init)
    }

    /// Add a constant global definition.
    pub fn const_global(&mut self, name: &str, ty: Ty, init: Const) -> GlobalIndex {
        self.add_global(name, ty, true, Some(init))
    }

    fn add_global(&mut self, name: &str, ty: Ty, is_const: bool, init: Option<Const>) -> GlobalIndex {
        let gidx = self.m.globals.len() as GlobalIndex;
        self.m.globals.push(GlobalVar {
            name: String::from(name),
            ty,
            is_const,
            internal: false,
            tls: false,
            addr_space: 0,
            init,
            attrs: Vec::new(),
        });
        gidx
    }

    /// Add a function declaration (no body).
    pub fn declare_func(&mut self, name: &str, ty: FuncTy) -> FuncIndex {
        let fidx = self.m.funcs.len() as FuncIndex;
        self.m.funcs.push(Function {
            name: String::from(name),
            ty,
            internal: false,
            blocks: Vec::new(),
        });
        fidx
    }

    /// Start defining a function. The entry block is created and selected.
    pub fn func(&mut self, name: &str, ty: FuncTy) -> FuncBuilder<'_> {
        let next_local = ty.params.len() as u32;
        let fidx = self.declare_func(name, ty);
        self.m.funcs[fidx as usize]
            .blocks
            .push(BasicBlock::new(Vec::new()));
        FuncBuilder {
            m: &mut self.m,
            fidx,
            cur: 0,
            next_local,
            dloc: None,
        }
    }

    pub fn add_compile_unit(&mut self, name: &str) {
        self.m.compile_units.push(String::from(name));
    }

    pub fn build(self) -> Module {
        self.m
    }
}

/// Appends instructions to one function, one block at a time.
pub struct FuncBuilder<'a> {
    m: &'a mut Module,
    fidx: FuncIndex,
    cur: BasicBlockIndex,
    next_local: u32,
    dloc: Option<DebugLoc>,
}

impl<'a> FuncBuilder<'a> {
    pub fn func_idx(&self) -> FuncIndex {
        self.fidx
    }

    /// The local bound to the `i`th parameter.
    pub fn param(&self, i: u32) -> Local {
        debug_assert!((i as usize) < self.m.funcs[self.fidx as usize].num_params());
        Local(i)
    }

    /// Append a new (empty) block, returning its index. Does not select it.
    pub fn new_block(&mut self) -> BasicBlockIndex {
        let f = &mut self.m.funcs[self.fidx as usize];
        f.blocks.push(BasicBlock::new(Vec::new()));
        (f.blocks.len() - 1) as BasicBlockIndex
    }

    /// Select the block subsequent instructions are appended to.
    pub fn switch_to_block(&mut self, bb: BasicBlockIndex) {
        debug_assert!((bb as usize) < self.m.funcs[self.fidx as usize].blocks.len());
        self.cur = bb;
    }

    /// Attach this source location to subsequently built instructions.
    pub fn set_dloc(&mut self, dloc: Option<DebugLoc>) {
        self.dloc = dloc;
    }

    fn push(&mut self, ty: Ty, kind: InstrKind) -> Option<Local> {
        let dest = if ty == Ty::Void {
            None
        } else {
            let l = Local(self.next_local);
            self.next_local += 1;
            Some(l)
        };
        let inst = Instruction {
            dest,
            ty,
            kind,
            dloc: self.dloc,
        };
        self.m.funcs[self.fidx as usize].blocks[self.cur as usize]
            .instrs
            .push(inst);
        dest
    }

    pub fn alloca(&mut self, ty: Ty, count: u64) -> Local {
        let pty = ty.clone().ptr_to();
        self.push(pty, InstrKind::Alloca { ty, count }).unwrap()
    }

    pub fn load(&mut self, ty: Ty, ptr: Operand) -> Local {
        self.push(ty, InstrKind::Load { ptr }).unwrap()
    }

    pub fn store(&mut self, val: Operand, ptr: Operand) {
        self.push(Ty::Void, InstrKind::Store { val, ptr });
    }

    pub fn binop(&mut self, op: BinOp, ty: Ty, a: Operand, b: Operand) -> Local {
        self.push(ty, InstrKind::BinOp { op, a, b }).unwrap()
    }

    pub fn icmp(&mut self, pred: CmpPred, a: Operand, b: Operand) -> Local {
        self.push(Ty::Int(1), InstrKind::Icmp { pred, a, b }).unwrap()
    }

    pub fn cast(&mut self, op: CastOp, to: Ty, val: Operand) -> Local {
        self.push(to, InstrKind::Cast { op, val }).unwrap()
    }

    pub fn ptradd(&mut self, ty: Ty, ptr: Operand, offs: Vec<Operand>) -> Local {
        self.push(ty, InstrKind::PtrAdd { ptr, offs }).unwrap()
    }

    pub fn insertvalue(&mut self, agg_ty: Ty, agg: Operand, val: Operand, index: u32) -> Local {
        self.push(agg_ty, InstrKind::InsertValue { agg, val, index })
            .unwrap()
    }

    pub fn extractvalue(&mut self, ty: Ty, agg: Operand, index: u32) -> Local {
        self.push(ty, InstrKind::ExtractValue { agg, index }).unwrap()
    }

    pub fn phi(&mut self, ty: Ty, incoming: Vec<(BasicBlockIndex, Operand)>) -> Local {
        self.push(ty, InstrKind::Phi { incoming }).unwrap()
    }

    /// A direct call. Returns the result local for non-void callees.
    pub fn call(&mut self, callee: FuncIndex, args: Vec<Operand>) -> Option<Local> {
        let ret = (*self.m.funcs[callee as usize].ty.ret).clone();
        self.push(
            ret,
            InstrKind::Call {
                callee: Callee::Func(callee),
                args,
            },
        )
    }

    pub fn icall(&mut self, ret: Ty, target: Operand, args: Vec<Operand>) -> Option<Local> {
        self.push(
            ret,
            InstrKind::Call {
                callee: Callee::Indirect(target),
                args,
            },
        )
    }

    pub fn asm_call(&mut self, ret: Ty, asm: &str, constraints: &str, args: Vec<Operand>) -> Option<Local> {
        self.push(
            ret,
            InstrKind::Call {
                callee: Callee::Asm {
                    asm: String::from(asm),
                    constraints: String::from(constraints),
                },
                args,
            },
        )
    }

    pub fn br(&mut self, target: BasicBlockIndex) {
        self.push(Ty::Void, InstrKind::Br { target });
    }

    pub fn condbr(&mut self, cond: Operand, on_true: BasicBlockIndex, on_false: BasicBlockIndex) {
        self.push(
            Ty::Void,
            InstrKind::CondBr {
                cond,
                on_true,
                on_false,
            },
        );
    }

    pub fn switch(
        &mut self,
        val: Operand,
        default: BasicBlockIndex,
        cases: Vec<(u128, BasicBlockIndex)>,
    ) {
        let cases = cases
            .into_iter()
            .map(|(v, bb)| (SerU128::new(v), bb))
            .collect();
        self.push(
            Ty::Void,
            InstrKind::Switch {
                val,
                default,
                cases,
            },
        );
    }

    pub fn indirectbr(&mut self, addr: Operand, possible: Vec<BasicBlockIndex>) {
        self.push(Ty::Void, InstrKind::IndirectBr { addr, possible });
    }

    pub fn ret(&mut self, val: Option<Operand>) {
        self.push(Ty::Void, InstrKind::Ret { val });
    }

    pub fn debug(&mut self, msg: &str) {
        self.push(
            Ty::Void,
            InstrKind::DebugIntrinsic {
                msg: String::from(msg),
            },
        );
    }

    /// Finish the function.
    pub fn done(self) -> FuncIndex {
        self.fidx
    }
}
