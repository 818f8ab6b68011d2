//! Stitching a JIT module together from a trace and the AOT module the trace
//! ran over.
//!
//! The builder walks the trace one block at a time, deciding per instruction
//! whether to inline, outline, skip or copy. Control flow instructions are
//! dropped (the trace has already committed to one path), PHI nodes are
//! resolved against the dynamically-known predecessor, calls to functions
//! with IR are inlined, external calls are left as calls, and recursion is
//! outlined back into a call to the AOT-compiled machine code.

use fxhash::FxHashMap;
use ykir::{
    BasicBlock, BasicBlockIndex, Callee, Const, ConstExpr, FuncIndex, FuncTy, Function,
    GlobalIndex, GlobalVar, InstrIndex, InstrKind, Instruction, Local, Module, Operand, Ty,
};
use yktrace::{InvalidTraceError, IrTrace, TraceLocation};

use crate::{FuncAddrs, NEW_CONTROL_POINT, YKTRACE_START, YKTRACE_STOP};

/// A call whose execution is suspended while the trace executes its callee.
struct SuspendedCall {
    /// The function containing the call.
    caller: FuncIndex,
    /// The SSA value the call defines in the caller, if any.
    dest: Option<Local>,
    /// The instruction index to resume at (the call itself; resumption
    /// continues just past it).
    resume_at: InstrIndex,
}

/// One entry of the inlining stack.
struct Frame {
    /// The suspended call, absent for the outermost frame.
    call: Option<SuspendedCall>,
    /// The function whose code this frame is executing.
    func: FuncIndex,
    /// The most recently completed block in this frame. None on function
    /// entry, so a PHI in an entry block is a hard error.
    last_block: Option<BasicBlockIndex>,
}

/// What happened while processing one traced block.
enum BlockOutcome {
    /// The whole block was processed; an intra-frame block boundary follows.
    Completed,
    /// Processing stopped early (call, return or second control point
    /// sighting); the next trace entry continues elsewhere.
    Broke,
    /// The stop marker was reached.
    Finalise,
}

enum CallOutcome {
    Continue,
    Break,
    Finalise,
}

/// Everything `compile_trace` needs back from a build.
pub(crate) struct BuildOutput {
    pub(crate) jitmod: Module,
    /// name -> virtual address bindings for outlined callees.
    pub(crate) global_mappings: FxHashMap<String, u64>,
    /// For each instruction of the compiled trace, the AOT instruction it
    /// was cloned from (None for instructions the finaliser synthesised).
    /// Debugging aid for the side-by-side dump.
    pub(crate) rev_map: Vec<Option<(FuncIndex, BasicBlockIndex, InstrIndex)>>,
}

pub(crate) struct JitModBuilder<'a> {
    aot: &'a Module,
    trace: &'a IrTrace,
    faddrs: &'a FuncAddrs,

    /// The module being built. Function 0 is the compiled trace; any further
    /// functions are declarations.
    jitmod: Module,
    /// The straight-line body of the compiled trace.
    jit_instrs: Vec<Instruction>,
    next_local: u32,

    /// AOT SSA value -> JIT operand.
    local_map: FxHashMap<(FuncIndex, Local), Operand>,
    /// AOT global -> JIT global.
    global_map: FxHashMap<GlobalIndex, GlobalIndex>,
    /// AOT function -> JIT declaration.
    func_map: FxHashMap<FuncIndex, FuncIndex>,
    rev_map: Vec<Option<(FuncIndex, BasicBlockIndex, InstrIndex)>>,

    /// AOT globals whose initialisers must be copied during finalisation.
    cloned_globals: Vec<GlobalIndex>,

    frames: Vec<Frame>,
    /// Non-zero while skipping the traced body of an outlined recursive
    /// callee. Counts nested calls so the matching return is recognised.
    outline_depth: usize,

    /// The function containing the control point call.
    cp_fidx: FuncIndex,
    /// The SSA value the control point call defines.
    cp_dest: Option<Local>,
    /// Struct index -> the AOT operand inserted at that index just before
    /// the control point.
    insert_align: FxHashMap<u32, Operand>,
    /// Results of stripped marker calls; mapped to typed nulls on use.
    marker_results: FxHashMap<(FuncIndex, Local), Ty>,

    cp_seen: bool,
    expect_unmappable: bool,
    /// Instruction index within the next entered block after which to
    /// continue.
    resume_after: Option<InstrIndex>,

    /// JIT values queued for transitive deletion during finalisation.
    dead_on_finalize: Vec<Operand>,
    global_mappings: FxHashMap<String, u64>,
}

impl<'a> JitModBuilder<'a> {
    pub(crate) fn new(
        aot: &'a Module,
        trace: &'a IrTrace,
        faddrs: &'a FuncAddrs,
        trace_name: String,
    ) -> Result<Self, InvalidTraceError> {
        if trace.is_empty() {
            return Err(InvalidTraceError::EmptyTrace);
        }

        // Locate the single call to the control point. Its argument 1 is the
        // live-variables aggregate.
        let mut cp_site = None;
        for (fidx, func) in aot.funcs.iter().enumerate() {
            for (bbidx, bb) in func.blocks.iter().enumerate() {
                for (iidx, inst) in bb.instrs.iter().enumerate() {
                    if let InstrKind::Call {
                        callee: Callee::Func(cf),
                        ..
                    } = &inst.kind
                    {
                        if aot.func(*cf).name == NEW_CONTROL_POINT {
                            if cp_site.is_some() {
                                return Err(InvalidTraceError::MissingControlPoint);
                            }
                            cp_site = Some((fidx as FuncIndex, bbidx as BasicBlockIndex, iidx));
                        }
                    }
                }
            }
        }
        let (cp_fidx, cp_bbidx, cp_iidx) = cp_site.ok_or(InvalidTraceError::MissingControlPoint)?;
        let cp_inst = &aot.funcs[cp_fidx as usize].blocks[cp_bbidx as usize].instrs[cp_iidx];
        let cp_vars = match &cp_inst.kind {
            InstrKind::Call { args, .. } => args
                .get(1)
                .cloned()
                .ok_or(InvalidTraceError::MissingControlPoint)?,
            _ => unreachable!(),
        };
        let cp_dest = cp_inst.dest;
        let cp_ret_ty = cp_inst.ty.clone();

        // Record the insertvalue chain feeding the aggregate, so that
        // extractions below the control point can be re-mapped back to the
        // values inserted above it. The walk stops at the first producer
        // that is not an insertvalue.
        let mut insert_align = FxHashMap::default();
        let mut cur = cp_vars.clone();
        while let Operand::Local(l) = cur {
            let def = match find_def(aot, cp_fidx, l) {
                Some((bb, i)) => &aot.funcs[cp_fidx as usize].blocks[bb as usize].instrs[i],
                None => break,
            };
            if let InstrKind::InsertValue { agg, val, index } = &def.kind {
                insert_align.entry(*index).or_insert_with(|| val.clone());
                cur = agg.clone();
            } else {
                break;
            }
        }

        // Create the function which will hold the compiled trace. Its one
        // parameter takes the live-variables aggregate; its return type is
        // that of the control point call.
        let agg_ty = operand_ty(aot, cp_fidx, &cp_vars);
        let mut jitmod = Module::new("");
        jitmod.funcs.push(Function {
            name: trace_name,
            ty: FuncTy::new(vec![agg_ty], cp_ret_ty),
            internal: true,
            blocks: Vec::new(),
        });

        // Variables that are live across the control point are re-entered
        // via the aggregate, which the user passes into the compiled trace.
        // Map both the control point's result and the aggregate itself to
        // the function's parameter.
        let mut local_map = FxHashMap::default();
        if let Some(dest) = cp_dest {
            local_map.insert((cp_fidx, dest), Operand::Local(Local(0)));
        }
        if let Operand::Local(agg_l) = cp_vars {
            local_map.insert((cp_fidx, agg_l), Operand::Local(Local(0)));
        }

        Ok(Self {
            aot,
            trace,
            faddrs,
            jitmod,
            jit_instrs: Vec::new(),
            next_local: 1,
            local_map,
            global_map: FxHashMap::default(),
            func_map: FxHashMap::default(),
            rev_map: Vec::new(),
            cloned_globals: Vec::new(),
            frames: Vec::new(),
            outline_depth: 0,
            cp_fidx,
            cp_dest,
            insert_align,
            marker_results: FxHashMap::default(),
            cp_seen: false,
            expect_unmappable: false,
            resume_after: None,
            dead_on_finalize: Vec::new(),
            global_mappings: FxHashMap::default(),
        })
    }

    /// Walk the trace and stitch together all traced blocks.
    pub(crate) fn build(mut self) -> Result<BuildOutput, InvalidTraceError> {
        let aot = self.aot;

        // The outermost frame executes the function the trace starts in.
        let first = match self.trace.loc(0) {
            TraceLocation::Mapped(loc) => loc,
            TraceLocation::Hole => return Err(InvalidTraceError::UnexpectedHole(0)),
        };
        let first_fidx = aot
            .func_idx(&first.func_name)
            .ok_or_else(|| InvalidTraceError::no_ir(&first.func_name))?;
        self.frames.push(Frame {
            call: None,
            func: first_fidx,
            last_block: None,
        });

        for idx in 0..self.trace.len() {
            let loc = match self.trace.loc(idx) {
                TraceLocation::Mapped(loc) => loc,
                TraceLocation::Hole => {
                    if self.expect_unmappable {
                        self.expect_unmappable = false;
                        continue;
                    }
                    return Err(InvalidTraceError::UnexpectedHole(idx));
                }
            };

            let fidx = aot
                .func_idx(&loc.func_name)
                .ok_or_else(|| InvalidTraceError::no_ir(&loc.func_name))?;
            let func = aot.func(fidx);
            if func.is_declaration() {
                return Err(InvalidTraceError::no_ir(&loc.func_name));
            }
            if (loc.bb_idx as usize) >= func.blocks.len() {
                return Err(InvalidTraceError::BadBlockIndex(
                    loc.func_name.clone(),
                    loc.bb_idx,
                ));
            }

            // If we broke out of a block early (call, external call, second
            // control point sighting), skip to just past where we left off.
            let start = match self.resume_after.take() {
                Some(i) => i + 1,
                None => 0,
            };

            match self.process_block(fidx, loc.bb_idx, start, idx)? {
                BlockOutcome::Completed => {
                    // An intra-frame block boundary: remember the
                    // predecessor for PHI resolution.
                    self.frames.last_mut().unwrap().last_block = Some(loc.bb_idx);
                }
                BlockOutcome::Broke => (),
                BlockOutcome::Finalise => return self.finalise(),
            }
        }

        // We fell off the end of the trace without seeing the stop marker.
        Err(InvalidTraceError::NoStopMarker)
    }

    fn process_block(
        &mut self,
        fidx: FuncIndex,
        bbidx: BasicBlockIndex,
        start: InstrIndex,
        trace_idx: usize,
    ) -> Result<BlockOutcome, InvalidTraceError> {
        let aot = self.aot;
        let bb = &aot.funcs[fidx as usize].blocks[bbidx as usize];

        for iidx in start..bb.instrs.len() {
            let inst = &bb.instrs[iidx];

            if inst.is_debug_intrinsic() {
                continue;
            }

            if let InstrKind::Call { .. } = &inst.kind {
                match self.handle_call(fidx, bbidx, iidx, inst, trace_idx)? {
                    CallOutcome::Continue => continue,
                    CallOutcome::Break => return Ok(BlockOutcome::Broke),
                    CallOutcome::Finalise => return Ok(BlockOutcome::Finalise),
                }
            }

            // Nothing before the control point is relevant to the trace.
            if !self.cp_seen {
                continue;
            }

            match &inst.kind {
                InstrKind::IndirectBr { addr, .. } => {
                    // The successor is dictated by the trace. The address
                    // operand would be left dangling in the JIT module, so
                    // queue it for deletion.
                    let jit_addr = self.map_operand(fidx, addr)?;
                    self.dead_on_finalize.push(jit_addr);
                    continue;
                }
                InstrKind::Br { .. } | InstrKind::CondBr { .. } | InstrKind::Switch { .. } => {
                    // FIXME Replace all potential CFG divergence with guards.
                    continue;
                }
                InstrKind::Ret { val } => {
                    return self.handle_return(fidx, val.as_ref());
                }
                _ => (),
            }

            if self.outline_depth > 0 {
                // We are skipping the body of an outlined call.
                continue;
            }

            if let InstrKind::Phi { incoming } = &inst.kind {
                // The dynamically-taken predecessor selects the incoming
                // value; no instruction is emitted.
                let last = self
                    .frames
                    .last()
                    .unwrap()
                    .last_block
                    .expect("phi in a block with no traced predecessor");
                let (_, val) = incoming
                    .iter()
                    .find(|(bb, _)| *bb == last)
                    .expect("phi has no incoming value for the traced predecessor");
                let mapped = self.map_operand(fidx, val)?;
                self.local_map.insert((fidx, inst.dest.unwrap()), mapped);
                continue;
            }

            let new_dest = self.clone_instr(fidx, bbidx, iidx)?;

            // An extraction from the control point's returned aggregate
            // resurrects a value that was live across the control point:
            // re-map the AOT value inserted at the same index to the
            // freshly extracted one.
            if let InstrKind::ExtractValue { agg, index } = &inst.kind {
                if let Operand::Local(al) = agg {
                    if self.cp_dest == Some(*al) && fidx == self.cp_fidx {
                        if let (Some(Operand::Local(src)), Some(nd)) =
                            (self.insert_align.get(index).cloned(), new_dest)
                        {
                            self.local_map.insert((self.cp_fidx, src), Operand::Local(nd));
                        }
                    }
                }
            }
        }

        Ok(BlockOutcome::Completed)
    }

    fn handle_call(
        &mut self,
        fidx: FuncIndex,
        bbidx: BasicBlockIndex,
        iidx: InstrIndex,
        inst: &Instruction,
        trace_idx: usize,
    ) -> Result<CallOutcome, InvalidTraceError> {
        let aot = self.aot;
        let (callee, args) = match &inst.kind {
            InstrKind::Call { callee, args } => (callee, args),
            _ => unreachable!(),
        };

        // Resolve a statically-known callee where possible.
        let cf = match callee {
            Callee::Func(cf) => *cf,
            Callee::Asm { .. } => {
                // Inline asm is copied verbatim.
                if self.cp_seen && self.outline_depth == 0 {
                    self.clone_instr(fidx, bbidx, iidx)?;
                }
                return Ok(CallOutcome::Continue);
            }
            Callee::Indirect(_) => {
                if !self.cp_seen {
                    return Ok(CallOutcome::Continue);
                }
                // If the next trace entry maps into a function, the trace
                // tells us what the target was, and we can inline it.
                match self.peek_effective_callee(trace_idx) {
                    Some(g) => g,
                    None => {
                        // No IR for the target: leave the call as a call
                        // and expect a hole in the trace.
                        if self.outline_depth == 0 {
                            self.clone_instr(fidx, bbidx, iidx)?;
                        }
                        self.expect_unmappable = true;
                        self.resume_after = Some(iidx);
                        return Ok(CallOutcome::Break);
                    }
                }
            }
        };
        let cfunc = aot.func(cf);

        // Tracing-start and control-point markers delimit the traced region.
        if cfunc.name == YKTRACE_START || cfunc.name == NEW_CONTROL_POINT {
            if !self.cp_seen {
                self.cp_seen = true;
                // The marker itself is stripped, but its result can still be
                // named by surviving instructions; those uses become typed
                // nulls.
                if let Some(dest) = inst.dest {
                    if !self.local_map.contains_key(&(fidx, dest)) {
                        self.marker_results.insert((fidx, dest), inst.ty.clone());
                    }
                }
                return Ok(CallOutcome::Continue);
            }
            // Second sighting: the end of the traced region. From here on
            // the call stands for the aggregate it was handed.
            if let Some(agg) = args.get(1) {
                let mapped = self.map_operand(fidx, agg)?;
                if let Some(dest) = inst.dest {
                    self.local_map.insert((fidx, dest), mapped);
                }
            }
            self.resume_after = Some(iidx);
            return Ok(CallOutcome::Break);
        }

        if cfunc.name == YKTRACE_STOP {
            return Ok(CallOutcome::Finalise);
        }

        if !self.cp_seen {
            return Ok(CallOutcome::Continue);
        }

        if cfunc.is_declaration() {
            // The definition of the callee is external to the AOT module.
            // Declare it locally, leave the call as a call, and expect an
            // unmappable hole where the trace followed the callee.
            self.declare_func(cf);
            if self.outline_depth == 0 {
                self.clone_instr(fidx, bbidx, iidx)?;
            }
            self.expect_unmappable = true;
            self.resume_after = Some(iidx);
            return Ok(CallOutcome::Break);
        }

        if self.outline_depth > 0 {
            // Already outlining: count the nested call so the frame
            // boundary is recognised on the matching return.
            self.outline_depth += 1;
            self.frames.push(Frame {
                call: Some(SuspendedCall {
                    caller: fidx,
                    dest: inst.dest,
                    resume_at: iidx,
                }),
                func: cf,
                last_block: None,
            });
            return Ok(CallOutcome::Break);
        }

        if self.frames.iter().any(|fr| fr.func == cf) {
            // The callee is already on the stack, so inlining it would
            // unroll the recursion for as long as the trace runs. Outline
            // it instead: emit one call and resolve the declaration to the
            // AOT machine code at link time.
            let name = cfunc.name.clone();
            let addr = self
                .faddrs
                .lookup(&name)
                .ok_or_else(|| InvalidTraceError::NoAddressBinding(name.clone()))?;
            self.declare_func(cf);
            self.global_mappings.insert(name, addr);
            self.clone_instr(fidx, bbidx, iidx)?;
            self.frames.push(Frame {
                call: Some(SuspendedCall {
                    caller: fidx,
                    dest: inst.dest,
                    resume_at: iidx,
                }),
                func: cf,
                last_block: None,
            });
            self.outline_depth = 1;
            return Ok(CallOutcome::Break);
        }

        // Ordinary call with IR available: inline it. No call is emitted;
        // the callee's formal parameters are bound to the materialised
        // actuals and the next trace entry takes us into the callee.
        self.frames.push(Frame {
            call: Some(SuspendedCall {
                caller: fidx,
                dest: inst.dest,
                resume_at: iidx,
            }),
            func: cf,
            last_block: None,
        });
        for (i, arg) in args.iter().enumerate() {
            let mapped = self.map_operand(fidx, arg)?;
            self.local_map.insert((cf, Local(i as u32)), mapped);
        }
        Ok(CallOutcome::Break)
    }

    fn handle_return(
        &mut self,
        fidx: FuncIndex,
        val: Option<&Operand>,
    ) -> Result<BlockOutcome, InvalidTraceError> {
        let frame = self.frames.pop().expect("return with no frame");
        let call = frame
            .call
            .expect("traced a return from the outermost frame");
        self.resume_after = Some(call.resume_at);

        if self.outline_depth > 0 {
            // Still inside an outlined call; the emitted call instruction
            // already defines the result.
            self.outline_depth -= 1;
            return Ok(BlockOutcome::Broke);
        }

        // Subsequent uses of the call's result in the caller must pick up
        // the (mapped) returned value.
        if let (Some(dest), Some(v)) = (call.dest, val) {
            let mapped = self.map_operand(fidx, v)?;
            self.local_map.insert((call.caller, dest), mapped);
        }
        Ok(BlockOutcome::Broke)
    }

    /// If the trace entry after `trace_idx` maps into a function with IR,
    /// return that function: it is the dynamic target of an indirect call.
    fn peek_effective_callee(&self, trace_idx: usize) -> Option<FuncIndex> {
        if trace_idx + 1 >= self.trace.len() {
            return None;
        }
        match self.trace.loc(trace_idx + 1) {
            TraceLocation::Mapped(loc) => self
                .aot
                .func_idx(&loc.func_name)
                .filter(|f| !self.aot.func(*f).is_declaration()),
            TraceLocation::Hole => None,
        }
    }

    /// Clone one AOT instruction into the JIT module, materialising its
    /// operands first. Returns the JIT destination local, if any.
    fn clone_instr(
        &mut self,
        fidx: FuncIndex,
        bbidx: BasicBlockIndex,
        iidx: InstrIndex,
    ) -> Result<Option<Local>, InvalidTraceError> {
        let aot = self.aot;
        let inst = &aot.funcs[fidx as usize].blocks[bbidx as usize].instrs[iidx];
        let mut new = inst.clone();

        for op in new.operands_mut() {
            let mapped = self.map_operand(fidx, op)?;
            *op = mapped;
        }

        // A direct callee is a function reference outside the operand list;
        // re-point it at the JIT-local declaration.
        if let InstrKind::Call {
            callee: Callee::Func(cf),
            ..
        } = &mut new.kind
        {
            *cf = self.declare_func(*cf);
        }

        let new_dest = match inst.dest {
            Some(old) => {
                let nd = Local(self.next_local);
                self.next_local += 1;
                new.dest = Some(nd);
                self.local_map.insert((fidx, old), Operand::Local(nd));
                Some(nd)
            }
            None => None,
        };

        // Debug locations ride along unchanged (`new` is a clone).
        self.rev_map.push(Some((fidx, bbidx, iidx)));
        self.jit_instrs.push(new);
        Ok(new_dest)
    }

    /// The operand materialiser: return the JIT counterpart of an AOT
    /// operand, materialising it on demand.
    fn map_operand(
        &mut self,
        fidx: FuncIndex,
        op: &Operand,
    ) -> Result<Operand, InvalidTraceError> {
        match op {
            Operand::Local(l) => {
                if let Some(m) = self.local_map.get(&(fidx, *l)) {
                    return Ok(m.clone());
                }
                if let Some(ty) = self.marker_results.get(&(fidx, *l)).cloned() {
                    // The marker producing this value was stripped from the
                    // JIT module; a typed null stands in for it.
                    let null = Operand::Const(Const::Null(ty));
                    self.local_map.insert((fidx, *l), null.clone());
                    return Ok(null);
                }
                // Stack allocations made outside the traced region are
                // forbidden: the control point aggregate is the only
                // channel for outside-trace state.
                let rendered = match find_def(self.aot, fidx, *l) {
                    Some((bb, i)) => {
                        let def = &self.aot.funcs[fidx as usize].blocks[bb as usize].instrs[i];
                        format!(
                            "{} in {}",
                            self.aot.display_instr(def),
                            self.aot.func(fidx).name
                        )
                    }
                    None => format!("{} in {}", l, self.aot.func(fidx).name),
                };
                Err(InvalidTraceError::UnmappedOperand(rendered))
            }
            Operand::Const(c) => Ok(Operand::Const(self.map_const(c)?)),
            Operand::Global(g) => Ok(Operand::Global(self.map_global(*g))),
            Operand::Func(f) => Ok(Operand::Func(self.declare_func(*f))),
        }
    }

    /// Map a constant. Constants which embed global addresses are rebuilt
    /// against the JIT module's globals; everything else is identity-mapped.
    fn map_const(&mut self, c: &Const) -> Result<Const, InvalidTraceError> {
        match c {
            Const::GlobalAddr(g) => Ok(Const::GlobalAddr(self.map_global(*g))),
            Const::Expr(ce) => {
                let mut operands = Vec::with_capacity(ce.operands.len());
                for op in &ce.operands {
                    operands.push(self.map_const(op)?);
                }
                Ok(Const::Expr(ConstExpr {
                    op: ce.op,
                    operands,
                    ty: ce.ty.clone(),
                }))
            }
            Const::Struct(ty, fields) => {
                let mut new_fields = Vec::with_capacity(fields.len());
                for fld in fields {
                    new_fields.push(self.map_const(fld)?);
                }
                Ok(Const::Struct(ty.clone(), new_fields))
            }
            _ => Ok(c.clone()),
        }
    }

    /// Copy a global variable into the JIT module (sans initialiser).
    /// Constant globals get their initialisers back during finalisation;
    /// mutable ones are resolved to the AOT program's storage at link time.
    fn map_global(&mut self, g: GlobalIndex) -> GlobalIndex {
        if let Some(j) = self.global_map.get(&g) {
            return *j;
        }
        let old = self.aot.global(g);
        let mut new = GlobalVar {
            name: old.name.clone(),
            ty: old.ty.clone(),
            is_const: old.is_const,
            internal: old.internal,
            tls: old.tls,
            addr_space: old.addr_space,
            init: None,
            attrs: Vec::new(),
        };
        if old.is_const {
            new.attrs = old.attrs.clone();
        }
        let j = self.jitmod.globals.len() as GlobalIndex;
        self.jitmod.globals.push(new);
        self.global_map.insert(g, j);
        if old.is_const {
            self.cloned_globals.push(g);
        }
        j
    }

    /// Declare an AOT function in the JIT module if we have not yet.
    fn declare_func(&mut self, f: FuncIndex) -> FuncIndex {
        if let Some(j) = self.func_map.get(&f) {
            return *j;
        }
        let old = self.aot.func(f);
        let j = self.jitmod.funcs.len() as FuncIndex;
        self.jitmod.funcs.push(Function {
            name: old.name.clone(),
            ty: old.ty.clone(),
            internal: false,
            blocks: Vec::new(),
        });
        self.func_map.insert(f, j);
        j
    }

    /// Finalise the JIT module: delete queued dead values, emit the
    /// terminating return, copy global initialisers and the compilation
    /// units over.
    fn finalise(mut self) -> Result<BuildOutput, InvalidTraceError> {
        self.delete_dead_values();

        let retval = self
            .cp_dest
            .and_then(|d| self.local_map.get(&(self.cp_fidx, d)).cloned());
        self.rev_map.push(None);
        self.jit_instrs.push(Instruction {
            dest: None,
            ty: Ty::Void,
            kind: InstrKind::Ret { val: retval },
            dloc: None,
        });

        // Fix initialisers for copied constant globals. Copying an
        // initialiser can pull in further globals, so iterate by index.
        let mut i = 0;
        while i < self.cloned_globals.len() {
            let g = self.cloned_globals[i];
            i += 1;
            let init = match &self.aot.global(g).init {
                Some(init) => init.clone(),
                None => continue,
            };
            let mapped = self.map_const(&init)?;
            let j = self.global_map[&g];
            self.jitmod.globals[j as usize].init = Some(mapped);
        }

        // Ensure the JIT module carries the compilation units of the AOT
        // module (the back-end wants at least one).
        for cu in &self.aot.compile_units {
            if !self.jitmod.compile_units.contains(cu) {
                self.jitmod.compile_units.push(cu.clone());
            }
        }

        self.jitmod.funcs[0].blocks = vec![BasicBlock::new(self.jit_instrs)];
        Ok(BuildOutput {
            jitmod: self.jitmod,
            global_mappings: self.global_mappings,
            rev_map: self.rev_map,
        })
    }

    /// Transitively erase queued values which have no users left in the JIT
    /// module. Works for instructions and global variables; erased globals
    /// also leave the initialiser-copy list.
    fn delete_dead_values(&mut self) {
        if self.dead_on_finalize.is_empty() {
            return;
        }

        let mut local_uses: FxHashMap<Local, usize> = FxHashMap::default();
        let mut global_uses: FxHashMap<GlobalIndex, usize> = FxHashMap::default();
        let mut defs: FxHashMap<Local, usize> = FxHashMap::default();
        for (i, inst) in self.jit_instrs.iter().enumerate() {
            if let Some(d) = inst.dest {
                defs.insert(d, i);
            }
            for op in inst.operands() {
                count_operand_uses(op, &mut local_uses, &mut global_uses);
            }
        }

        let mut removed_instrs: Vec<usize> = Vec::new();
        let mut removed_globals: Vec<GlobalIndex> = Vec::new();
        let mut queue = std::mem::take(&mut self.dead_on_finalize);
        while let Some(v) = queue.pop() {
            match v {
                Operand::Local(l) => {
                    if *local_uses.get(&l).unwrap_or(&0) > 0 {
                        continue;
                    }
                    let i = match defs.get(&l) {
                        Some(i) => *i,
                        None => continue,
                    };
                    if removed_instrs.contains(&i) {
                        continue;
                    }
                    removed_instrs.push(i);
                    for op in self.jit_instrs[i].operands() {
                        match op {
                            Operand::Local(ol) => {
                                let n = local_uses.entry(*ol).or_insert(1);
                                *n -= 1;
                                if *n == 0 {
                                    queue.push(Operand::Local(*ol));
                                }
                            }
                            Operand::Global(og) => {
                                let n = global_uses.entry(*og).or_insert(1);
                                *n -= 1;
                                if *n == 0 {
                                    queue.push(Operand::Global(*og));
                                }
                            }
                            _ => (),
                        }
                    }
                }
                Operand::Global(g) => {
                    if *global_uses.get(&g).unwrap_or(&0) > 0 {
                        continue;
                    }
                    if !removed_globals.contains(&g) {
                        removed_globals.push(g);
                    }
                }
                _ => (),
            }
        }

        if !removed_instrs.is_empty() {
            let instrs = std::mem::take(&mut self.jit_instrs);
            let rev = std::mem::take(&mut self.rev_map);
            for (i, (inst, site)) in instrs.into_iter().zip(rev.into_iter()).enumerate() {
                if !removed_instrs.contains(&i) {
                    self.jit_instrs.push(inst);
                    self.rev_map.push(site);
                }
            }
        }

        if !removed_globals.is_empty() {
            // Compact the global table and rewrite indices everywhere.
            let mut remap: Vec<Option<GlobalIndex>> = Vec::with_capacity(self.jitmod.globals.len());
            let mut next = 0;
            for j in 0..self.jitmod.globals.len() as GlobalIndex {
                if removed_globals.contains(&j) {
                    remap.push(None);
                } else {
                    remap.push(Some(next));
                    next += 1;
                }
            }
            let mut kept = Vec::with_capacity(next as usize);
            for (j, g) in self.jitmod.globals.drain(..).enumerate() {
                if remap[j].is_some() {
                    kept.push(g);
                }
            }
            self.jitmod.globals = kept;

            for inst in &mut self.jit_instrs {
                for op in inst.operands_mut() {
                    remap_operand_globals(op, &remap);
                }
            }
            self.global_map.retain(|_, j| {
                if let Some(nj) = remap[*j as usize] {
                    *j = nj;
                    true
                } else {
                    false
                }
            });
            let global_map = &self.global_map;
            self.cloned_globals.retain(|g| global_map.contains_key(g));
        }
    }
}

/// Find the defining instruction of a local within a function.
fn find_def(aot: &Module, fidx: FuncIndex, l: Local) -> Option<(BasicBlockIndex, InstrIndex)> {
    for (bbidx, bb) in aot.funcs[fidx as usize].blocks.iter().enumerate() {
        for (iidx, inst) in bb.instrs.iter().enumerate() {
            if inst.dest == Some(l) {
                return Some((bbidx as BasicBlockIndex, iidx));
            }
        }
    }
    None
}

/// The type of an operand as seen from within `fidx`.
fn operand_ty(aot: &Module, fidx: FuncIndex, op: &Operand) -> Ty {
    match op {
        Operand::Local(l) => {
            let func = aot.func(fidx);
            if (l.0 as usize) < func.num_params() {
                return func.ty.params[l.0 as usize].clone();
            }
            match find_def(aot, fidx, *l) {
                Some((bb, i)) => func.blocks[bb as usize].instrs[i].ty.clone(),
                None => panic!("no definition for {} in {}", l, func.name),
            }
        }
        Operand::Const(c) => c.ty(aot),
        Operand::Global(g) => aot.global(*g).ty.clone().ptr_to(),
        Operand::Func(f) => Ty::Func(aot.func(*f).ty.clone()).ptr_to(),
    }
}

fn count_operand_uses(
    op: &Operand,
    local_uses: &mut FxHashMap<Local, usize>,
    global_uses: &mut FxHashMap<GlobalIndex, usize>,
) {
    match op {
        Operand::Local(l) => *local_uses.entry(*l).or_insert(0) += 1,
        Operand::Global(g) => *global_uses.entry(*g).or_insert(0) += 1,
        Operand::Const(c) => count_const_global_uses(c, global_uses),
        Operand::Func(_) => (),
    }
}

fn count_const_global_uses(c: &Const, global_uses: &mut FxHashMap<GlobalIndex, usize>) {
    match c {
        Const::GlobalAddr(g) => *global_uses.entry(*g).or_insert(0) += 1,
        Const::Expr(ce) => {
            for op in &ce.operands {
                count_const_global_uses(op, global_uses);
            }
        }
        Const::Struct(_, fields) => {
            for fld in fields {
                count_const_global_uses(fld, global_uses);
            }
        }
        _ => (),
    }
}

fn remap_operand_globals(op: &mut Operand, remap: &[Option<GlobalIndex>]) {
    match op {
        Operand::Global(g) => *g = remap[*g as usize].expect("use of deleted global"),
        Operand::Const(c) => remap_const_globals(c, remap),
        _ => (),
    }
}

fn remap_const_globals(c: &mut Const, remap: &[Option<GlobalIndex>]) {
    match c {
        Const::GlobalAddr(g) => *g = remap[*g as usize].expect("use of deleted global"),
        Const::Expr(ce) => {
            for op in &mut ce.operands {
                remap_const_globals(op, remap);
            }
        }
        Const::Struct(_, fields) => {
            for fld in fields {
                remap_const_globals(fld, remap);
            }
        }
        _ => (),
    }
}
