//! Shared scaffolding for the end-to-end tests.
//!
//! Test programs follow the shape the interpreter side of the system
//! produces: a `main` whose loop header builds the live-variables aggregate
//! (one `*i32` slot holding `res`), calls the control point, runs a body and
//! loops while `res` is zero. The exit path calls the stop marker.

use ykbh::{Interp, Ptr, Val};
use ykcompile::CompiledTrace;
use ykir::{
    CmpPred, Const, FuncBuilder, FuncIndex, FuncTy, Local, Module, ModuleBuilder, Operand, Ty,
};
use yktrace::{IrTrace, NEW_CONTROL_POINT, YKTRACE_STOP};

pub(crate) fn i32_ty() -> Ty {
    Ty::Int(32)
}

pub(crate) fn agg_ty() -> Ty {
    Ty::Struct(vec![i32_ty().ptr_to()])
}

/// Declare the control point and stop marker the way the AOT compiler does.
pub(crate) fn declare_markers(mb: &mut ModuleBuilder) -> (FuncIndex, FuncIndex) {
    let cp = mb.declare_func(
        NEW_CONTROL_POINT,
        FuncTy::new(vec![Ty::Int(8).ptr_to(), agg_ty()], agg_ty()),
    );
    let stop = mb.declare_func(YKTRACE_STOP, FuncTy::new(vec![], Ty::Void));
    (cp, stop)
}

/// Build the standard `main`:
///
/// ```text
/// bb0: %res = alloca i32; store 0, %res; br bb1
/// bb1: %agg = insertvalue zeroinit, %res, 0
///      %cp  = call yk_new_control_point($0, %agg); br bb2
/// bb2: %rp = extractvalue %cp, 0
///      <body>
///      %chk = load %rp; %c = icmp eq %chk, 0; condbr %c, bb1, bb3
/// bb3: call stop(); ret load %res
/// ```
///
/// `body` receives the builder and `%rp`, the trace-visible pointer to the
/// interpreter state.
pub(crate) fn build_main<F>(mb: &mut ModuleBuilder, body: F)
where
    F: FnOnce(&mut FuncBuilder<'_>, Local),
{
    let (cp, stop) = declare_markers(mb);
    let mut fb = mb.func("main", FuncTy::new(vec![Ty::Int(8).ptr_to()], i32_ty()));
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    let bb3 = fb.new_block();

    let res = fb.alloca(i32_ty(), 1);
    fb.store(Operand::Const(Const::i32(0)), Operand::Local(res));
    fb.br(bb1);

    fb.switch_to_block(bb1);
    let agg = fb.insertvalue(
        agg_ty(),
        Operand::Const(Const::ZeroAggregate(agg_ty())),
        Operand::Local(res),
        0,
    );
    let cpv = fb
        .call(cp, vec![Operand::Local(fb.param(0)), Operand::Local(agg)])
        .unwrap();
    fb.br(bb2);

    fb.switch_to_block(bb2);
    let rp = fb.extractvalue(i32_ty().ptr_to(), Operand::Local(cpv), 0);
    body(&mut fb, rp);
    let chk = fb.load(i32_ty(), Operand::Local(rp));
    let c = fb.icmp(CmpPred::Eq, Operand::Local(chk), Operand::Const(Const::i32(0)));
    fb.condbr(Operand::Local(c), bb1, bb3);

    fb.switch_to_block(bb3);
    fb.call(stop, vec![]);
    let out = fb.load(i32_ty(), Operand::Local(res));
    fb.ret(Some(Operand::Local(out)));
    fb.done();
}

/// The trace of one loop iteration whose body inlined the given callee
/// blocks (empty slice for a straight-line body).
pub(crate) fn one_iteration_trace(callee_blocks: &[(&str, u32)]) -> IrTrace {
    let mut names: Vec<Option<&str>> = vec![Some("main"), Some("main")];
    let mut bbs: Vec<u32> = vec![1, 2];
    for (name, bb) in callee_blocks {
        names.push(Some(name));
        bbs.push(*bb);
    }
    if !callee_blocks.is_empty() {
        // The caller block is re-entered after the return.
        names.push(Some("main"));
        bbs.push(2);
    }
    names.extend_from_slice(&[Some("main"), Some("main"), Some("main")]);
    bbs.extend_from_slice(&[1, 1, 3]);
    IrTrace::from_arrays(&names, &bbs)
}

/// Run the AOT program itself through the evaluator. Returns `main`'s value.
pub(crate) fn run_aot_main(aot: &Module) -> i64 {
    let mut interp = Interp::new(aot);
    interp
        .run("main", vec![Val::Ptr(Ptr::Null)])
        .unwrap()
        .as_int()
}

/// Execute a compiled trace over a fresh `res` slot, resolving outlined
/// callees and shared globals against the AOT module. Returns the final
/// value of `res` and the interpreter for further inspection.
pub(crate) fn run_compiled_trace<'a>(
    aot: &'a Module,
    ct: &'a CompiledTrace,
) -> (i64, Interp<'a>) {
    let mut interp = Interp::with_resolver(&ct.jitmod, aot);
    let slot = interp.alloc_slot(Val::Int(0));
    let agg = Val::Struct(vec![Val::Ptr(slot.clone())]);
    let ret = interp
        .run(&ct.trace_name, vec![agg])
        .expect("compiled trace returned nothing");
    // The trace hands back the (re-built) live-vars aggregate.
    match &ret {
        Val::Struct(fields) => assert_eq!(fields.len(), 1),
        _ => panic!("compiled trace returned a non-aggregate"),
    }
    let res = interp.read_ptr(&slot).as_int();
    (res, interp)
}
