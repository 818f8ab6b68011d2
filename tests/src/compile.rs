//! End-to-end scenarios: inlining, PHI resolution, globals, dropped
//! branches.

use crate::helpers::{
    build_main, i32_ty, one_iteration_trace, run_aot_main, run_compiled_trace,
};
use ykcompile::{compile_trace, CompiledTrace, FuncAddrs, TRACE_FUNC_PREFIX};
use ykir::{
    BinOp, Callee, CmpPred, Const, FuncTy, Instruction, InstrKind, ModuleBuilder, Operand, Ty,
};

fn jit_instrs(ct: &CompiledTrace) -> &[Instruction] {
    &ct.jitmod.funcs[0].blocks[0].instrs
}

fn count_calls(ct: &CompiledTrace) -> usize {
    jit_instrs(ct)
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::Call { .. }))
        .count()
}

/// `br`, `condbr`, `switch`, `indirectbr` and `phi` must never survive into
/// a compiled trace.
fn assert_straight_line(ct: &CompiledTrace) {
    for inst in jit_instrs(ct) {
        match inst.kind {
            InstrKind::Br { .. }
            | InstrKind::CondBr { .. }
            | InstrKind::Switch { .. }
            | InstrKind::IndirectBr { .. }
            | InstrKind::Phi { .. } => panic!(
                "control flow leaked into the trace: {}",
                ct.jitmod.display_instr(inst)
            ),
            _ => (),
        }
    }
}

fn assert_single_trace_func(ct: &CompiledTrace) {
    let traces: Vec<_> = ct
        .jitmod
        .funcs
        .iter()
        .filter(|f| f.name.starts_with(TRACE_FUNC_PREFIX))
        .collect();
    assert_eq!(traces.len(), 1);
    assert!(traces[0].internal);
    assert_eq!(traces[0].blocks.len(), 1);
}

#[test]
fn constant_ret() {
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("f", FuncTy::new(vec![], i32_ty()));
    fb.ret(Some(Operand::Const(Const::i32(30))));
    let f = fb.done();
    build_main(&mut mb, |fb, rp| {
        let r = fb.call(f, vec![]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();
    let before = aot.clone();

    let trace = one_iteration_trace(&[("f", 0)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();

    assert_eq!(aot, before);
    assert_single_trace_func(&ct);
    assert_straight_line(&ct);
    // The callee was inlined, so no call instructions remain.
    assert_eq!(count_calls(&ct), 0);
    // The trace ends in a return of the re-built aggregate.
    match &jit_instrs(&ct).last().unwrap().kind {
        InstrKind::Ret { val: Some(_) } => (),
        k => panic!("expected a valued return, got {:?}", k),
    }

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 30);
    assert_eq!(run_aot_main(&aot), 30);
}

#[test]
fn call_args() {
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("f", FuncTy::new(vec![i32_ty(), i32_ty()], i32_ty()));
    let (a, b) = (fb.param(0), fb.param(1));
    let sum = fb.binop(BinOp::Add, i32_ty(), Operand::Local(a), Operand::Local(b));
    fb.ret(Some(Operand::Local(sum)));
    let f = fb.done();
    build_main(&mut mb, |fb, rp| {
        let r = fb
            .call(
                f,
                vec![
                    Operand::Const(Const::i32(2)),
                    Operand::Const(Const::i32(3)),
                ],
            )
            .unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("f", 0)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);
    assert_eq!(count_calls(&ct), 0);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 5);
    assert_eq!(run_aot_main(&aot), 5);
}

#[test]
fn cascading_conditionals() {
    // foo() with three sequential if-returns; foo(2) takes the third.
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("foo", FuncTy::new(vec![i32_ty()], i32_ty()));
    let num = fb.param(0);
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    let bb3 = fb.new_block();
    let bb4 = fb.new_block();
    let bb5 = fb.new_block();
    let bb6 = fb.new_block();
    let c1 = fb.icmp(CmpPred::Eq, Operand::Local(num), Operand::Const(Const::i32(0)));
    fb.condbr(Operand::Local(c1), bb1, bb2);
    fb.switch_to_block(bb1);
    fb.ret(Some(Operand::Const(Const::i32(1))));
    fb.switch_to_block(bb2);
    let c2 = fb.icmp(CmpPred::Eq, Operand::Local(num), Operand::Const(Const::i32(1)));
    fb.condbr(Operand::Local(c2), bb3, bb4);
    fb.switch_to_block(bb3);
    fb.ret(Some(Operand::Const(Const::i32(2))));
    fb.switch_to_block(bb4);
    let c3 = fb.icmp(CmpPred::Eq, Operand::Local(num), Operand::Const(Const::i32(2)));
    fb.condbr(Operand::Local(c3), bb5, bb6);
    fb.switch_to_block(bb5);
    let d = fb.binop(
        BinOp::Add,
        i32_ty(),
        Operand::Local(num),
        Operand::Const(Const::i32(2)),
    );
    fb.ret(Some(Operand::Local(d)));
    fb.switch_to_block(bb6);
    fb.ret(Some(Operand::Const(Const::i32(0))));
    let foo = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(foo, vec![Operand::Const(Const::i32(2))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("foo", 0), ("foo", 2), ("foo", 4), ("foo", 5)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 4);
    assert_eq!(run_aot_main(&aot), 4);
}

#[test]
fn phi_resolution() {
    // The traced path enters the join block through bb2, so the phi must
    // resolve to the value computed there, and no phi may be emitted.
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("foo", FuncTy::new(vec![i32_ty()], i32_ty()));
    let num = fb.param(0);
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    let bb3 = fb.new_block();
    let c = fb.icmp(CmpPred::Eq, Operand::Local(num), Operand::Const(Const::i32(0)));
    fb.condbr(Operand::Local(c), bb1, bb2);
    fb.switch_to_block(bb1);
    let a = fb.binop(
        BinOp::Add,
        i32_ty(),
        Operand::Local(num),
        Operand::Const(Const::i32(10)),
    );
    fb.br(bb3);
    fb.switch_to_block(bb2);
    let b = fb.binop(
        BinOp::Add,
        i32_ty(),
        Operand::Local(num),
        Operand::Const(Const::i32(20)),
    );
    fb.br(bb3);
    fb.switch_to_block(bb3);
    let p = fb.phi(
        i32_ty(),
        vec![(bb1, Operand::Local(a)), (bb2, Operand::Local(b))],
    );
    fb.ret(Some(Operand::Local(p)));
    let foo = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(foo, vec![Operand::Const(Const::i32(2))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("foo", 0), ("foo", 2), ("foo", 3)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);
    // Only bb2's add was cloned; bb1 never executed.
    let adds = jit_instrs(&ct)
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::BinOp { op: BinOp::Add, .. }))
        .count();
    assert_eq!(adds, 1);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 22);
    assert_eq!(run_aot_main(&aot), 22);
}

#[test]
fn mutable_global() {
    let mut mb = ModuleBuilder::new("t");
    let g = mb.global("global_int", i32_ty(), Some(Const::i32(12)));
    let mut fb = mb.func("foo", FuncTy::new(vec![i32_ty()], i32_ty()));
    let num = fb.param(0);
    fb.store(Operand::Local(num), Operand::Global(g));
    let v = fb.load(i32_ty(), Operand::Global(g));
    fb.ret(Some(Operand::Local(v)));
    let foo = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(foo, vec![Operand::Const(Const::i32(2))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("foo", 0)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);

    // The mutable global is re-declared without an initialiser: it resolves
    // to the program's storage at link time rather than getting a copy.
    let jg: Vec<_> = ct
        .jitmod
        .globals
        .iter()
        .filter(|g| g.name == "global_int")
        .collect();
    assert_eq!(jg.len(), 1);
    assert!(jg[0].init.is_none());

    let (res, interp) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 2);
    assert_eq!(interp.globals["global_int"], ykbh::Val::Int(2));
    assert_eq!(run_aot_main(&aot), 2);
}

#[test]
fn const_global_copied_once() {
    let mut mb = ModuleBuilder::new("t");
    let g = mb.const_global("answer", i32_ty(), Const::i32(42));
    build_main(&mut mb, |fb, rp| {
        // Two separate uses of the same constant global.
        let v1 = fb.load(i32_ty(), Operand::Global(g));
        let v2 = fb.load(i32_ty(), Operand::Global(g));
        let s = fb.binop(BinOp::Sub, i32_ty(), Operand::Local(v1), Operand::Local(v2));
        let t = fb.binop(BinOp::Add, i32_ty(), Operand::Local(s), Operand::Local(v1));
        fb.store(Operand::Local(t), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);

    let copies: Vec<_> = ct
        .jitmod
        .globals
        .iter()
        .filter(|g| g.name == "answer")
        .collect();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].is_const);
    // The initialiser is attached during finalisation.
    assert_eq!(copies[0].init, Some(Const::i32(42)));

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 42);
}

#[test]
fn stop_marker_terminates_emission() {
    let mut mb = ModuleBuilder::new("t");
    build_main(&mut mb, |fb, rp| {
        fb.store(Operand::Const(Const::i32(9)), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();

    // Nothing after the stop marker was emitted: the block containing the
    // stop marker also loads `res` and returns it, and neither appears.
    let instrs = jit_instrs(&ct);
    match &instrs.last().unwrap().kind {
        InstrKind::Ret { val: Some(_) } => (),
        k => panic!("expected a valued return, got {:?}", k),
    }
    // One load from the loop condition; the exit block's load is absent.
    let loads = instrs
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::Load { .. }))
        .count();
    assert_eq!(loads, 1);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 9);
}

#[test]
fn nested_inlining() {
    // main -> f -> g, all with IR: both levels inline.
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("g", FuncTy::new(vec![i32_ty()], i32_ty()));
    let x = fb.param(0);
    let r = fb.binop(
        BinOp::Mul,
        i32_ty(),
        Operand::Local(x),
        Operand::Const(Const::i32(3)),
    );
    fb.ret(Some(Operand::Local(r)));
    let g = fb.done();

    let mut fb = mb.func("f", FuncTy::new(vec![i32_ty()], i32_ty()));
    let x = fb.param(0);
    let gv = fb.call(g, vec![Operand::Local(x)]).unwrap();
    let r = fb.binop(
        BinOp::Add,
        i32_ty(),
        Operand::Local(gv),
        Operand::Const(Const::i32(1)),
    );
    fb.ret(Some(Operand::Local(r)));
    let f = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(f, vec![Operand::Const(Const::i32(7))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("f", 0), ("g", 0), ("f", 0)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);
    assert_eq!(count_calls(&ct), 0);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 22);
    assert_eq!(run_aot_main(&aot), 22);
}

#[test]
fn switch_dropped() {
    // choice() branches through a switch; the trace commits to one case.
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("choice", FuncTy::new(vec![i32_ty()], i32_ty()));
    let n = fb.param(0);
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    fb.switch(Operand::Local(n), bb1, vec![(0, bb1), (2, bb2)]);
    fb.switch_to_block(bb1);
    fb.ret(Some(Operand::Const(Const::i32(1))));
    fb.switch_to_block(bb2);
    fb.ret(Some(Operand::Const(Const::i32(9))));
    let choice = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(choice, vec![Operand::Const(Const::i32(2))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("choice", 0), ("choice", 2)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 9);
    assert_eq!(run_aot_main(&aot), 9);
}

#[test]
fn funcptr_callee_with_ir() {
    // An indirect call whose dynamic target has IR: the next trace entry
    // names the target, and the call is inlined like a direct one.
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("callback", FuncTy::new(vec![], i32_ty()));
    fb.ret(Some(Operand::Const(Const::i32(17))));
    fb.done();

    let fptr_ty = Ty::Func(FuncTy::new(vec![], i32_ty())).ptr_to();
    let gp = mb.global("fptr", fptr_ty.clone(), None);
    build_main(&mut mb, |fb, rp| {
        let target = fb.load(fptr_ty.clone(), Operand::Global(gp));
        let r = fb.icall(i32_ty(), Operand::Local(target), vec![]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("callback", 0)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();
    assert_straight_line(&ct);
    // The body was inlined; no call instruction remains.
    assert!(!jit_instrs(&ct)
        .iter()
        .any(|i| matches!(i.kind, InstrKind::Call { callee: Callee::Indirect(_), .. })));

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 17);
}
