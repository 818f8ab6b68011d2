//! Calls that leave IR-covered code: external functions, unmappable holes,
//! and the dropped indirect branch.

use crate::helpers::{build_main, i32_ty, one_iteration_trace, run_compiled_trace};
use ykcompile::{compile_trace, FuncAddrs};
use ykir::{BinOp, Callee, Const, FuncTy, InstrKind, ModuleBuilder, Operand, Ty};
use yktrace::IrTrace;

#[test]
fn call_ext_varargs() {
    // printf has no IR: the trace skips through a hole, the JIT module
    // declares it externally and emits exactly one call.
    let mut mb = ModuleBuilder::new("t");
    let fmt_bytes = b"abc%d%d%d\n\0".to_vec();
    let fmt_ty = Ty::Array {
        elem: Box::new(Ty::Int(8)),
        len: fmt_bytes.len() as u64,
    };
    let fmt = mb.const_global("fmt", fmt_ty, Const::Str(fmt_bytes.clone()));
    let printf = mb.declare_func(
        "printf",
        FuncTy::new_vararg(vec![Ty::Int(8).ptr_to()], i32_ty()),
    );
    build_main(&mut mb, |fb, rp| {
        let x = fb.load(i32_ty(), Operand::Local(rp));
        let x0 = fb.binop(BinOp::Add, i32_ty(), Operand::Local(x), Operand::Const(Const::i32(1)));
        let x1 = fb.binop(BinOp::Add, i32_ty(), Operand::Local(x0), Operand::Const(Const::i32(1)));
        let x2 = fb.binop(BinOp::Add, i32_ty(), Operand::Local(x0), Operand::Const(Const::i32(2)));
        fb.call(
            printf,
            vec![
                Operand::Global(fmt),
                Operand::Local(x0),
                Operand::Local(x1),
                Operand::Local(x2),
            ],
        );
        fb.store(Operand::Const(Const::i32(1)), Operand::Local(rp));
    });
    let aot = mb.build();

    // The hole sits where execution disappeared into printf.
    let trace = IrTrace::from_arrays(
        &[
            Some("main"),
            Some("main"),
            None,
            Some("main"),
            Some("main"),
            Some("main"),
            Some("main"),
        ],
        &[1, 2, 0, 2, 1, 1, 3],
    );
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();

    let decl = ct
        .jitmod
        .funcs
        .iter()
        .find(|f| f.name == "printf")
        .expect("printf not declared");
    assert!(decl.is_declaration());
    assert!(decl.ty.is_vararg);

    let printf_calls = ct.jitmod.funcs[0].blocks[0]
        .instrs
        .iter()
        .filter(|i| match &i.kind {
            InstrKind::Call {
                callee: Callee::Func(f),
                ..
            } => ct.jitmod.func(*f).name == "printf",
            _ => false,
        })
        .count();
    assert_eq!(printf_calls, 1);

    // The format string is a constant global: copied once, initialiser
    // preserved.
    let fmts: Vec<_> = ct
        .jitmod
        .globals
        .iter()
        .filter(|g| g.name == "fmt")
        .collect();
    assert_eq!(fmts.len(), 1);
    assert_eq!(fmts[0].init, Some(Const::Str(fmt_bytes)));
}

#[test]
fn hole_only_after_external_call() {
    // The same program, but with the hole in a position no external call
    // justifies.
    let mut mb = ModuleBuilder::new("t");
    build_main(&mut mb, |fb, rp| {
        fb.store(Operand::Const(Const::i32(1)), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = IrTrace::from_arrays(&[Some("main"), None, Some("main")], &[1, 0, 2]);
    assert_eq!(
        compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap_err(),
        yktrace::InvalidTraceError::UnexpectedHole(1)
    );
}

#[test]
fn indirect_branch_operand_deleted() {
    // The indirect branch is dropped and its address operand transitively
    // erased, including the global it was loaded from.
    let mut mb = ModuleBuilder::new("t");
    let jt = mb.global("jump_target", Ty::Int(8).ptr_to(), None);
    let mut fb = mb.func("h", FuncTy::new(vec![], i32_ty()));
    let bb1 = fb.new_block();
    let t = fb.load(Ty::Int(8).ptr_to(), Operand::Global(jt));
    fb.indirectbr(Operand::Local(t), vec![bb1]);
    fb.switch_to_block(bb1);
    fb.ret(Some(Operand::Const(Const::i32(7))));
    let h = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(h, vec![]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    let trace = one_iteration_trace(&[("h", 0), ("h", 1)]);
    let ct = compile_trace(&aot, &trace, &FuncAddrs::new()).unwrap();

    let instrs = &ct.jitmod.funcs[0].blocks[0].instrs;
    assert!(!instrs
        .iter()
        .any(|i| matches!(i.kind, InstrKind::IndirectBr { .. })));
    // Only the loop condition's load survives; the address load is gone.
    let loads = instrs
        .iter()
        .filter(|i| matches!(i.kind, InstrKind::Load { .. }))
        .count();
    assert_eq!(loads, 1);
    assert!(!ct.jitmod.globals.iter().any(|g| g.name == "jump_target"));

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 7);
}
