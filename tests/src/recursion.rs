//! Recursion is outlined, not unrolled: a recursive call becomes a single
//! call to the AOT-compiled function and the traced body is skipped.

use crate::helpers::{build_main, i32_ty, one_iteration_trace, run_aot_main, run_compiled_trace};
use ykcompile::{compile_trace, CompiledTrace, FuncAddrs};
use ykir::{BinOp, Callee, CmpPred, Const, FuncTy, InstrKind, ModuleBuilder, Operand};

fn calls_to(ct: &CompiledTrace, name: &str) -> usize {
    ct.jitmod.funcs[0].blocks[0]
        .instrs
        .iter()
        .filter(|i| match &i.kind {
            InstrKind::Call {
                callee: Callee::Func(f),
                ..
            } => ct.jitmod.func(*f).name == name,
            _ => false,
        })
        .count()
}

#[test]
fn self_call_outlined_once() {
    // f(n) = n == 0 ? 5 : f(n - 1), traced as f(1).
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("f", FuncTy::new(vec![i32_ty()], i32_ty()));
    let n = fb.param(0);
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    let bb3 = fb.new_block();
    let c = fb.icmp(CmpPred::Eq, Operand::Local(n), Operand::Const(Const::i32(0)));
    fb.condbr(Operand::Local(c), bb1, bb2);
    fb.switch_to_block(bb1);
    fb.ret(Some(Operand::Const(Const::i32(5))));
    fb.switch_to_block(bb2);
    let m = fb.binop(
        BinOp::Sub,
        i32_ty(),
        Operand::Local(n),
        Operand::Const(Const::i32(1)),
    );
    let r = fb.call(fb.func_idx(), vec![Operand::Local(m)]).unwrap();
    fb.br(bb3);
    fb.switch_to_block(bb3);
    fb.ret(Some(Operand::Local(r)));
    let f = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(f, vec![Operand::Const(Const::i32(1))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    // The recursive call's traced body (f(0): bb0, bb1) appears between the
    // two listings of f's bb2.
    let trace = one_iteration_trace(&[
        ("f", 0),
        ("f", 2),
        ("f", 0),
        ("f", 1),
        ("f", 2),
        ("f", 3),
    ]);
    let faddrs = FuncAddrs::from_arrays(&["f"], &[0x1234]);
    let ct = compile_trace(&aot, &trace, &faddrs).unwrap();

    // Exactly one call to f, and its address binding is installed.
    assert_eq!(calls_to(&ct, "f"), 1);
    assert_eq!(ct.global_mappings.get("f"), Some(&0x1234));
    let decl = ct.jitmod.funcs.iter().find(|fun| fun.name == "f").unwrap();
    assert!(decl.is_declaration());

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 5);
    assert_eq!(run_aot_main(&aot), 5);
}

#[test]
fn fib_not_unrolled() {
    let mut mb = ModuleBuilder::new("t");
    let mut fb = mb.func("fib", FuncTy::new(vec![i32_ty()], i32_ty()));
    let n = fb.param(0);
    let bb1 = fb.new_block();
    let bb2 = fb.new_block();
    let bb3 = fb.new_block();
    let bb4 = fb.new_block();
    let bb5 = fb.new_block();
    let bb6 = fb.new_block();
    let c1 = fb.icmp(CmpPred::Eq, Operand::Local(n), Operand::Const(Const::i32(0)));
    fb.condbr(Operand::Local(c1), bb1, bb2);
    fb.switch_to_block(bb1);
    fb.ret(Some(Operand::Const(Const::i32(0))));
    fb.switch_to_block(bb2);
    let c2 = fb.icmp(CmpPred::Eq, Operand::Local(n), Operand::Const(Const::i32(1)));
    fb.condbr(Operand::Local(c2), bb3, bb4);
    fb.switch_to_block(bb3);
    fb.ret(Some(Operand::Const(Const::i32(1))));
    fb.switch_to_block(bb4);
    let c3 = fb.icmp(CmpPred::Eq, Operand::Local(n), Operand::Const(Const::i32(2)));
    fb.condbr(Operand::Local(c3), bb5, bb6);
    fb.switch_to_block(bb5);
    fb.ret(Some(Operand::Const(Const::i32(1))));
    fb.switch_to_block(bb6);
    let n2 = fb.binop(
        BinOp::Sub,
        i32_ty(),
        Operand::Local(n),
        Operand::Const(Const::i32(2)),
    );
    let a = fb.call(fb.func_idx(), vec![Operand::Local(n2)]).unwrap();
    let n1 = fb.binop(
        BinOp::Sub,
        i32_ty(),
        Operand::Local(n),
        Operand::Const(Const::i32(1)),
    );
    let b = fb.call(fb.func_idx(), vec![Operand::Local(n1)]).unwrap();
    let s = fb.binop(BinOp::Add, i32_ty(), Operand::Local(a), Operand::Local(b));
    fb.ret(Some(Operand::Local(s)));
    let fib = fb.done();

    build_main(&mut mb, |fb, rp| {
        let r = fb.call(fib, vec![Operand::Const(Const::i32(8))]).unwrap();
        fb.store(Operand::Local(r), Operand::Local(rp));
    });
    let aot = mb.build();

    // fib(8) reaches bb6; each recursive call is outlined, with a short
    // traced body between the re-listings of bb6.
    let trace = one_iteration_trace(&[
        ("fib", 0),
        ("fib", 2),
        ("fib", 4),
        ("fib", 6),
        ("fib", 0),
        ("fib", 1),
        ("fib", 6),
        ("fib", 0),
        ("fib", 3),
        ("fib", 6),
    ]);
    let faddrs = FuncAddrs::from_arrays(&["fib"], &[0xf1b]);
    let ct = compile_trace(&aot, &trace, &faddrs).unwrap();

    // Both call sites survive as calls; neither body was inlined.
    assert_eq!(calls_to(&ct, "fib"), 2);
    assert_eq!(ct.global_mappings.get("fib"), Some(&0xf1b));

    let (res, _) = run_compiled_trace(&aot, &ct);
    assert_eq!(res, 21);
    assert_eq!(run_aot_main(&aot), 21);
}
