//! Push/pop call contexts: setjmp arming, restart restoration, result
//! funneling.

mod common;

use anyhow::Result;
use common::lower_to_ir;

use fern_pir::{Code, Const, Effect, Effects, Instr, Op, PirType, SymbolTable, Value};
use fernc_native::runtime::SETJMP_NAME;

fn push_pop_code() -> (Code, SymbolTable) {
    let mut syms = SymbolTable::new();
    let f = syms.intern("f");
    let mut c = Code::new(1);
    let k = c.pool_push(Const::Int(7));
    let i = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int().not_na()),
    );
    // keep the scalar alive across the context so it must be snapshotted
    let kept = c.push(
        c.entry,
        Instr::new(Op::Inc, PirType::simple_scalar_int().not_na())
            .with_args(vec![Value::Instr(i)]),
    );
    let ast = c.pool_push(Const::Nil);
    let ast_ld = c.push(c.entry, Instr::new(Op::LdConst(ast), PirType::any()));
    let op_ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(f), PirType::closure()).with_env(Value::GlobalEnv),
    );
    let push = c.push(
        c.entry,
        Instr::new(Op::PushContext, PirType::any())
            .with_args(vec![Value::Instr(ast_ld), Value::Instr(op_ld)])
            .with_env(Value::GlobalEnv)
            .with_effects(Effects::of(Effect::Force)),
    );
    let body = c.push(
        c.entry,
        Instr::new(Op::Inc, PirType::simple_scalar_int().not_na())
            .with_args(vec![Value::Instr(kept)]),
    );
    let popped = c.push(
        c.entry,
        Instr::new(
            Op::PopContext { push },
            PirType::simple_scalar_int().not_na(),
        )
        .with_args(vec![Value::Instr(body)]),
    );
    let sum = c.push(
        c.entry,
        Instr::new(Op::Add, PirType::simple_scalar_int().not_na())
            .with_args(vec![Value::Instr(popped), Value::Instr(kept)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
    );
    (c, syms)
}

#[test]
fn context_arms_setjmp_with_three_exits() -> Result<()> {
    let (c, syms) = push_pop_code();
    let ir = lower_to_ir(&c, &syms)?;
    assert!(
        ir.contains(&format!("@{}", SETJMP_NAME)),
        "missing setjmp call:\n{ir}"
    );
    assert!(
        ir.contains("@begin_closure_context"),
        "missing context init:\n{ir}"
    );
    assert!(
        ir.contains("@end_closure_context"),
        "missing context teardown:\n{ir}"
    );
    // the three continuations
    assert!(ir.contains("ctx.cont"), "missing fall-through:\n{ir}");
    assert!(ir.contains("ctx.restart"), "missing restart exit:\n{ir}");
    assert!(ir.contains("ctx.return"), "missing return exit:\n{ir}");
    Ok(())
}

#[test]
fn live_scalars_are_snapshotted_into_allocas() -> Result<()> {
    let (c, syms) = push_pop_code();
    let ir = lower_to_ir(&c, &syms)?;
    // the kept value lives in a mutable alloca and a saved copy
    assert!(ir.contains("alloca i32"), "missing scalar storage:\n{ir}");
    assert!(ir.contains("%saved"), "missing snapshot alloca:\n{ir}");
    Ok(())
}

#[test]
fn restart_clears_the_binding_cache() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let f = syms.intern("f");
    let mut c = Code::new(2);
    let k = c.pool_push(Const::Int(1));
    let init = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    let env = c.push(
        c.entry,
        Instr::new(
            Op::MkEnv {
                names: vec![(x, false)],
                stub: false,
                context: 1,
            },
            PirType::env(),
        )
        .with_args(vec![Value::Instr(init)])
        .with_env(Value::GlobalEnv),
    );
    let ast = c.pool_push(Const::Nil);
    let ast_ld = c.push(c.entry, Instr::new(Op::LdConst(ast), PirType::any()));
    let op_ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(f), PirType::closure()).with_env(Value::GlobalEnv),
    );
    let push = c.push(
        c.entry,
        Instr::new(Op::PushContext, PirType::any())
            .with_args(vec![Value::Instr(ast_ld), Value::Instr(op_ld)])
            .with_env(Value::Instr(env)),
    );
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::Instr(env)),
    );
    let popped = c.push(
        c.entry,
        Instr::new(Op::PopContext { push }, PirType::any())
            .with_args(vec![Value::Instr(ld)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(popped)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // entry sentinel, MkEnv invalidation, and the restart sweep
    let nulls = ir.matches("store ptr null").count();
    assert!(nulls >= 3, "restart must reset cache slots:\n{ir}");
    assert!(ir.contains("ctx.restart"), "missing restart path:\n{ir}");
    Ok(())
}

#[test]
fn returned_value_unboxes_into_the_result_slot() -> Result<()> {
    let (c, syms) = push_pop_code();
    let ir = lower_to_ir(&c, &syms)?;
    // the pop's result representation is Int32, so the longjmp value
    // must be unboxed before being stored
    assert!(ir.contains("%ctxres"), "missing result alloca:\n{ir}");
    assert!(ir.contains("ctx.return"), "missing return path:\n{ir}");
    assert!(ir.contains("@box_int"), "pop target reboxes for teardown:\n{ir}");
    Ok(())
}
