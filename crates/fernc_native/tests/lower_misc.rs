//! Promises, coercions, copies and the remaining small opcodes.

mod common;

use anyhow::Result;
use common::lower_to_ir;

use fern_pir::{
    BaseKind, Code, Const, Effect, Effects, Instr, Op, PirType, SymbolTable, Value,
};

#[test]
fn effectful_force_goes_through_the_runtime() -> Result<()> {
    let mut syms = SymbolTable::new();
    let p = syms.intern("p");
    let mut c = Code::new(1);
    let ld = c.push(
        c.entry,
        Instr::new(
            Op::LdDots,
            PirType::new(BaseKind::Promise).or_lazy(),
        )
        .with_env(Value::GlobalEnv),
    );
    let _ = p;
    let forced = c.push(
        c.entry,
        Instr::new(Op::Force, PirType::any())
            .with_args(vec![Value::Instr(ld)])
            .with_effects(Effects::of(Effect::Force)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(forced)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("@force_promise"), "missing eval path:\n{ir}");
    // already-forced promises read their payload without a call
    assert!(ir.contains("force.promval"), "missing CAR shortcut:\n{ir}");
    Ok(())
}

#[test]
fn effect_free_force_only_depromises() -> Result<()> {
    let mut syms = SymbolTable::new();
    let mut c = Code::new(2);
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdDots, PirType::new(BaseKind::Promise)).with_env(Value::GlobalEnv),
    );
    let forced = c.push(
        c.entry,
        Instr::new(Op::Force, PirType::any()).with_args(vec![Value::Instr(ld)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(forced)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(
        !ir.contains("@force_promise"),
        "non-effectful force must not evaluate:\n{ir}"
    );
    assert!(ir.contains("deprom.prom"), "missing depromise:\n{ir}");
    Ok(())
}

#[test]
fn as_test_raises_on_na() -> Result<()> {
    let mut c = Code::new(3);
    let k = c.pool_push(Const::Lgl(1));
    let a = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_lgl()),
    );
    let t = c.push(
        c.entry,
        Instr::new(Op::AsTest, PirType::test()).with_args(vec![Value::Instr(a)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Branch, PirType::any()).with_args(vec![Value::Instr(t)]),
    );
    let yes = c.add_block();
    let no = c.add_block();
    c.set_cond(c.entry, yes, no);
    c.push(
        yes,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::True]),
    );
    c.push(
        no,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::False]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(
        ir.contains("missing value where TRUE/FALSE needed"),
        "missing NA error:\n{ir}"
    );
    assert!(ir.contains("@error"), "errors go through the runtime:\n{ir}");
    Ok(())
}

#[test]
fn ldarg_reads_the_incoming_frame() -> Result<()> {
    let mut c = Code::new(4);
    let a = c.push(c.entry, Instr::new(Op::LdArg(2), PirType::any()));
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(a)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("%args"), "argument loads use the args param:\n{ir}");
    assert!(ir.contains("%arg"), "missing cell read:\n{ir}");
    Ok(())
}

#[test]
fn identical_compares_pointers_after_depromising() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(5);
    let a = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::GlobalEnv),
    );
    let same = c.push(
        c.entry,
        Instr::new(Op::Identical, PirType::test())
            .with_args(vec![Value::Instr(a), Value::Instr(a)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(same)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("deprom.prom"), "identity peels promises:\n{ir}");
    assert!(ir.contains("icmp eq ptr"), "missing pointer compare:\n{ir}");
    Ok(())
}

#[test]
fn phi_inputs_are_copied_at_predecessor_exits() -> Result<()> {
    let mut c = Code::new(6);
    let k = c.pool_push(Const::Int(1));
    let cond = c.push(c.entry, Instr::new(Op::LdConst(k), PirType::test()));
    c.push(
        c.entry,
        Instr::new(Op::Branch, PirType::any()).with_args(vec![Value::Instr(cond)]),
    );
    let left = c.add_block();
    let right = c.add_block();
    let join = c.add_block();
    c.set_cond(c.entry, left, right);

    let k3 = c.pool_push(Const::Int(3));
    let k4 = c.pool_push(Const::Int(4));
    let x = c.push(
        left,
        Instr::new(Op::LdConst(k3), PirType::simple_scalar_int().not_na()),
    );
    let xc = c.push(
        left,
        Instr::new(Op::PirCopy, PirType::simple_scalar_int().not_na())
            .with_args(vec![Value::Instr(x)]),
    );
    c.set_jump(left, join);
    let y = c.push(
        right,
        Instr::new(Op::LdConst(k4), PirType::simple_scalar_int().not_na()),
    );
    let yc = c.push(
        right,
        Instr::new(Op::PirCopy, PirType::simple_scalar_int().not_na())
            .with_args(vec![Value::Instr(y)]),
    );
    c.set_jump(right, join);

    let phi = c.push(
        join,
        Instr::new(
            Op::Phi {
                inputs: vec![(left, Value::Instr(xc)), (right, Value::Instr(yc))],
            },
            PirType::simple_scalar_int().not_na(),
        ),
    );
    c.push(
        join,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(phi)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    // the phi lives in a mutable alloca updated by both predecessors
    assert!(ir.contains("alloca i32"), "phi storage is an alloca:\n{ir}");
    let stores = ir.matches("store i32").count();
    assert!(stores >= 2, "both predecessors must write the phi:\n{ir}");
    Ok(())
}

#[test]
fn visibility_ops_write_the_runtime_flag() -> Result<()> {
    let mut c = Code::new(7);
    c.push(c.entry, Instr::new(Op::Invisible, PirType::any()));
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("store i32 0"), "missing flag store:\n{ir}");
    Ok(())
}
