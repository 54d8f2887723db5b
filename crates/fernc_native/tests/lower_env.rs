//! Environment lowering: binding caches, stub environments, stores.

mod common;

use anyhow::Result;
use common::{expect_decline, lower_to_ir};

use fern_pir::{Code, Const, Instr, Op, PirType, SymbolTable, Value};

#[test]
fn ldvar_against_known_env_uses_binding_cache() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(1);
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
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(ld)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("@create_environment"), "missing env ctor:\n{ir}");
    assert!(ir.contains("@create_binding_cell"), "missing cells:\n{ir}");
    assert!(
        ir.contains("@ldvar_cache_miss"),
        "missing cache-miss path:\n{ir}"
    );
    // the cache slot is probed before the runtime is asked
    assert!(ir.contains("ptrtoint"), "missing sentinel probe:\n{ir}");
    assert!(ir.contains("object not found"), "missing unbound error:\n{ir}");
    Ok(())
}

#[test]
fn stub_env_load_reads_slot_and_falls_back_to_parent() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(2);
    let env = c.push(
        c.entry,
        Instr::new(
            Op::MkEnv {
                names: vec![(x, false)],
                stub: true,
                context: 1,
            },
            PirType::env(),
        )
        .with_args(vec![Value::UnboundValue])
        .with_env(Value::GlobalEnv),
    );
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(ld)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(
        ir.contains("@create_stub_environment"),
        "missing stub ctor:\n{ir}"
    );
    // unbound slots defer to the lexical parent through the runtime
    assert!(ir.contains("stubld.miss"), "missing parent fallback:\n{ir}");
    assert!(ir.contains("@ldvar"), "missing runtime lookup:\n{ir}");
    Ok(())
}

#[test]
fn stvar_cache_protocol_reuses_scalar_slots() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(3);
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
    let k2 = c.pool_push(Const::Int(7));
    let val = c.push(
        c.entry,
        Instr::new(Op::LdConst(k2), PirType::simple_scalar_int().not_na()),
    );
    c.push(
        c.entry,
        Instr::new(
            Op::StVar {
                name: x,
                is_starg: false,
            },
            PirType::any(),
        )
        .with_args(vec![Value::Instr(val)])
        .with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // an unshared scalar-int binding is updated in place
    assert!(ir.contains("st.intwrite"), "missing in-place arm:\n{ir}");
    assert!(ir.contains("@stvar_int"), "missing unboxed store miss:\n{ir}");
    assert!(ir.contains("@set_car"), "missing barriered cell write:\n{ir}");
    Ok(())
}

#[test]
fn stub_store_compares_before_writing() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(4);
    let env = c.push(
        c.entry,
        Instr::new(
            Op::MkEnv {
                names: vec![(x, false)],
                stub: true,
                context: 1,
            },
            PirType::env(),
        )
        .with_args(vec![Value::Nil])
        .with_env(Value::GlobalEnv),
    );
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(
            Op::StVar {
                name: x,
                is_starg: false,
            },
            PirType::any(),
        )
        .with_args(vec![Value::Instr(ld)])
        .with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("stubst.same"), "missing identity arm:\n{ir}");
    assert!(ir.contains("stubst.diff"), "missing write arm:\n{ir}");
    // the stub write is barriered; the slow arm goes to the runtime
    assert!(
        ir.contains("@external_set_entry"),
        "missing barriered stub write:\n{ir}"
    );
    Ok(())
}

#[test]
fn super_store_into_stub_parent_is_declined() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(5);
    let stub = c.push(
        c.entry,
        Instr::new(
            Op::MkEnv {
                names: vec![(x, false)],
                stub: true,
                context: 1,
            },
            PirType::env(),
        )
        .with_args(vec![Value::Nil])
        .with_env(Value::GlobalEnv),
    );
    let k = c.pool_push(Const::Int(1));
    let val = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    c.push(
        c.entry,
        Instr::new(Op::StVarSuper(x), PirType::any())
            .with_args(vec![Value::Instr(val)])
            .with_env(Value::Instr(stub)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    expect_decline(&c, &syms)
}

#[test]
fn fresh_environment_invalidates_its_cache_slots() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(6);
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
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::Instr(env)),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(ld)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // sentinel stores appear both at entry and after create_environment
    let stores = ir.matches("store ptr null").count();
    assert!(stores >= 2, "expected entry + post-creation sentinels:\n{ir}");
    Ok(())
}
