//! Vector access lowering: guarded fast paths with runtime fallbacks.

mod common;

use anyhow::Result;
use common::lower_to_ir;

use fern_pir::{Code, Const, Instr, Op, PirType, SymbolTable, Value};

#[test]
fn scalar_extract_from_real_vector_loads_directly() -> Result<()> {
    let mut syms = SymbolTable::new();
    let v = syms.intern("v");
    let mut c = Code::new(1);
    // a plain real vector, no attributes, no object bit
    let vec = c.push(
        c.entry,
        Instr::new(Op::LdVar(v), PirType::real().not_object().no_attribs())
            .with_env(Value::GlobalEnv),
    );
    let k = c.pool_push(Const::Int(2));
    let idx = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int().not_na()),
    );
    let elt = c.push(
        c.entry,
        Instr::new(Op::Extract2_1D, PirType::simple_scalar_real())
            .with_args(vec![Value::Instr(vec), Value::Instr(idx)])
            .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(elt)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // fast path: direct element load joined with the runtime fallback
    assert!(ir.contains("load double"), "missing direct load:\n{ir}");
    assert!(ir.contains("phi double"), "missing fast/slow join:\n{ir}");
    assert!(ir.contains("@extract21i"), "missing typed fallback:\n{ir}");
    // bounds and altrep guards
    assert!(ir.contains("icmp uge i64"), "missing bounds check:\n{ir}");
    assert!(ir.contains("branch_weights"), "guards carry weights:\n{ir}");
    Ok(())
}

#[test]
fn one_based_index_is_decremented_and_checked() -> Result<()> {
    let mut syms = SymbolTable::new();
    let v = syms.intern("v");
    let mut c = Code::new(2);
    let vec = c.push(
        c.entry,
        Instr::new(Op::LdVar(v), PirType::int().not_object().no_attribs())
            .with_env(Value::GlobalEnv),
    );
    let k = c.pool_push(Const::Int(4));
    let idx = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    let elt = c.push(
        c.entry,
        Instr::new(Op::Extract2_1D, PirType::simple_scalar_int())
            .with_args(vec![Value::Instr(vec), Value::Instr(idx)])
            .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(elt)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // 1-based to 0-based
    assert!(ir.contains("sub nsw i64"), "missing index decrement:\n{ir}");
    // a maybe-NA integer index checks the sentinel before converting
    assert!(ir.contains("-2147483648"), "missing NA index check:\n{ir}");
    Ok(())
}

#[test]
fn matrix_extract_computes_column_major_offset() -> Result<()> {
    let mut syms = SymbolTable::new();
    let m = syms.intern("m");
    let mut c = Code::new(3);
    let vec = c.push(
        c.entry,
        Instr::new(Op::LdVar(m), PirType::real().not_object().no_attribs())
            .with_env(Value::GlobalEnv),
    );
    let k1 = c.pool_push(Const::Int(1));
    let k2 = c.pool_push(Const::Int(2));
    let i1 = c.push(
        c.entry,
        Instr::new(Op::LdConst(k1), PirType::simple_scalar_int().not_na()),
    );
    let i2 = c.push(
        c.entry,
        Instr::new(Op::LdConst(k2), PirType::simple_scalar_int().not_na()),
    );
    let elt = c.push(
        c.entry,
        Instr::new(Op::Extract2_2D, PirType::simple_scalar_real())
            .with_args(vec![Value::Instr(vec), Value::Instr(i1), Value::Instr(i2)])
            .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(elt)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("@matrix_nrows"), "missing nrow query:\n{ir}");
    assert!(ir.contains("@matrix_ncols"), "missing ncol query:\n{ir}");
    assert!(ir.contains("mul nsw i64"), "missing row scaling:\n{ir}");
    assert!(ir.contains("@extract22rr") || ir.contains("@extract22ii"),
        "missing typed fallback:\n{ir}");
    Ok(())
}

#[test]
fn subassign_guards_against_shared_vectors() -> Result<()> {
    let mut syms = SymbolTable::new();
    let v = syms.intern("v");
    let mut c = Code::new(4);
    let vec = c.push(
        c.entry,
        Instr::new(Op::LdVar(v), PirType::int().not_object().no_attribs())
            .with_env(Value::GlobalEnv),
    );
    let ki = c.pool_push(Const::Int(1));
    let kv = c.pool_push(Const::Int(42));
    let idx = c.push(
        c.entry,
        Instr::new(Op::LdConst(ki), PirType::simple_scalar_int().not_na()),
    );
    let val = c.push(
        c.entry,
        Instr::new(Op::LdConst(kv), PirType::simple_scalar_int().not_na()),
    );
    let st = c.push(
        c.entry,
        Instr::new(Op::Subassign2_1D, PirType::int().not_object().no_attribs())
            .with_args(vec![Value::Instr(vec), Value::Instr(idx), Value::Instr(val)])
            .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(st)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    // the named-count gate decides whether in-place update is legal
    assert!(ir.contains("sa.unshared"), "missing shared guard:\n{ir}");
    assert!(ir.contains("store i32"), "missing in-place store:\n{ir}");
    assert!(ir.contains("@subassign21ii"), "missing typed fallback:\n{ir}");
    Ok(())
}

#[test]
fn three_dimensional_access_always_calls_runtime() -> Result<()> {
    let mut syms = SymbolTable::new();
    let a = syms.intern("a");
    let mut c = Code::new(5);
    let vec = c.push(
        c.entry,
        Instr::new(Op::LdVar(a), PirType::real()).with_env(Value::GlobalEnv),
    );
    let k = c.pool_push(Const::Int(1));
    let i1 = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    let elt = c.push(
        c.entry,
        Instr::new(Op::Extract1_3D, PirType::any())
            .with_args(vec![
                Value::Instr(vec),
                Value::Instr(i1),
                Value::Instr(i1),
                Value::Instr(i1),
            ])
            .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(elt)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("@extract13"), "missing runtime call:\n{ir}");
    assert!(!ir.contains("ext.fallback"), "3-D has no fast path:\n{ir}");
    Ok(())
}
