//! Arithmetic lowering: unboxed fast paths, NA propagation, operator
//! special cases.

mod common;

use anyhow::Result;
use common::lower_to_ir;

use fern_pir::{Code, Const, Instr, Op, PirType, SymbolTable, Value};

fn int_const(c: &mut Code, v: i32) -> Value {
    let idx = c.pool_push(Const::Int(v));
    let i = c.push(
        c.entry,
        Instr::new(Op::LdConst(idx), PirType::simple_scalar_int().not_na()),
    );
    Value::Instr(i)
}

#[test]
fn int_add_is_native_and_boxes_on_return() -> Result<()> {
    let mut c = Code::new(1);
    let a = int_const(&mut c, 3);
    let b = int_const(&mut c, 4);
    let sum = c.push(
        c.entry,
        Instr::new(Op::Add, PirType::simple_scalar_int().not_na()).with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("add nsw i32"), "expected a native add:\n{ir}");
    // the boxed return goes through the allocator exactly once
    assert!(ir.contains("call ptr @box_int"), "missing boxing:\n{ir}");
    assert!(
        !ir.contains("@binop"),
        "fast path must not call the runtime:\n{ir}"
    );
    Ok(())
}

#[test]
fn maybe_na_int_operand_gets_a_check() -> Result<()> {
    let mut c = Code::new(2);
    let idx = c.pool_push(Const::Int(fernc_native::constants::NA_INT));
    let na = c.push(
        c.entry,
        Instr::new(Op::LdConst(idx), PirType::simple_scalar_int()),
    );
    let one = int_const(&mut c, 1);
    let sum = c.push(
        c.entry,
        Instr::new(Op::Add, PirType::simple_scalar_int())
            .with_args(vec![Value::Instr(na), one]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    // the NA sentinel appears both as the constant and in the check
    assert!(ir.contains("-2147483648"), "missing NA handling:\n{ir}");
    assert!(ir.contains("binop.na"), "missing NA branch:\n{ir}");
    Ok(())
}

#[test]
fn real_add_uses_fp_unit_without_checks() -> Result<()> {
    let mut c = Code::new(3);
    let k = c.pool_push(Const::Real(1.5));
    let a = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_real()),
    );
    let sum = c.push(
        c.entry,
        Instr::new(Op::Add, PirType::simple_scalar_real())
            .with_args(vec![Value::Instr(a), Value::Instr(a)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("fadd double"), "expected fp add:\n{ir}");
    assert!(ir.contains("call ptr @box_real"), "missing boxing:\n{ir}");
    // NaN carries the NA, no branch needed
    assert!(!ir.contains("binop.na"), "unexpected NA branch:\n{ir}");
    Ok(())
}

#[test]
fn boxed_operand_falls_back_to_runtime_binop() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(4);
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::int()).with_env(Value::GlobalEnv),
    );
    let one = int_const(&mut c, 1);
    let sum = c.push(
        c.entry,
        Instr::new(Op::Add, PirType::int())
            .with_args(vec![Value::Instr(ld), one])
            .with_src(7),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sum)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("call ptr @binop"), "expected runtime binop:\n{ir}");
    Ok(())
}

#[test]
fn relational_result_is_int_boolean_with_na() -> Result<()> {
    let mut c = Code::new(5);
    let a = int_const(&mut c, 1);
    let b = int_const(&mut c, 2);
    let lt = c.push(
        c.entry,
        Instr::new(Op::Lt, PirType::simple_scalar_lgl()).with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(lt)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("icmp slt i32"), "expected signed compare:\n{ir}");
    assert!(ir.contains("zext i1"), "expected 0/1 widening:\n{ir}");
    assert!(ir.contains("relop.na"), "relops always check NA:\n{ir}");
    Ok(())
}

#[test]
fn integer_division_by_zero_yields_na() -> Result<()> {
    let mut c = Code::new(6);
    let a = int_const(&mut c, 7);
    let b = int_const(&mut c, 0);
    let q = c.push(
        c.entry,
        Instr::new(Op::IDiv, PirType::simple_scalar_int()).with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(q)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("idiv.zero"), "missing zero-divisor arm:\n{ir}");
    assert!(ir.contains("llvm.floor.f64"), "integer idiv floors:\n{ir}");
    Ok(())
}

#[test]
fn modulo_has_native_and_fmod_arms() -> Result<()> {
    let mut c = Code::new(7);
    let a = int_const(&mut c, 9);
    let b = int_const(&mut c, 4);
    let m = c.push(
        c.entry,
        Instr::new(Op::Mod, PirType::simple_scalar_int()).with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(m)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("srem i32"), "missing native remainder:\n{ir}");
    assert!(
        ir.contains("probable complete loss of accuracy"),
        "missing accuracy warning on the fmod arm:\n{ir}"
    );
    Ok(())
}

#[test]
fn not_maps_na_to_na() -> Result<()> {
    let mut c = Code::new(8);
    let idx = c.pool_push(Const::Lgl(1));
    let a = c.push(
        c.entry,
        Instr::new(Op::LdConst(idx), PirType::simple_scalar_lgl()),
    );
    let n = c.push(
        c.entry,
        Instr::new(Op::Not, PirType::simple_scalar_lgl()).with_args(vec![Value::Instr(a)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(n)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("not.na"), "missing NA arm:\n{ir}");
    assert!(ir.contains("icmp eq i32"), "missing zero test:\n{ir}");
    Ok(())
}
