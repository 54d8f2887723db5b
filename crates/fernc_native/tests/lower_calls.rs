//! Call lowering: frame protocol, static dispatch, safe-builtin inlining.

mod common;

use anyhow::Result;
use common::lower_to_ir;

use fern_pir::instr::NativeTarget;
use fern_pir::{Builtin, Code, Const, Instr, Op, PirType, SymbolTable, Value};

fn int_const(c: &mut Code, v: i32) -> Value {
    let idx = c.pool_push(Const::Int(v));
    let i = c.push(
        c.entry,
        Instr::new(Op::LdConst(idx), PirType::simple_scalar_int().not_na()),
    );
    Value::Instr(i)
}

#[test]
fn generic_call_reserves_and_pops_a_frame() -> Result<()> {
    let mut syms = SymbolTable::new();
    let f = syms.intern("f");
    let mut c = Code::new(1);
    let cls = c.push(
        c.entry,
        Instr::new(Op::LdVar(f), PirType::closure()).with_env(Value::GlobalEnv),
    );
    let a = int_const(&mut c, 1);
    let b = int_const(&mut c, 2);
    let call = c.push(
        c.entry,
        Instr::new(Op::Call { assumptions: 5 }, PirType::any())
            .with_args(vec![Value::Instr(cls), a, b])
            .with_env(Value::GlobalEnv)
            .with_src(3),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(call)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(ir.contains("call ptr @call"), "missing call runtime:\n{ir}");
    // the frame is zero-tagged before arguments land in it
    assert!(ir.contains("llvm.memset"), "missing tag zeroing:\n{ir}");
    assert!(ir.contains("i64 5"), "assumptions travel with the call:\n{ir}");
    Ok(())
}

#[test]
fn static_call_with_noreflection_target_is_direct() -> Result<()> {
    let mut c = Code::new(2);
    let a = int_const(&mut c, 1);
    let call = c.push(
        c.entry,
        Instr::new(
            Op::StaticCall {
                callee_addr: 0xC10C0,
                target: Some(NativeTarget {
                    code_addr: 0xC0DE0,
                    fn_addr: Some(0xF00D0),
                    no_reflection: true,
                }),
                assumptions: 1,
            },
            PirType::any(),
        )
        .with_args(vec![a])
        .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(call)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    // direct entry, no trampoline
    assert!(
        !ir.contains("@native_call_trampoline"),
        "no-reflection targets bypass the trampoline:\n{ir}"
    );
    assert!(ir.contains("staticcall"), "missing direct invocation:\n{ir}");
    Ok(())
}

#[test]
fn static_call_without_body_uses_trampoline() -> Result<()> {
    let mut c = Code::new(3);
    let a = int_const(&mut c, 1);
    let call = c.push(
        c.entry,
        Instr::new(
            Op::StaticCall {
                callee_addr: 0xC10C0,
                target: Some(NativeTarget {
                    code_addr: 0xC0DE0,
                    fn_addr: None,
                    no_reflection: false,
                }),
                assumptions: 1,
            },
            PirType::any(),
        )
        .with_args(vec![a])
        .with_env(Value::GlobalEnv),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(call)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(
        ir.contains("@native_call_trampoline"),
        "missing trampoline dispatch:\n{ir}"
    );
    Ok(())
}

#[test]
fn concat_of_uniform_ints_fills_a_fresh_vector() -> Result<()> {
    let mut c = Code::new(4);
    let a = int_const(&mut c, 1);
    let b = int_const(&mut c, 2);
    let cc = c.push(
        c.entry,
        Instr::new(
            Op::CallSafeBuiltin(Builtin::Concat),
            PirType::int().not_object().no_attribs(),
        )
        .with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(cc)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("@make_vector"), "missing allocation:\n{ir}");
    assert!(ir.contains("store i32"), "missing element fills:\n{ir}");
    assert!(
        !ir.contains("@call_builtin"),
        "uniform c(...) must not call the generic builtin:\n{ir}"
    );
    Ok(())
}

#[test]
fn bitwise_shift_overflows_to_na() -> Result<()> {
    let mut c = Code::new(5);
    let a = int_const(&mut c, 1);
    let b = int_const(&mut c, 40);
    let sh = c.push(
        c.entry,
        Instr::new(
            Op::CallSafeBuiltin(Builtin::BitwiseShiftL),
            PirType::simple_scalar_int(),
        )
        .with_args(vec![a, b]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(sh)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(ir.contains("shl i32"), "missing native shift:\n{ir}");
    assert!(ir.contains("icmp sgt i32"), "missing 0..31 range check:\n{ir}");
    assert!(ir.contains("bitw.na"), "missing NA overflow arm:\n{ir}");
    Ok(())
}

#[test]
fn length_of_scalar_bypasses_the_runtime() -> Result<()> {
    let mut c = Code::new(6);
    let a = int_const(&mut c, 9);
    let len = c.push(
        c.entry,
        Instr::new(
            Op::CallSafeBuiltin(Builtin::Length),
            PirType::simple_scalar_int().not_na(),
        )
        .with_args(vec![a]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(len)]),
    );

    let ir = lower_to_ir(&c, &SymbolTable::new())?;
    assert!(!ir.contains("@length"), "scalar length is a constant:\n{ir}");
    Ok(())
}

#[test]
fn type_predicate_compiles_to_kind_compare() -> Result<()> {
    let mut syms = SymbolTable::new();
    let x = syms.intern("x");
    let mut c = Code::new(7);
    let ld = c.push(
        c.entry,
        Instr::new(Op::LdVar(x), PirType::any()).with_env(Value::GlobalEnv),
    );
    let p = c.push(
        c.entry,
        Instr::new(
            Op::CallSafeBuiltin(Builtin::IsCharacter),
            PirType::simple_scalar_lgl().not_na(),
        )
        .with_args(vec![Value::Instr(ld)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Instr(p)]),
    );

    let ir = lower_to_ir(&c, &syms)?;
    assert!(
        !ir.contains("@call_builtin"),
        "predicates fold to header tests:\n{ir}"
    );
    assert!(ir.contains("icmp eq i32"), "missing kind compare:\n{ir}");
    Ok(())
}

#[test]
fn unsupported_opcodes_are_declined() -> Result<()> {
    let mut c = Code::new(8);
    c.push(c.entry, Instr::new(Op::Int3, PirType::any()));
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );
    common::expect_decline(&c, &SymbolTable::new())
}
