//! Scheduled deopts: metadata blobs, frame layout, tail calls.

mod common;

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use inkwell::context::Context;

use fern_pir::analysis::RefcountAdjustment;
use fern_pir::{
    Code, Const, DeoptReason, FrameInfo, Instr, Op, PirType, SymbolTable, Value,
};
use fernc_native::runtime::NativeRuntime;
use fernc_native::{try_compile, LowerInputs, LowerOptions};

fn deopt_code() -> Code {
    let mut c = Code::new(9);
    let k = c.pool_push(Const::Int(3));
    let v = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    let frames = vec![
        FrameInfo {
            code_uid: 10,
            pc_offset: 4,
            stack_size: 1,
            in_promise: false,
        },
        FrameInfo {
            code_uid: 11,
            pc_offset: 8,
            stack_size: 0,
            in_promise: true,
        },
    ];
    c.push(
        c.entry,
        Instr::new(Op::ScheduledDeopt { frames }, PirType::any())
            .with_args(vec![Value::Instr(v)]),
    );
    c
}

#[test]
fn deopt_tail_calls_and_never_returns() -> Result<()> {
    let c = deopt_code();
    let syms = SymbolTable::new();
    let ir = common::lower_to_ir(&c, &syms)?;
    assert!(ir.contains("tail call"), "deopt must be a tail call:\n{ir}");
    assert!(ir.contains("@deopt"), "missing deopt runtime call:\n{ir}");
    assert!(ir.contains("unreachable"), "deopt never returns:\n{ir}");
    Ok(())
}

#[test]
fn deopt_metadata_is_serialized_in_stack_order() -> Result<()> {
    let c = deopt_code();
    let syms = SymbolTable::new();
    let context = Context::create();
    let rt = NativeRuntime::fixture(0);
    let promise_map = HashMap::new();
    let refcount = RefcountAdjustment::default();
    let needs = HashSet::new();
    let compiled = try_compile(
        &context,
        &c,
        &syms,
        &rt,
        LowerInputs {
            promise_map: &promise_map,
            refcount: &refcount,
            needs_ldvar_for_update: &needs,
        },
        &LowerOptions::default(),
    )
    .map_err(|d| anyhow!("{d}"))?
    .ok_or_else(|| anyhow!("declined"))?;

    assert_eq!(compiled.deopt_metadata.len(), 1);
    let blob = &compiled.deopt_metadata[0];
    assert_eq!(&blob[0..4], &2u32.to_ne_bytes(), "two frames");
    // frames are reversed to stack order: the innermost (uid 11) first
    assert_eq!(&blob[4..8], &11u32.to_ne_bytes());
    assert_eq!(&blob[20..24], &10u32.to_ne_bytes());
    Ok(())
}

#[test]
fn record_deopt_reason_emits_a_constant_record() -> Result<()> {
    let mut c = Code::new(10);
    let k = c.pool_push(Const::Int(3));
    let v = c.push(
        c.entry,
        Instr::new(Op::LdConst(k), PirType::simple_scalar_int()),
    );
    c.push(
        c.entry,
        Instr::new(
            Op::RecordDeoptReason(DeoptReason {
                reason: 2,
                src_code: 0xBEE5,
                origin_offset: 12,
            }),
            PirType::any(),
        )
        .with_args(vec![Value::Instr(v)]),
    );
    c.push(
        c.entry,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    let syms = SymbolTable::new();
    let ir = common::lower_to_ir(&c, &syms)?;
    assert!(ir.contains("@record_deopt"), "missing runtime call:\n{ir}");
    assert!(ir.contains("deoptreason"), "missing constant record:\n{ir}");
    Ok(())
}

#[test]
fn branch_toward_deopt_exit_is_weighted_unlikely() -> Result<()> {
    let mut c = Code::new(11);
    let k = c.pool_push(Const::Int(1));
    let cond = c.push(c.entry, Instr::new(Op::LdConst(k), PirType::test()));
    c.push(
        c.entry,
        Instr::new(Op::Branch, PirType::any()).with_args(vec![Value::Instr(cond)]),
    );
    let ok = c.add_block();
    let bail = c.add_block();
    c.set_cond(c.entry, bail, ok);

    c.push(
        bail,
        Instr::new(
            Op::ScheduledDeopt {
                frames: vec![FrameInfo {
                    code_uid: 1,
                    pc_offset: 0,
                    stack_size: 0,
                    in_promise: false,
                }],
            },
            PirType::any(),
        ),
    );
    c.push(
        ok,
        Instr::new(Op::Return, PirType::any()).with_args(vec![Value::Nil]),
    );

    let syms = SymbolTable::new();
    let ir = common::lower_to_ir(&c, &syms)?;
    assert!(
        ir.contains("branch_weights"),
        "deopt-bound branches carry weights:\n{ir}"
    );
    assert!(ir.contains("i32 100000000"), "expected heavy skew:\n{ir}");
    Ok(())
}
