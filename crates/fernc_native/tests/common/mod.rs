//! Shared helpers for the lowering test suite.
//!
//! Tests build PIR programmatically, lower it against a fabricated
//! runtime, and assert on the printed LLVM IR. Nothing is ever executed;
//! the fixture runtime hands out distinct fake addresses so constants are
//! recognizable in the output.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use inkwell::context::Context;

use fern_pir::analysis::RefcountAdjustment;
use fern_pir::{Code, InstrId, SymbolTable};
use fernc_native::runtime::NativeRuntime;
use fernc_native::{try_compile, LowerInputs, LowerOptions};

/// Lower and print, failing the test on a decline.
#[allow(dead_code)]
pub fn lower_to_ir(code: &Code, syms: &SymbolTable) -> Result<String> {
    lower_to_ir_with(code, syms, &HashSet::new())
}

#[allow(dead_code)]
pub fn lower_to_ir_with(
    code: &Code,
    syms: &SymbolTable,
    needs_ldvar_for_update: &HashSet<InstrId>,
) -> Result<String> {
    let _guard = fernc_native::diagnostics::suppress();
    let context = Context::create();
    let rt = NativeRuntime::fixture(syms.len());
    let promise_map = HashMap::new();
    let refcount = RefcountAdjustment::default();
    let compiled = try_compile(
        &context,
        code,
        syms,
        &rt,
        LowerInputs {
            promise_map: &promise_map,
            refcount: &refcount,
            needs_ldvar_for_update,
        },
        &LowerOptions::default(),
    )
    .map_err(|d| anyhow!("lowering failed: {}", d))?;
    let compiled = compiled.ok_or_else(|| anyhow!("backend declined the code"))?;
    Ok(compiled.module.print_to_string().to_string())
}

/// Lower expecting the backend to decline.
#[allow(dead_code)]
pub fn expect_decline(code: &Code, syms: &SymbolTable) -> Result<()> {
    let _guard = fernc_native::diagnostics::suppress();
    let context = Context::create();
    let rt = NativeRuntime::fixture(syms.len());
    let promise_map = HashMap::new();
    let refcount = RefcountAdjustment::default();
    let needs = HashSet::new();
    let compiled = try_compile(
        &context,
        code,
        syms,
        &rt,
        LowerInputs {
            promise_map: &promise_map,
            refcount: &refcount,
            needs_ldvar_for_update: &needs,
        },
        &LowerOptions::default(),
    )
    .map_err(|d| anyhow!("lowering failed: {}", d))?;
    if compiled.is_some() {
        return Err(anyhow!("expected the backend to decline"));
    }
    Ok(())
}
