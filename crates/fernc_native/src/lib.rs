//! Native lowering backend for the fern JIT.
//!
//! Consumes typed SSA (`fern_pir::Code`) and produces an LLVM module with
//! a single function of signature `(code*, args*, env, closure) -> boxed`,
//! plus the side artifacts the runtime needs: deopt metadata blobs and a
//! register map for the profiler. Turning the module into machine code is
//! the caller's concern.
//!
//! Lowering failure is recoverable: [`try_compile`] returns `Ok(None)`
//! when the code uses a construct the backend declines, and the JIT falls
//! back to interpreting the same PIR. A `Diagnostic` error signals a
//! malformed input or a backend bug, never a routine miss.

pub mod alloc;
pub mod codegen;
pub mod constants;
pub mod deopt;
pub mod diagnostics;
pub mod register_map;
pub mod rep;
pub mod runtime;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::FunctionValue;

use fern_pir::{Code, SymbolTable};

pub use codegen::LowerInputs;
use diagnostics::DiagnosticResult;
use register_map::RegisterMap;
use runtime::NativeRuntime;

/// Programmatic configuration of one lowering run.
#[derive(Debug, Clone)]
pub struct LowerOptions {
    /// Name of the produced LLVM module.
    pub module_name: String,
    /// Name of the produced function.
    pub function_name: String,
    /// Dump the module to stderr after a successful compile.
    pub debug_ir: bool,
    /// Emit self-check sequences (representation asserts) into the
    /// generated code.
    pub slow_asserts: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions {
            module_name: "fern_native".to_string(),
            function_name: "fern_code".to_string(),
            debug_ir: false,
            slow_asserts: false,
        }
    }
}

/// A successfully lowered function plus everything that must stay alive
/// with it.
pub struct CompiledCode<'ctx> {
    pub module: Module<'ctx>,
    pub function: FunctionValue<'ctx>,
    /// Frame-slot to feedback-origin mapping for the profiler, when any
    /// feedback-carrying value got a slot.
    pub register_map: Option<RegisterMap>,
    /// Serialized deopt metadata; the generated code embeds pointers into
    /// these buffers.
    pub deopt_metadata: Vec<Box<[u8]>>,
}

/// Lower `code` to native IR. `Ok(None)` means the backend declined and
/// the caller should interpret instead; partially emitted IR is discarded
/// with the module.
pub fn try_compile<'ctx>(
    context: &'ctx Context,
    code: &Code,
    syms: &SymbolTable,
    rt: &NativeRuntime,
    inputs: LowerInputs,
    opts: &LowerOptions,
) -> DiagnosticResult<Option<CompiledCode<'ctx>>> {
    let mut lf = codegen::LowerFunction::new(context, code, syms, rt, inputs, opts);
    let ok = codegen::lower::run(&mut lf)?;
    if !ok {
        return Ok(None);
    }
    if opts.debug_ir {
        eprintln!("{}", lf.module.print_to_string().to_string());
    }
    let codegen::LowerFunction {
        module,
        fun,
        register_map,
        deopt_blobs,
        ..
    } = lf;
    let register_map = if register_map.is_empty() {
        None
    } else {
        Some(register_map)
    };
    Ok(Some(CompiledCode {
        module,
        function: fun,
        register_map,
        deopt_metadata: deopt_blobs,
    }))
}
