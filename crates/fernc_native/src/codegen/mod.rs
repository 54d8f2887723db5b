//! The lowering context.
//!
//! `LowerFunction` owns the LLVM module/builder plus every piece of
//! per-compilation state: the storage bindings, block mapping, call
//! contexts, the inline binding cache, and the success flag. It is built
//! for one `Code`, driven once by `lower::run`, and discarded.
//!
//! Submodules:
//! - `types_llvm`    : guest heap struct types
//! - `variable`      : per-value storage bindings
//! - `runtime_decls` : idempotent declarations of runtime builtins
//! - `facade`        : typed IR-emission helpers over the raw builder
//! - `lower`         : the per-opcode dispatch

use std::collections::{HashMap, HashSet};

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicTypeEnum, FloatType, IntType, PointerType};
use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::AddressSpace;

use fern_pir::analysis::{Liveness, RefcountAdjustment};
use fern_pir::{BlockId, Code, InstrId, SymId, SymbolTable, Value};

use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::register_map::RegisterMap;
use crate::rep::Rep;
use crate::runtime::NativeRuntime;
use crate::LowerOptions;

pub mod facade;
pub mod lower;
pub mod runtime_decls;
pub mod types_llvm;
pub mod variable;

use types_llvm::GuestTypes;
use variable::Variable;

/// Convert a builder error into a diagnostic, the single funnel every
/// emission helper goes through.
pub(crate) fn ir<T>(r: Result<T, inkwell::builder::BuilderError>) -> DiagnosticResult<T> {
    r.map_err(|e| Diagnostic::new(format!("ir emission failed: {e}")))
}

/// Branch probability hints, lowered to `!prof` branch-weights metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchWeight {
    AlwaysTrue,
    AlwaysFalse,
    MostlyTrue,
    MostlyFalse,
}

impl BranchWeight {
    pub(crate) fn counts(self) -> (u64, u64) {
        match self {
            BranchWeight::AlwaysTrue => (100_000_000, 1),
            BranchWeight::AlwaysFalse => (1, 100_000_000),
            BranchWeight::MostlyTrue => (1000, 1),
            BranchWeight::MostlyFalse => (1, 1000),
        }
    }
}

/// Collect-then-materialize phi construction. A single-input join
/// collapses to that value instead of emitting a phi.
pub struct PhiJoin<'ctx> {
    ty: BasicTypeEnum<'ctx>,
    inputs: Vec<(BasicValueEnum<'ctx>, BasicBlock<'ctx>)>,
}

impl<'ctx> PhiJoin<'ctx> {
    pub fn new(ty: BasicTypeEnum<'ctx>) -> Self {
        PhiJoin {
            ty,
            inputs: Vec::new(),
        }
    }

    pub fn add(&mut self, val: BasicValueEnum<'ctx>, from: BasicBlock<'ctx>) {
        self.inputs.push((val, from));
    }

    pub fn build(self, builder: &Builder<'ctx>) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        match self.inputs.len() {
            0 => Err(Diagnostic::new("phi join with no inputs")),
            1 => Ok(self.inputs[0].0),
            _ => {
                let phi = ir(builder.build_phi(self.ty, "join"))?;
                for (v, bb) in &self.inputs {
                    phi.add_incoming(&[(v, *bb)]);
                }
                Ok(phi.as_basic_value())
            }
        }
    }
}

/// Per-push-context emission state.
pub(crate) struct ContextData<'ctx> {
    /// Alloca holding the native call context struct.
    pub rcntxt: PointerValue<'ctx>,
    /// Alloca for the context's result, sized by the pop's representation.
    pub result: PointerValue<'ctx>,
    pub result_rep: Rep,
    /// Every non-local return funnels here.
    pub pop_context_target: BasicBlock<'ctx>,
    /// Frame slots reserved for boxed values live across the push.
    pub saved_boxed_pos: HashMap<InstrId, usize>,
}

/// Everything the backend's caller supplies besides the code itself.
pub struct LowerInputs<'a> {
    /// Promise id -> promise index within the closure version.
    pub promise_map: &'a HashMap<u32, u32>,
    pub refcount: &'a RefcountAdjustment,
    /// LdVar instructions whose result feeds an update.
    pub needs_ldvar_for_update: &'a HashSet<InstrId>,
}

pub struct LowerFunction<'ctx, 'a> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub builder: Builder<'ctx>,

    pub code: &'a Code,
    pub syms: &'a SymbolTable,
    pub rt: &'a NativeRuntime,
    pub inputs: LowerInputs<'a>,
    pub opts: &'a LowerOptions,

    pub liveness: Liveness,

    // cached ABI types
    pub t_i1: IntType<'ctx>,
    pub t_i8: IntType<'ctx>,
    pub t_i32: IntType<'ctx>,
    pub t_i64: IntType<'ctx>,
    pub t_f64: FloatType<'ctx>,
    pub t_ptr: PointerType<'ctx>,
    pub guest: GuestTypes<'ctx>,

    pub fun: FunctionValue<'ctx>,
    pub(crate) entry_block: BasicBlock<'ctx>,

    // per-walk state
    pub(crate) current_instr: InstrId,
    pub(crate) current_bb: BlockId,
    pub(crate) variables: HashMap<InstrId, Variable<'ctx>>,
    pub(crate) contexts: HashMap<InstrId, ContextData<'ctx>>,
    pub(crate) escapes_inline_context: HashSet<InstrId>,
    pub(crate) in_push_context: u32,
    pub(crate) bindings_cache: HashMap<Value, HashMap<SymId, usize>>,
    pub(crate) bindings_cache_base: Option<PointerValue<'ctx>>,
    pub(crate) block_map: HashMap<BlockId, BasicBlock<'ctx>>,
    pub(crate) num_locals: usize,
    pub(crate) num_temps: usize,
    pub(crate) basepointer: Option<PointerValue<'ctx>>,
    pub(crate) constantpool: Option<PointerValue<'ctx>>,
    pub(crate) declared: HashMap<&'static str, FunctionValue<'ctx>>,
    pub(crate) next_global: u32,
    pub(crate) deopt_blobs: Vec<Box<[u8]>>,
    pub(crate) register_map: RegisterMap,
    pub success: bool,
}

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub fn new(
        context: &'ctx Context,
        code: &'a Code,
        syms: &'a SymbolTable,
        rt: &'a NativeRuntime,
        inputs: LowerInputs<'a>,
        opts: &'a LowerOptions,
    ) -> Self {
        let module = context.create_module(&opts.module_name);
        let builder = context.create_builder();
        let t_ptr = context.ptr_type(AddressSpace::default());

        // (code*, args*, env, closure) -> boxed
        let fn_ty = t_ptr.fn_type(
            &[t_ptr.into(), t_ptr.into(), t_ptr.into(), t_ptr.into()],
            false,
        );
        let fun = module.add_function(&opts.function_name, fn_ty, None);
        for (n, name) in ["code", "args", "env", "closure"].iter().enumerate() {
            if let Some(p) = fun.get_nth_param(n as u32) {
                p.set_name(name);
            }
        }
        let entry_block = context.append_basic_block(fun, "entry");

        let liveness = Liveness::compute(code);

        LowerFunction {
            context,
            module,
            builder,
            code,
            syms,
            rt,
            inputs,
            opts,
            liveness,
            t_i1: context.bool_type(),
            t_i8: context.i8_type(),
            t_i32: context.i32_type(),
            t_i64: context.i64_type(),
            t_f64: context.f64_type(),
            t_ptr,
            guest: GuestTypes::new(context),
            fun,
            entry_block,
            current_instr: InstrId(0),
            current_bb: code.entry,
            variables: HashMap::new(),
            contexts: HashMap::new(),
            escapes_inline_context: HashSet::new(),
            in_push_context: 0,
            bindings_cache: HashMap::new(),
            bindings_cache_base: None,
            block_map: HashMap::new(),
            num_locals: 0,
            num_temps: 0,
            basepointer: None,
            constantpool: None,
            declared: HashMap::new(),
            next_global: 0,
            deopt_blobs: Vec::new(),
            register_map: RegisterMap::new(),
            success: true,
        }
    }

    // -- function parameters ----------------------------------------------

    pub fn param_code(&self) -> PointerValue<'ctx> {
        self.fun.get_nth_param(0).unwrap().into_pointer_value()
    }
    pub fn param_args(&self) -> PointerValue<'ctx> {
        self.fun.get_nth_param(1).unwrap().into_pointer_value()
    }
    pub fn param_env(&self) -> PointerValue<'ctx> {
        self.fun.get_nth_param(2).unwrap().into_pointer_value()
    }
    pub fn param_closure(&self) -> PointerValue<'ctx> {
        self.fun.get_nth_param(3).unwrap().into_pointer_value()
    }

    // -- constants ---------------------------------------------------------

    pub fn c_i32(&self, v: i64) -> IntValue<'ctx> {
        self.t_i32.const_int(v as u64, true)
    }
    pub fn c_i64(&self, v: i64) -> IntValue<'ctx> {
        self.t_i64.const_int(v as u64, true)
    }
    pub fn c_u64(&self, v: u64) -> IntValue<'ctx> {
        self.t_i64.const_int(v, false)
    }
    pub fn c_f64(&self, v: f64) -> inkwell::values::FloatValue<'ctx> {
        self.t_f64.const_float(v)
    }

    /// A stable runtime address as a pointer constant.
    pub fn c_addr(&self, addr: usize) -> PointerValue<'ctx> {
        self.t_i64
            .const_int(addr as u64, false)
            .const_to_pointer(self.t_ptr)
    }

    pub fn null_ptr(&self) -> PointerValue<'ctx> {
        self.t_ptr.const_null()
    }

    /// Intern an immutable private global holding `init`; returns its
    /// address.
    pub fn global_const(
        &mut self,
        init: BasicValueEnum<'ctx>,
        name_hint: &str,
    ) -> PointerValue<'ctx> {
        let name = format!("{}.{}", name_hint, self.next_global);
        self.next_global += 1;
        let gv = self.module.add_global(init.get_type(), None, &name);
        gv.set_initializer(&init);
        gv.set_constant(true);
        gv.set_linkage(inkwell::module::Linkage::Private);
        gv.as_pointer_value()
    }

    /// A private constant i32 array (symbol-id lists for calls and
    /// environments).
    pub fn global_i32_array(&mut self, vals: &[u32], name_hint: &str) -> PointerValue<'ctx> {
        let elems: Vec<IntValue<'ctx>> = vals
            .iter()
            .map(|v| self.t_i32.const_int(*v as u64, false))
            .collect();
        let arr = self.t_i32.const_array(&elems);
        self.global_const(arr.into(), name_hint)
    }

    // -- blocks and branches ----------------------------------------------

    pub fn new_block(&self, name: &str) -> BasicBlock<'ctx> {
        self.context.append_basic_block(self.fun, name)
    }

    pub fn cur_block(&self) -> BasicBlock<'ctx> {
        self.builder.get_insert_block().unwrap()
    }

    pub fn position_at(&self, bb: BasicBlock<'ctx>) {
        self.builder.position_at_end(bb);
    }

    pub fn br(&self, bb: BasicBlock<'ctx>) -> DiagnosticResult<()> {
        ir(self.builder.build_unconditional_branch(bb))?;
        Ok(())
    }

    /// Conditional branch with an optional probability hint.
    pub fn cond_br(
        &self,
        cond: IntValue<'ctx>,
        on_true: BasicBlock<'ctx>,
        on_false: BasicBlock<'ctx>,
        weight: Option<BranchWeight>,
    ) -> DiagnosticResult<()> {
        let br = ir(self
            .builder
            .build_conditional_branch(cond, on_true, on_false))?;
        if let Some(w) = weight {
            let (taken, fallthrough) = w.counts();
            let md = self.context.metadata_node(&[
                self.context.metadata_string("branch_weights").into(),
                self.t_i32.const_int(taken, false).into(),
                self.t_i32.const_int(fallthrough, false).into(),
            ]);
            let _ = br.set_metadata(md, self.context.get_kind_id("prof"));
        }
        Ok(())
    }

    pub fn phi_join(&self, rep: Rep) -> PhiJoin<'ctx> {
        PhiJoin::new(self.rep_type(rep))
    }

    /// The LLVM ABI type of a representation.
    pub fn rep_type(&self, rep: Rep) -> BasicTypeEnum<'ctx> {
        match rep {
            Rep::Int32 => self.t_i32.into(),
            Rep::Float64 => self.t_f64.into(),
            Rep::Boxed => self.t_ptr.into(),
            Rep::Bottom => self.t_ptr.into(),
        }
    }

    /// An alloca in the entry block, so it dominates all uses regardless
    /// of where emission currently is.
    pub fn top_alloca(
        &self,
        ty: BasicTypeEnum<'ctx>,
        len: u32,
        name: &str,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let cur = self.builder.get_insert_block();
        self.builder.position_at_end(self.entry_block);
        let res = if len == 1 {
            ir(self.builder.build_alloca(ty, name))?
        } else {
            ir(self
                .builder
                .build_array_alloca(ty, self.t_i32.const_int(len as u64, false), name))?
        };
        if let Some(bb) = cur {
            self.builder.position_at_end(bb);
        }
        Ok(res)
    }
}
