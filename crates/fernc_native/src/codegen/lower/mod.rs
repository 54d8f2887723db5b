//! The per-opcode lowering dispatch.
//!
//! `run` drives one pass over the CFG in reverse postorder. The entry
//! block accumulates allocas and frame setup while the walk emits into
//! per-PIR-block LLVM blocks; the entry's branch into the first real
//! block is fixed up last. Phi inputs are copied at the end of each
//! predecessor, after that predecessor's regular instructions.
//!
//! Opcode families live in submodules: arithmetic (`arith`), vector
//! access (`vector`), environments and the binding cache (`env`), calls
//! (`calls`), safe-builtin inlining (`builtins`), and push/pop contexts
//! (`context`).

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::values::PointerValue;
use inkwell::IntPredicate;

use fern_pir::{BlockId, InstrId, Op, PirType, Successors, SymId, Value};

use crate::alloc;
use crate::codegen::{ir, BranchWeight, ContextData, LowerFunction};
use crate::constants::{ObjKind, MAX_TEMPS, STUB_SLOT_MATERIALIZED};
use crate::deopt::DeoptMetadata;
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::register_map::MAX_SLOT_IDX;
use crate::rep::Rep;
use crate::runtime::builtins;

mod arith;
mod builtins_inline;
mod calls;
mod context;
mod env;
mod vector;

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub(crate) fn block_llvm(&mut self, bb: BlockId) -> BasicBlock<'ctx> {
        if let Some(b) = self.block_map.get(&bb) {
            return *b;
        }
        let b = self.new_block(&format!("BB{}", bb.0));
        self.block_map.insert(bb, b);
        b
    }

    /// The boxed container of an embedded code payload: the cell header
    /// sits right before the payload pointer.
    pub(crate) fn container(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let as_int = ir(self.builder.build_ptr_to_int(v, self.t_i64, ""))?;
        let header = self.c_u64(6 * 8);
        let base = ir(self.builder.build_int_sub(as_int, header, ""))?;
        ir(self.builder.build_int_to_ptr(base, self.t_ptr, "container"))
    }
}

/// Lower `lf.code` into its module. `Ok(false)` means the code uses a
/// construct the backend declines; the caller falls back to the
/// interpreter and discards the module.
pub fn run(lf: &mut LowerFunction) -> DiagnosticResult<bool> {
    lf.position_at(lf.entry_block);

    // slot 0 holds the code container so the profiler can identify the
    // frame
    let basepointer = lf.nodestack_ptr()?;
    lf.basepointer = Some(basepointer);
    lf.num_locals = 1;
    lf.inc_stack(1, false)?;
    let container = lf.container(lf.param_code())?;
    lf.write_stack(&[container])?;

    discover_binding_cache(lf)?;
    setup_variables(lf)?;

    lf.num_locals += MAX_TEMPS;
    if lf.num_locals > 1 {
        lf.inc_stack(lf.num_locals - 1, true)?;
    }

    let mut context_depth: HashMap<BlockId, u32> = HashMap::new();
    context_depth.insert(lf.code.entry, 0);

    for bb in lf.code.rpo() {
        if !lf.success {
            break;
        }
        lf.current_bb = bb;
        lf.in_push_context = context_depth.get(&bb).copied().unwrap_or(0);
        let llvm_bb = lf.block_llvm(bb);
        lf.position_at(llvm_bb);

        let instrs = lf.code.block(bb).instrs.clone();
        for iid in instrs {
            if !lf.success {
                break;
            }
            lf.current_instr = iid;
            lf.adjust_refcounts_before_use(iid)?;
            lower_instr(lf, iid)?;
            if !lf.success {
                break;
            }
            if !lf.code.instr(iid).is_phi() {
                lf.ensure_named_if_needed(iid, None)?;
            }
            lf.num_temps = 0;
        }
        if !lf.success {
            break;
        }

        // fall-through blocks still owe their phi copies and jump;
        // conditional blocks did both while lowering their Branch
        if let Successors::Jump(next) = lf.code.block(bb).succ {
            emit_phi_updates(lf, bb)?;
            let target = lf.block_llvm(next);
            if lf.cur_block().get_terminator().is_none() {
                lf.br(target)?;
            }
        }

        for s in lf.code.successors(bb) {
            context_depth.insert(s, lf.in_push_context);
        }
    }

    // the entry block was accumulating allocas; branch it into the CFG now
    lf.position_at(lf.entry_block);
    let first = lf.block_llvm(lf.code.entry);
    lf.br(first)?;

    if lf.success {
        collect_register_map(lf);
    }
    Ok(lf.success)
}

/// One inline cache slot per (environment-creating instruction, name)
/// pair used by a variable load or store against a known non-stub env.
fn discover_binding_cache(lf: &mut LowerFunction) -> DiagnosticResult<()> {
    let mut entries: Vec<(Value, SymId)> = Vec::new();
    lf.code.each_instr(|_, instr| {
        let name = match &instr.op {
            Op::LdVar(n) => Some(*n),
            Op::StVar { name, .. } => Some(*name),
            _ => None,
        };
        if let (Some(n), Some(Value::Instr(e))) = (name, instr.env) {
            if let Op::MkEnv { stub, .. } = &lf.code.instr(e).op {
                if !*stub && !entries.contains(&(Value::Instr(e), n)) {
                    entries.push((Value::Instr(e), n));
                }
            }
        }
    });
    if entries.is_empty() {
        return Ok(());
    }
    let base = lf.top_alloca(lf.t_ptr.into(), entries.len() as u32, "bindings")?;
    lf.bindings_cache_base = Some(base);
    for (idx, (env, name)) in entries.into_iter().enumerate() {
        lf.bindings_cache.entry(env).or_default().insert(name, idx);
        // sentinel-initialize
        let slot = unsafe {
            ir(lf
                .builder
                .build_gep(lf.t_ptr, base, &[lf.c_i32(idx as i64)], ""))?
        };
        ir(lf.builder.build_store(slot, lf.null_ptr()))?;
    }
    Ok(())
}

/// Run the allocator and materialize a storage binding for every live
/// definition; reserve context snapshots along the way.
fn setup_variables(lf: &mut LowerFunction) -> DiagnosticResult<()> {
    let allocation = alloc::compute(lf.code, &lf.liveness);
    alloc::verify(lf.code, &lf.liveness, &allocation)?;
    let num_locals_base = lf.num_locals;
    lf.num_locals += allocation.num_slots();

    // phis are always mutable
    let mut phi_ids: Vec<InstrId> = Vec::new();
    lf.code.each_instr(|iid, instr| {
        if instr.is_phi() {
            phi_ids.push(iid);
        }
    });
    for phi in phi_ids {
        if lf.liveness.count(phi) && alloc::needs_a_variable(lf.code, phi) {
            create_variable(lf, &allocation, num_locals_base, phi, true)?;
        }
    }

    // push-context handling: reserve restart snapshots, force mutability
    let mut pops: Vec<(InstrId, InstrId)> = Vec::new();
    lf.code.each_instr(|iid, instr| {
        if let Op::PopContext { push } = instr.op {
            pops.push((iid, push));
        }
    });
    for (pop, push) in pops {
        let result_val = lf.code.instr(pop).args[0];
        let result_rep = lf.val_rep(result_val);
        let result = lf.top_alloca(lf.rep_type(result_rep), 1, "ctxres")?;
        let rcntxt = lf.top_alloca(lf.guest.rcntxt.into(), 1, "rcntxt")?;
        let target = lf.new_block("popctxt");
        let mut saved_boxed_pos = HashMap::new();

        let mut all: Vec<InstrId> = Vec::new();
        lf.code.each_instr(|iid, _| all.push(iid));
        for j in all {
            if !alloc::needs_a_variable(lf.code, j) {
                continue;
            }
            let live_at_push = lf.liveness.live_after(push, j);
            let live_at_pop = lf.liveness.live_after(pop, j);
            if lf.instr_rep(j) == Rep::Boxed && live_at_push {
                saved_boxed_pos.insert(j, lf.num_locals);
                lf.num_locals += 1;
            }
            if !live_at_push && live_at_pop {
                lf.escapes_inline_context.insert(j);
            }
            if !lf.variables.contains_key(&j) && (live_at_push || live_at_pop) {
                create_variable(lf, &allocation, num_locals_base, j, true)?;
            }
        }
        lf.contexts.insert(
            push,
            ContextData {
                rcntxt,
                result,
                result_rep,
                pop_context_target: target,
                saved_boxed_pos,
            },
        );
    }

    // everything else is immutable
    let mut rest: Vec<InstrId> = Vec::new();
    lf.code.each_instr(|iid, _| rest.push(iid));
    for j in rest {
        if alloc::needs_a_variable(lf.code, j)
            && lf.liveness.count(j)
            && !lf.variables.contains_key(&j)
        {
            create_variable(lf, &allocation, num_locals_base, j, false)?;
        }
    }
    Ok(())
}

fn create_variable(
    lf: &mut LowerFunction,
    allocation: &alloc::Allocation,
    num_locals_base: usize,
    i: InstrId,
    mutable: bool,
) -> DiagnosticResult<()> {
    use crate::codegen::variable::Variable;
    let rep = lf.instr_rep(i);
    let var = if rep == Rep::Boxed {
        let slot = allocation
            .slot_of(i)
            .ok_or_else(|| Diagnostic::at_instr("boxed value missing a slot", i))?
            + num_locals_base;
        let base = lf
            .basepointer
            .ok_or_else(|| Diagnostic::new("frame base not yet established"))?;
        let cur = lf.builder.get_insert_block();
        lf.position_at(lf.entry_block);
        let cell = unsafe {
            ir(lf.builder.build_gep(
                lf.guest.stack_cell,
                base,
                &[lf.c_i32(slot as i64)],
                "",
            ))?
        };
        let storage = ir(lf.builder.build_struct_gep(
            lf.guest.stack_cell,
            cell,
            crate::codegen::types_llvm::stack_cell_field::VALUE,
            &format!("i{}", i.0),
        ))?;
        if let Some(bb) = cur {
            lf.position_at(bb);
        }
        Variable::boxed(mutable, storage, lf.t_ptr.into(), slot)
    } else if mutable {
        let storage = lf.top_alloca(lf.rep_type(rep), 1, &format!("i{}", i.0))?;
        Variable::mutable_scalar(storage, lf.rep_type(rep))
    } else {
        Variable::immutable_scalar(lf.rep_type(rep))
    };
    lf.variables.insert(i, var);
    Ok(())
}

/// At the end of predecessor `bb`, copy each incoming value into its
/// phi's storage, in the phi's representation.
pub(crate) fn emit_phi_updates(lf: &mut LowerFunction, bb: BlockId) -> DiagnosticResult<()> {
    let mut updates: Vec<(InstrId, Value)> = Vec::new();
    for s in lf.code.successors(bb) {
        for iid in &lf.code.block(s).instrs {
            if let Op::Phi { inputs } = &lf.code.instr(*iid).op {
                for (pred, v) in inputs {
                    if *pred == bb {
                        updates.push((*iid, *v));
                    }
                }
            }
        }
    }
    for (phi, incoming) in updates {
        if lf.dead_move(incoming, phi) {
            continue;
        }
        let rep = lf.instr_rep(phi);
        let val = lf.load_val(incoming, rep)?;
        lf.ensure_named_if_needed(phi, Some(val))?;
        lf.update_variable(phi, val)?;
    }
    Ok(())
}

fn collect_register_map(lf: &mut LowerFunction) {
    for (iid, var) in &lf.variables {
        if lf.register_map.is_full() {
            break;
        }
        if lf.instr_rep(*iid) != Rep::Boxed || !var.initialized {
            continue;
        }
        let Some(origin) = lf.code.instr(*iid).type_feedback else {
            continue;
        };
        if let Some(slot) = var.stack_slot {
            if slot < MAX_SLOT_IDX {
                lf.register_map.insert(slot, origin);
            }
        }
    }
}

fn lower_instr(lf: &mut LowerFunction, iid: InstrId) -> DiagnosticResult<()> {
    let op = lf.code.instr(iid).op.clone();
    let args = lf.code.instr(iid).args.clone();

    match op {
        Op::Nop | Op::LdConst(_) | Op::Phi { .. } => {}

        Op::ExpandDots | Op::PirCopy => {
            if !lf.dead_move(args[0], iid) {
                let rep = lf.instr_rep(iid);
                let v = lf.load_val(args[0], rep)?;
                lf.set_val(iid, v)?;
            }
        }

        Op::CastType => {
            let followed = lf.code.follow_casts(Value::Instr(iid));
            let is_const_load = matches!(
                followed,
                Value::Instr(a) if matches!(lf.code.instr(a).op, Op::LdConst(_))
            );
            if !is_const_load && !lf.dead_move(args[0], iid) {
                let ty = lf.code.instr(iid).ty;
                let rep = lf.instr_rep(iid);
                let v = lf.load_typed(args[0], &ty, rep)?;
                lf.set_val(iid, v)?;
            }
        }

        Op::LdArg(n) => {
            let v = lf.argument(n)?;
            lf.set_val(iid, v.into())?;
        }

        Op::LdFunctionEnv => {
            let v = lf.param_env();
            lf.set_val(iid, v.into())?;
        }

        Op::Visible => lf.set_visible(true)?,
        Op::Invisible => lf.set_visible(false)?,

        Op::Identical => {
            let a0 = lf.load_sxp(args[0])?;
            let a = lf.depromise(a0)?;
            let b0 = lf.load_sxp(args[1])?;
            let b = lf.depromise(b0)?;
            let eq = ir(lf.builder.build_int_compare(IntPredicate::EQ, a, b, ""))?;
            let wide = ir(lf.builder.build_int_z_extend(eq, lf.t_i32, ""))?;
            lf.set_val(iid, wide.into())?;
        }

        Op::Inc => {
            if lf.val_rep(args[0]) == Rep::Int32 {
                let v = lf.load_val(args[0], Rep::Int32)?.into_int_value();
                let bumped = ir(lf.builder.build_int_nsw_add(v, lf.c_i32(1), ""))?;
                lf.set_val(iid, bumped.into())?;
            } else {
                lf.success = false;
            }
        }

        Op::ForSeqSize => {
            let seq = lf.load_sxp(args[0])?;
            let n = lf
                .call_rt_val(&builtins::FOR_SEQ_SIZE, &[seq.into()])?
                .into_int_value();
            let res = match lf.instr_rep(iid) {
                Rep::Float64 => {
                    ir(lf.builder.build_signed_int_to_float(n, lf.t_f64, ""))?.into()
                }
                Rep::Boxed => lf.box_int(n)?.into(),
                _ => n.into(),
            };
            lf.set_val(iid, res)?;
        }

        Op::Branch => {
            let cond = lf.load_val(args[0], Rep::Int32)?.into_int_value();
            let cond = ir(lf
                .builder
                .build_int_compare(IntPredicate::NE, cond, lf.c_i32(0), "br"))?;
            let Successors::Cond { on_true, on_false } = lf.code.block(lf.current_bb).succ
            else {
                return Err(Diagnostic::at_instr("branch in a non-conditional block", iid));
            };
            emit_phi_updates(lf, lf.current_bb)?;
            let weight = if lf.code.is_deopt_exit(on_true) {
                Some(BranchWeight::AlwaysFalse)
            } else if lf.code.is_deopt_exit(on_false) {
                Some(BranchWeight::AlwaysTrue)
            } else {
                None
            };
            let t = lf.block_llvm(on_true);
            let f = lf.block_llvm(on_false);
            lf.cond_br(cond, t, f, weight)?;
        }

        Op::Return => {
            let res = lf.load_sxp(args[0])?;
            let locals = lf.num_locals;
            lf.dec_stack(locals)?;
            ir(lf.builder.build_return(Some(&res)))?;
        }

        Op::ScheduledDeopt { frames } => {
            let blob = DeoptMetadata::from_pir_frames(&frames).serialize();
            let meta_addr = blob.as_ptr() as usize;
            lf.deopt_blobs.push(blob);

            lf.inc_stack(args.len(), false)?;
            let mut vals = Vec::with_capacity(args.len());
            for a in &args {
                vals.push(lf.load_sxp(*a)?);
            }
            lf.write_stack(&vals)?;
            let site = lf.call_rt_site(
                &builtins::DEOPT,
                &[
                    lf.param_code().into(),
                    lf.param_closure().into(),
                    lf.c_addr(meta_addr).into(),
                    lf.param_args().into(),
                ],
            )?;
            site.set_tail_call(true);
            ir(lf.builder.build_unreachable())?;
        }

        Op::RecordDeoptReason(reason) => {
            let record = lf.context.const_struct(
                &[
                    lf.c_i32(reason.reason as i64).into(),
                    lf.c_addr(reason.src_code as usize).into(),
                    lf.c_i32(reason.origin_offset as i64).into(),
                ],
                false,
            );
            let store = lf.global_const(record.into(), "deoptreason");
            let val = lf.load_sxp(args[0])?;
            lf.call_rt(&builtins::RECORD_DEOPT, &[val.into(), store.into()])?;
        }

        Op::DotsList { names } => {
            let mut arglist = lf.c_addr(lf.rt.nil_addr);
            for (name, v) in names.iter().zip(args.iter()).rev() {
                let val = lf.load_sxp(*v)?;
                lf.increment_named(val, crate::constants::NAMED_MAX)?;
                arglist = lf
                    .call_rt_val(&builtins::CONS_NR, &[val.into(), arglist.into()])?
                    .into_pointer_value();
                let sym = lf.symbol_const(*name)?;
                lf.set_tag(arglist, sym, false)?;
            }
            lf.set_kind(arglist, ObjKind::Dots)?;
            lf.set_val(iid, arglist.into())?;
        }

        Op::IsEnvStub => {
            let arg = lf.load_sxp(args[0])?;
            let env = lf.code.instr(iid).env;
            let nlocals = match env {
                Some(Value::Instr(e)) => match &lf.code.instr(e).op {
                    Op::MkEnv { names, .. } => names.len(),
                    _ => {
                        return Err(Diagnostic::at_instr("IsEnvStub without a known env", iid))
                    }
                },
                _ => return Err(Diagnostic::at_instr("IsEnvStub without a known env", iid)),
            };
            let rep = lf.instr_rep(iid);
            let mut res = lf.phi_join(rep);
            let is_stub = lf.new_block("stub");
            let not_materialized = lf.new_block("stub.lazy");
            let not_stub = lf.new_block("stub.not");
            let done = lf.new_block("stub.done");

            let stubbed = lf.is_env_stub_obj(arg)?;
            lf.cond_br(stubbed, is_stub, not_stub, Some(BranchWeight::AlwaysTrue))?;

            lf.position_at(is_stub);
            let materialized = lf.env_stub_get(arg, STUB_SLOT_MATERIALIZED, nlocals)?;
            let lazy = ir(lf.builder.build_int_compare(
                IntPredicate::EQ,
                materialized,
                lf.null_ptr(),
                "",
            ))?;
            lf.cond_br(lazy, not_materialized, not_stub, Some(BranchWeight::AlwaysTrue))?;

            lf.position_at(not_materialized);
            let tv = lf.load_typed(Value::True, &PirType::simple_scalar_lgl().not_na(), rep)?;
            res.add(tv, lf.cur_block());
            lf.br(done)?;

            lf.position_at(not_stub);
            let fv = lf.load_typed(Value::False, &PirType::simple_scalar_lgl().not_na(), rep)?;
            res.add(fv, lf.cur_block());
            lf.br(done)?;

            lf.position_at(done);
            let v = res.build(&lf.builder)?;
            lf.set_val(iid, v)?;
        }

        Op::MkFunCls {
            body_addr,
            formals,
            srcref,
        } => {
            let body = lf.c_addr(body_addr);
            let formals = lf.constant_pool_at(formals, Rep::Boxed)?;
            let srcref = lf.constant_pool_at(srcref, Rep::Boxed)?;
            let env = lf.lower_env_operand(iid)?;
            let res = lf.call_rt_val(
                &builtins::CREATE_CLOSURE,
                &[body.into(), formals.into(), env.into(), srcref.into()],
            )?;
            lf.set_val(iid, res)?;
        }

        Op::MkCls => {
            let formals = lf.load_sxp(args[0])?;
            let body = lf.load_sxp(args[1])?;
            let srcref = lf.load_sxp(args[2])?;
            let env = lf.load_sxp(args[3])?;
            let res = lf.call_rt_val(
                &builtins::CREATE_CLOSURE,
                &[body.into(), formals.into(), env.into(), srcref.into()],
            )?;
            lf.set_val(iid, res)?;
        }

        Op::Force => {
            let arg = lf.load_sxp(args[0])?;
            let effects = lf.code.instr(iid).effects;
            let res = if !effects.includes(fern_pir::Effect::Force) {
                lf.depromise(arg)?
            } else {
                lf.force_value(arg)?
            };
            lf.set_val(iid, res.into())?;
        }

        Op::LdFun(name) => {
            let sym = lf.symbol_const(name)?;
            let env = lf.lower_env_operand(iid)?;
            let res = lf.call_rt_val(&builtins::LDFUN, &[sym.into(), env.into()])?;
            lf.set_val(iid, res)?;
            lf.set_visible(true)?;
        }

        Op::MkArg { prom, eager: _ } => {
            let idx = lf
                .inputs
                .promise_map
                .get(&prom)
                .copied()
                .ok_or_else(|| Diagnostic::at_instr("promise missing from index map", iid))?;
            let eager = lf.load_sxp(args[0])?;
            let env = lf.lower_env_operand(iid)?;
            let res = lf.call_rt_val(
                &builtins::CREATE_PROMISE,
                &[
                    lf.param_code().into(),
                    lf.c_i32(idx as i64).into(),
                    env.into(),
                    eager.into(),
                ],
            )?;
            lf.set_val(iid, res)?;
        }

        Op::UpdatePromise => {
            let val = lf.load_sxp(args[1])?;
            lf.ensure_shared(val)?;
            let prom = lf.load_sxp(args[0])?;
            lf.set_car(prom, val, true)?;
        }

        Op::ChkMissing => {
            if lf.val_rep(args[0]) == Rep::Boxed {
                let v = lf.load_sxp(args[0])?;
                lf.check_missing(v)?;
            }
            let rep = lf.instr_rep(iid);
            let v = lf.load_val(args[0], rep)?;
            lf.set_val(iid, v)?;
        }

        Op::ChkClosure(name) => {
            let arg = lf.load_sxp(args[0])?;
            let sym = lf.symbol_const(name)?;
            lf.call_rt(&builtins::CHKFUN, &[sym.into(), arg.into()])?;
            lf.set_val(iid, arg.into())?;
        }

        Op::Missing(name) => {
            let sym = lf.symbol_const(name)?;
            let env = lf.lower_env_operand(iid)?;
            let res = lf.call_rt_val(&builtins::IS_MISSING, &[sym.into(), env.into()])?;
            lf.set_val(iid, res)?;
        }

        Op::Colon => {
            let src = lf.code.instr(iid).src_idx;
            let res = if lf.code.instr(iid).has_env() {
                let a = lf.load_sxp(args[0])?;
                let b = lf.load_sxp(args[1])?;
                let e = lf.lower_env_operand(iid)?;
                lf.call_rt_val(
                    &builtins::BINOP_ENV,
                    &[
                        a.into(),
                        b.into(),
                        e.into(),
                        lf.c_i32(src as i64).into(),
                        lf.c_i32(arith::BinopKind::Colon as i64).into(),
                    ],
                )?
            } else if lf.val_rep(args[0]) == Rep::Int32 && lf.val_rep(args[1]) == Rep::Int32 {
                let a = lf.load_val(args[0], Rep::Int32)?;
                let b = lf.load_val(args[1], Rep::Int32)?;
                lf.call_rt_val(&builtins::COLON, &[a.into(), b.into()])?
            } else {
                let a = lf.load_sxp(args[0])?;
                let b = lf.load_sxp(args[1])?;
                lf.call_rt_val(
                    &builtins::BINOP,
                    &[
                        a.into(),
                        b.into(),
                        lf.c_i32(arith::BinopKind::Colon as i64).into(),
                    ],
                )?
            };
            lf.set_val(iid, res)?;
        }

        Op::ColonInputEffects => {
            let a = lf.load_sxp(args[0])?;
            let b = lf.load_sxp(args[1])?;
            let src = lf.code.instr(iid).src_idx;
            let res = lf.call_rt_val(
                &builtins::COLON_INPUT_EFFECTS,
                &[a.into(), b.into(), lf.c_i32(src as i64).into()],
            )?;
            lf.set_val(iid, res)?;
        }

        Op::ColonCastLhs => {
            let a = lf.load_sxp(args[0])?;
            let res = lf.call_rt_val(&builtins::COLON_CAST_LHS, &[a.into()])?;
            lf.set_val(iid, res)?;
        }

        Op::ColonCastRhs => {
            let a = lf.load_sxp(args[0])?;
            let b = lf.load_sxp(args[1])?;
            let res = lf.call_rt_val(&builtins::COLON_CAST_RHS, &[a.into(), b.into()])?;
            lf.set_val(iid, res)?;
        }

        Op::Names => {
            let a = lf.load_sxp(args[0])?;
            let res = lf.call_rt_val(&builtins::NAMES, &[a.into()])?;
            lf.set_val(iid, res)?;
        }

        Op::SetNames => {
            let a = lf.load_sxp(args[0])?;
            let b = lf.load_sxp(args[1])?;
            let res = lf.call_rt_val(&builtins::SET_NAMES, &[a.into(), b.into()])?;
            lf.set_val(iid, res)?;
        }

        Op::XLength => {
            let a = lf.load_sxp(args[0])?;
            let n = lf
                .call_rt_val(&builtins::XLENGTH, &[a.into()])?
                .into_int_value();
            let res = lf.length_result(n, lf.instr_rep(iid))?;
            lf.set_val(iid, res)?;
        }

        Op::Is(check) => lf.lower_is(iid, &args, check)?,
        Op::IsType(test) => lf.lower_is_type(iid, &args, &test)?,
        Op::AsTest => lf.lower_as_test(iid, &args)?,
        Op::AsLogical => lf.lower_as_logical(iid, &args)?,

        // arithmetic family
        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::IDiv
        | Op::Mod
        | Op::Pow
        | Op::Eq
        | Op::Neq
        | Op::Lt
        | Op::Lte
        | Op::Gt
        | Op::Gte
        | Op::LAnd
        | Op::LOr
        | Op::Not
        | Op::Minus
        | Op::Plus => lf.lower_arith(iid, &op, &args)?,

        // vectors
        Op::Extract1_1D
        | Op::Extract1_2D
        | Op::Extract1_3D
        | Op::Extract2_1D
        | Op::Extract2_2D => lf.lower_extract(iid, &op, &args)?,
        Op::Subassign1_1D
        | Op::Subassign1_2D
        | Op::Subassign1_3D
        | Op::Subassign2_1D
        | Op::Subassign2_2D => lf.lower_subassign(iid, &op, &args)?,

        // environments
        Op::LdVar(_) | Op::LdDots | Op::LdVarSuper(_) => lf.lower_ldvar(iid, &op)?,
        Op::StVar { .. } | Op::StVarSuper(_) => lf.lower_stvar(iid, &op, &args)?,
        Op::MkEnv { .. } => lf.lower_mkenv(iid, &op, &args)?,
        Op::MaterializeEnv => {
            let env = lf.lower_env_operand(iid)?;
            let res = lf.call_rt_val(&builtins::MATERIALIZE_ENVIRONMENT, &[env.into()])?;
            lf.set_val(iid, res)?;
        }

        // calls
        Op::Call { .. }
        | Op::NamedCall { .. }
        | Op::StaticCall { .. }
        | Op::CallBuiltin(_) => lf.lower_call(iid, &op, &args)?,
        Op::CallSafeBuiltin(b) => lf.lower_safe_builtin(iid, b, &args)?,

        // contexts
        Op::PushContext => lf.lower_push_context(iid, &args)?,
        Op::PopContext { push } => lf.lower_pop_context(iid, push, &args)?,

        // not expressible natively
        Op::PrintInvocation | Op::Int3 => {
            lf.success = false;
        }
    }
    Ok(())
}

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    /// The environment operand as a boxed value.
    pub(crate) fn lower_env_operand(
        &mut self,
        iid: InstrId,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let env = self
            .code
            .instr(iid)
            .env
            .ok_or_else(|| Diagnostic::at_instr("missing environment operand", iid))?;
        self.load_sxp(env)
    }

    /// Common widening of an i64 length into the instruction's
    /// representation; boxes through real when it cannot fit an int.
    pub(crate) fn length_result(
        &mut self,
        n: inkwell::values::IntValue<'ctx>,
        rep: Rep,
    ) -> DiagnosticResult<inkwell::values::BasicValueEnum<'ctx>> {
        Ok(match rep {
            Rep::Int32 => ir(self.builder.build_int_truncate(n, self.t_i32, ""))?.into(),
            Rep::Float64 => ir(self
                .builder
                .build_unsigned_int_to_float(n, self.t_f64, ""))?
            .into(),
            _ => {
                let too_big = ir(self.builder.build_int_compare(
                    IntPredicate::UGT,
                    n,
                    self.c_u64(i32::MAX as u64),
                    "",
                ))?;
                let as_f = ir(self
                    .builder
                    .build_unsigned_int_to_float(n, self.t_f64, ""))?;
                let boxed_f = self.box_real(as_f)?;
                let as_i = ir(self.builder.build_int_truncate(n, self.t_i32, ""))?;
                let boxed_i = self.box_int(as_i)?;
                ir(self.builder.build_select(too_big, boxed_f, boxed_i, ""))?
            }
        })
    }

    fn lower_is(
        &mut self,
        iid: InstrId,
        args: &[Value],
        check: fern_pir::instr::IsCheck,
    ) -> DiagnosticResult<()> {
        use fern_pir::instr::IsCheck;
        let res = if self.val_rep(args[0]) == Rep::Boxed {
            let a = self.load_sxp(args[0])?;
            let kind = self.kind_of(a)?;
            let eq = |lf: &Self, k: ObjKind| {
                ir(lf.builder.build_int_compare(
                    IntPredicate::EQ,
                    kind,
                    lf.c_i32(k as i64),
                    "",
                ))
            };
            match check {
                IsCheck::Nil => eq(self, ObjKind::Nil)?,
                IsCheck::Logical => eq(self, ObjKind::Logical)?,
                IsCheck::Integer => eq(self, ObjKind::Int)?,
                IsCheck::Real => eq(self, ObjKind::Real)?,
                // generic vectors and pairlists alias for the guest
                IsCheck::Vector => {
                    let a = eq(self, ObjKind::List)?;
                    let b = eq(self, ObjKind::Pairlist)?;
                    ir(self.builder.build_or(a, b, ""))?
                }
                IsCheck::Pairlist => {
                    let a = eq(self, ObjKind::Pairlist)?;
                    let b = eq(self, ObjKind::Nil)?;
                    ir(self.builder.build_or(a, b, ""))?
                }
            }
        } else {
            let ty = self.type_of(args[0]);
            let matched = match check {
                IsCheck::Integer => ty.is_a(&PirType::int()),
                IsCheck::Logical => ty.is_a(&PirType::logical()),
                IsCheck::Real => ty.is_a(&PirType::real()),
                _ => false,
            };
            self.t_i1.const_int(matched as u64, false)
        };
        let wide = ir(self.builder.build_int_z_extend(res, self.t_i32, ""))?;
        self.set_val(iid, wide.into())
    }

    fn lower_is_type(
        &mut self,
        iid: InstrId,
        args: &[Value],
        test: &PirType,
    ) -> DiagnosticResult<()> {
        if self.instr_rep(iid) != Rep::Int32 {
            self.success = false;
            return Ok(());
        }
        let arg = args[0];
        if self.val_rep(arg) != Rep::Boxed {
            self.set_val(iid, self.c_i32(1).into())?;
            return Ok(());
        }

        let arg_ty = self.type_of(arg);
        let mut a = self.load_sxp(arg)?;
        if arg_ty.maybe_promise_wrapped() && test.maybe_promise_wrapped() {
            a = self.depromise(a)?;
        }

        let stripped = test.not_promise_wrapped();
        if stripped == PirType::simple_scalar_int() {
            let r = self.is_simple_scalar(a, ObjKind::Int)?;
            let wide = ir(self.builder.build_int_z_extend(r, self.t_i32, ""))?;
            return self.set_val(iid, wide.into());
        }
        if stripped == PirType::simple_scalar_lgl() {
            let r = self.is_simple_scalar(a, ObjKind::Logical)?;
            let wide = ir(self.builder.build_int_z_extend(r, self.t_i32, ""))?;
            return self.set_val(iid, wide.into());
        }
        if stripped == PirType::simple_scalar_real() {
            let r = self.is_simple_scalar(a, ObjKind::Real)?;
            let wide = ir(self.builder.build_int_z_extend(r, self.t_i32, ""))?;
            return self.set_val(iid, wide.into());
        }

        let kind = self.kind_of(a)?;
        let mut res = if test
            .no_attribs()
            .is_a(&PirType::logical().or_promise_wrapped())
        {
            ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                kind,
                self.c_i32(ObjKind::Logical as i64),
                "",
            ))?
        } else if test
            .no_attribs()
            .is_a(&PirType::int().or_promise_wrapped())
        {
            ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                kind,
                self.c_i32(ObjKind::Int as i64),
                "",
            ))?
        } else if test
            .no_attribs()
            .is_a(&PirType::real().or_promise_wrapped())
        {
            ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                kind,
                self.c_i32(ObjKind::Real as i64),
                "",
            ))?
        } else {
            ir(self.builder.build_int_compare(
                IntPredicate::NE,
                a,
                self.c_addr(self.rt.unbound_addr),
                "",
            ))?
        };

        if test.is_scalar() && !arg_ty.is_scalar() {
            let sc = self.is_scalar_cell(a)?;
            res = ir(self.builder.build_and(res, sc, ""))?;
        }
        if arg_ty.maybe_has_attrs() && !test.maybe_has_attrs() {
            let ok = self.fast_vecelt_ok(a)?;
            res = ir(self.builder.build_and(res, ok, ""))?;
        }
        if arg_ty.maybe_obj() && !test.maybe_obj() {
            let o = self.is_obj(a)?;
            let no = ir(self.builder.build_not(o, ""))?;
            res = ir(self.builder.build_and(res, no, ""))?;
        }
        let wide = ir(self.builder.build_int_z_extend(res, self.t_i32, ""))?;
        self.set_val(iid, wide.into())
    }

    fn lower_as_test(&mut self, iid: InstrId, args: &[Value]) -> DiagnosticResult<()> {
        let arg = args[0];
        if self.val_rep(arg) == Rep::Boxed {
            let a = self.load_sxp(arg)?;
            let res = self.call_rt_val(&builtins::AS_TEST, &[a.into()])?;
            return self.set_val(iid, res);
        }

        let done = self.new_block("astest.done");
        let is_na = self.new_block("astest.na");

        if self.val_rep(arg) == Rep::Float64 {
            let f = self.load_val(arg, Rep::Float64)?.into_float_value();
            let ok = ir(self
                .builder
                .build_float_compare(inkwell::FloatPredicate::OEQ, f, f, ""))?;
            let as_int = ir(self.builder.build_float_to_signed_int(f, self.t_i32, ""))?;
            self.set_val(iid, as_int.into())?;
            self.cond_br(ok, done, is_na, Some(BranchWeight::MostlyTrue))?;
        } else {
            let v = self.load_val(arg, Rep::Int32)?.into_int_value();
            let ok = ir(self.builder.build_int_compare(
                IntPredicate::NE,
                v,
                self.c_i32(crate::constants::NA_INT as i64),
                "",
            ))?;
            self.set_val(iid, v.into())?;
            self.cond_br(ok, done, is_na, Some(BranchWeight::MostlyTrue))?;
        }

        self.position_at(is_na);
        let msg = self.global_string("missing value where TRUE/FALSE needed")?;
        self.call_rt(&builtins::ERROR, &[msg.into()])?;
        ir(self.builder.build_return(Some(&self.null_ptr())))?;

        self.position_at(done);
        Ok(())
    }

    fn lower_as_logical(&mut self, iid: InstrId, args: &[Value]) -> DiagnosticResult<()> {
        let arg = args[0];
        let res = match self.val_rep(arg) {
            Rep::Boxed => {
                let a = self.load_sxp(arg)?;
                self.call_rt_val(&builtins::AS_LOGICAL, &[a.into()])?
            }
            // NA-exact narrowing covers both numeric representations
            _ => self.load_val(arg, Rep::Int32)?,
        };
        self.set_val(iid, res)
    }
}
