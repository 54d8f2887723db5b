//! Push/pop call contexts.
//!
//! A pushed context is a three-exit state machine around a `sigsetjmp`:
//! straight fall-through, a restart-longjmp that restores every live
//! variable from its snapshot and resumes after the setjmp, and a
//! value-longjmp that lands on the matching pop's target with the
//! returned value. Boxed snapshots live in frame slots reserved at
//! setup (so the GC can see them); unboxed snapshots use allocas.

use inkwell::values::{BasicValueEnum, PointerValue};
use inkwell::IntPredicate;

use fern_pir::{InstrId, Value};

use crate::codegen::types_llvm::rcntxt_field;
use crate::codegen::{ir, LowerFunction};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::Rep;
use crate::runtime::builtins;

enum Snapshot<'ctx> {
    FrameSlot(usize),
    Alloca(PointerValue<'ctx>, Rep),
}

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub(crate) fn lower_push_context(
        &mut self,
        iid: InstrId,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let ast = self.load_sxp(args[0])?;
        let op = self.load_sxp(args[1])?;
        let sysparent = self.lower_env_operand(iid)?;

        self.in_push_context += 1;

        let (rcntxt, saved_boxed_pos, pop_target, result, result_rep) = {
            let data = self
                .contexts
                .get(&iid)
                .ok_or_else(|| Diagnostic::at_instr("push context was never set up", iid))?;
            (
                data.rcntxt,
                data.saved_boxed_pos.clone(),
                data.pop_context_target,
                data.result,
                data.result_rep,
            )
        };

        self.call_rt(
            &builtins::BEGIN_CLOSURE_CONTEXT,
            &[ast.into(), rcntxt.into(), sysparent.into(), op.into()],
        )?;

        // snapshot everything live across the push so a restart can
        // rebuild the frame
        let mut live: Vec<InstrId> = self
            .variables
            .iter()
            .filter(|(j, var)| var.initialized && self.liveness.live_after(iid, **j))
            .map(|(j, _)| *j)
            .collect();
        live.sort();

        let mut saved: Vec<(InstrId, Snapshot<'ctx>)> = Vec::new();
        for j in live {
            let rep = self.instr_rep(j);
            let value = self.get_variable(j)?;
            if rep == Rep::Boxed {
                let pos = *saved_boxed_pos
                    .get(&j)
                    .ok_or_else(|| Diagnostic::at_instr("no snapshot slot reserved", j))?;
                self.set_local(pos, value.into_pointer_value())?;
                saved.push((j, Snapshot::FrameSlot(pos)));
            } else {
                let slot = self.top_alloca(self.rep_type(rep), 1, "saved")?;
                ir(self.builder.build_store(slot, value))?;
                saved.push((j, Snapshot::Alloca(slot, rep)));
            }
        }

        // arm the jump buffer
        let buf = ir(self.builder.build_struct_gep(
            self.guest.rcntxt,
            rcntxt,
            rcntxt_field::JMP_BUF,
            "jmpbuf",
        ))?;
        let setjmp = self.declare_setjmp();
        let cs = ir(self
            .builder
            .build_call(setjmp, &[buf.into(), self.c_i32(0).into()], "setjmp"))?;
        let status = match cs.try_as_basic_value() {
            either::Either::Left(v) => v.into_int_value(),
            either::Either::Right(_) => return Err(Diagnostic::new("setjmp returned void")),
        };

        let did_longjmp = self.new_block("ctx.longjmp");
        let cont = self.new_block("ctx.cont");
        let direct = ir(self
            .builder
            .build_int_compare(IntPredicate::EQ, status, self.c_i32(0), ""))?;
        self.cond_br(direct, cont, did_longjmp, None)?;

        // a longjmp either asks for a restart or carries a return value
        self.position_at(did_longjmp);
        let returned_slot = self.c_addr(self.rt.returned_value_addr);
        let returned =
            ir(self.builder.build_load(self.t_ptr, returned_slot, "returned"))?
                .into_pointer_value();
        let restart = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            returned,
            self.c_addr(self.rt.restart_token_addr),
            "",
        ))?;
        let longjmp_restart = self.new_block("ctx.restart");
        let longjmp_ret = self.new_block("ctx.return");
        self.cond_br(restart, longjmp_restart, longjmp_ret, None)?;

        // restart: restore the frame and resume after the setjmp
        self.position_at(longjmp_restart);
        for (j, snap) in &saved {
            let value: BasicValueEnum<'ctx> = match snap {
                Snapshot::FrameSlot(pos) => self.get_local(*pos)?.into(),
                Snapshot::Alloca(slot, rep) => {
                    ir(self.builder.build_load(self.rep_type(*rep), *slot, ""))?
                }
            };
            self.update_variable(*j, value)?;
        }
        // a longjmp may have mutated any environment behind our back
        let cache_slots: Vec<usize> = self
            .bindings_cache
            .values()
            .flat_map(|m| m.values().copied())
            .collect();
        for offset in cache_slots {
            let base = self
                .bindings_cache_base
                .ok_or_else(|| Diagnostic::new("binding cache has no backing storage"))?;
            let p = unsafe {
                ir(self
                    .builder
                    .build_gep(self.t_ptr, base, &[self.c_i32(offset as i64)], ""))?
            };
            ir(self.builder.build_store(p, self.null_ptr()))?;
        }
        self.br(cont)?;

        // return: stash the value and skip ahead to the pop
        self.position_at(longjmp_ret);
        let to_store: BasicValueEnum<'ctx> = match result_rep {
            Rep::Int32 => self.unbox_int_lgl(returned)?.into(),
            Rep::Float64 => self.unbox_real_int_lgl(returned)?.into(),
            _ => returned.into(),
        };
        ir(self.builder.build_store(result, to_store))?;
        self.br(pop_target)?;

        self.position_at(cont);
        Ok(())
    }

    pub(crate) fn lower_pop_context(
        &mut self,
        iid: InstrId,
        push: InstrId,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let (rcntxt, pop_target, result, result_rep) = {
            let data = self
                .contexts
                .get(&push)
                .ok_or_else(|| Diagnostic::at_instr("pop without matching push", iid))?;
            (
                data.rcntxt,
                data.pop_context_target,
                data.result,
                data.result_rep,
            )
        };

        let arg = self.load_val(args[0], result_rep)?;
        ir(self.builder.build_store(result, arg))?;
        self.br(pop_target)?;

        // every exit of the context funnels through here
        self.position_at(pop_target);
        let ret = ir(self
            .builder
            .build_load(self.rep_type(result_rep), result, "ctxres"))?;
        let boxed_ret = match result_rep {
            Rep::Int32 => self.box_int(ret.into_int_value())?,
            Rep::Float64 => self.box_real(ret.into_float_value())?,
            _ => ret.into_pointer_value(),
        };
        self.call_rt(
            &builtins::END_CLOSURE_CONTEXT,
            &[rcntxt.into(), boxed_ret.into()],
        )?;
        self.in_push_context = self.in_push_context.saturating_sub(1);

        if self.instr_rep(iid) == Rep::Boxed {
            self.set_val(iid, boxed_ret.into())
        } else {
            self.set_val(iid, ret)
        }
    }
}
