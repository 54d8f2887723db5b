//! Variable access and environment construction.
//!
//! Three tiers of variable access, fastest first:
//!
//! 1. stub environments created by this very code: direct slot access,
//!    falling through to the runtime lookup against the stub's parent
//!    when the slot was never explicitly bound;
//! 2. the inline binding cache: one pointer slot per (environment, name)
//!    holding the binding cell, populated by the cache-miss builtin and
//!    invalidated on environment creation and restarts;
//! 3. the plain runtime lookup.

use inkwell::values::PointerValue;
use inkwell::IntPredicate;

use fern_pir::{InstrId, Op, PirType, SymId, Value};

use crate::codegen::{ir, BranchWeight, LowerFunction};
use crate::constants::{ObjKind, NAMED_MAX, STUB_SLOT_PARENT};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::Rep;
use crate::runtime::builtins;

/// Missing locals carry this bit in the serialized name list handed to
/// the environment builtins.
const MISSING_NAME_BIT: u32 = 1 << 31;

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    /// The (stub-env, index) pair when `env_val` is a stub created here
    /// and `name` is one of its locals.
    fn stub_local(&self, env_val: Option<Value>, name: Option<SymId>) -> Option<(InstrId, i32, usize, bool)> {
        let Some(Value::Instr(e)) = env_val else {
            return None;
        };
        let Op::MkEnv { names, stub, .. } = &self.code.instr(e).op else {
            return None;
        };
        if !*stub {
            return None;
        }
        let name = name?;
        let idx = names.iter().position(|(n, _)| *n == name)? as i32;
        // whether the local was left unbound at creation
        let unbound_init = self.code.instr(e).args[idx as usize] == Value::UnboundValue;
        Some((e, idx, names.len(), unbound_init))
    }

    fn cache_slot(&self, env_val: Option<Value>, name: Option<SymId>) -> Option<usize> {
        let env = env_val?;
        let name = name?;
        self.bindings_cache.get(&env)?.get(&name).copied()
    }

    fn cache_slot_ptr(&self, offset: usize) -> DiagnosticResult<PointerValue<'ctx>> {
        let base = self
            .bindings_cache_base
            .ok_or_else(|| Diagnostic::new("binding cache has no backing storage"))?;
        unsafe {
            ir(self
                .builder
                .build_gep(self.t_ptr, base, &[self.c_i32(offset as i64)], "cache"))
        }
    }

    pub(crate) fn lower_ldvar(&mut self, iid: InstrId, op: &Op) -> DiagnosticResult<()> {
        let env_val = self.code.instr(iid).env;
        let (sym_id, is_dots, is_super) = match op {
            Op::LdVar(n) => (Some(*n), false, false),
            Op::LdVarSuper(n) => (Some(*n), false, true),
            Op::LdDots => (self.syms.get("..."), true, false),
            _ => return Err(Diagnostic::at_instr("not a variable load", iid)),
        };
        let sym_ptr = match sym_id {
            Some(n) => self.symbol_const(n)?,
            None => self.c_addr(self.rt.dots_sym_addr),
        };

        if is_super {
            // skip one environment before looking up
            let env = self.lower_env_operand(iid)?;
            let parent = self.cdr(env)?;
            let res = self
                .call_rt_val(&builtins::LDVAR, &[sym_ptr.into(), parent.into()])?
                .into_pointer_value();
            self.check_missing(res)?;
            self.check_unbound(res)?;
            return self.set_val(iid, res.into());
        }

        if let Some((_, idx, nlocals, unbound_init)) = self.stub_local(env_val, sym_id) {
            let e = self.lower_env_operand(iid)?;
            let mut res = self.env_stub_get(e, idx, nlocals)?;
            if unbound_init {
                // unassigned in the stub: defer to the lexical parent
                let hit = self.new_block("stubld.hit");
                let miss = self.new_block("stubld.miss");
                let done = self.new_block("stubld.done");
                let mut join = self.phi_join(Rep::Boxed);

                let unbound = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    res,
                    self.c_addr(self.rt.unbound_addr),
                    "",
                ))?;
                self.cond_br(unbound, miss, hit, None)?;

                self.position_at(hit);
                join.add(res.into(), self.cur_block());
                self.br(done)?;

                self.position_at(miss);
                let parent = self.env_stub_get(e, STUB_SLOT_PARENT, nlocals)?;
                let looked = self
                    .call_rt_val(&builtins::LDVAR, &[sym_ptr.into(), parent.into()])?;
                join.add(looked, self.cur_block());
                self.br(done)?;

                self.position_at(done);
                res = join.build(&self.builder)?.into_pointer_value();
            }
            return self.set_val(iid, res.into());
        }

        let for_update = self.inputs.needs_ldvar_for_update.contains(&iid);
        let res = if let Some(offset) = self.cache_slot(env_val, sym_id) {
            let cache_ptr = self.cache_slot_ptr(offset)?;
            let cache =
                ir(self.builder.build_load(self.t_ptr, cache_ptr, ""))?.into_pointer_value();

            let hit1 = self.new_block("ld.hit1");
            let hit2 = self.new_block("ld.hit2");
            let miss = self.new_block("ld.miss");
            let done = self.new_block("ld.done");
            let mut join = self.phi_join(Rep::Boxed);

            let as_int = ir(self.builder.build_ptr_to_int(cache, self.t_i64, ""))?;
            let sentinel = ir(self.builder.build_int_compare(
                IntPredicate::ULE,
                as_int,
                self.c_u64(1),
                "",
            ))?;
            self.cond_br(sentinel, miss, hit1, Some(BranchWeight::MostlyFalse))?;

            self.position_at(hit1);
            let val = self.car(cache)?;
            let unbound = ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                val,
                self.c_addr(self.rt.unbound_addr),
                "",
            ))?;
            self.cond_br(unbound, miss, hit2, Some(BranchWeight::MostlyFalse))?;

            self.position_at(hit2);
            self.ensure_named(val)?;
            join.add(val.into(), self.cur_block());
            self.br(done)?;

            self.position_at(miss);
            let env = self.lower_env_operand(iid)?;
            let res0 = self
                .call_rt_val(
                    &builtins::LDVAR_CACHE_MISS,
                    &[sym_ptr.into(), env.into(), cache_ptr.into()],
                )?
                .into_pointer_value();
            if for_update {
                self.ensure_shared(res0)?;
            }
            join.add(res0.into(), self.cur_block());
            self.br(done)?;

            self.position_at(done);
            join.build(&self.builder)?.into_pointer_value()
        } else {
            let setter = if for_update {
                &builtins::LDVAR_FOR_UPDATE
            } else {
                &builtins::LDVAR
            };
            let env = self.lower_env_operand(iid)?;
            self.call_rt_val(setter, &[sym_ptr.into(), env.into()])?
                .into_pointer_value()
        };

        if !is_dots {
            self.check_missing(res)?;
            self.check_unbound(res)?;
        }
        self.set_val(iid, res.into())
    }

    pub(crate) fn lower_stvar(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let env_val = self.code.instr(iid).env;

        let (name, is_starg) = match op {
            Op::StVar { name, is_starg } => (*name, *is_starg),
            Op::StVarSuper(name) => {
                // a super-store through stubs cannot be expressed natively
                if let Some(Value::Instr(e)) = env_val {
                    if let Op::MkEnv { stub, .. } = &self.code.instr(e).op {
                        let parent_stub = match self.code.instr(e).env {
                            Some(Value::Instr(p)) => {
                                matches!(self.code.instr(p).op, Op::MkEnv { stub: true, .. })
                            }
                            _ => false,
                        };
                        if *stub || parent_stub {
                            self.success = false;
                            return Ok(());
                        }
                    }
                }
                let sym = self.symbol_const(*name)?;
                let val = self.load_sxp(args[0])?;
                let env = self.lower_env_operand(iid)?;
                self.call_rt(
                    &builtins::DEFVAR,
                    &[sym.into(), val.into(), env.into()],
                )?;
                return Ok(());
            }
            _ => return Err(Diagnostic::at_instr("not a variable store", iid)),
        };

        let sym = self.symbol_const(name)?;
        let pir_val = args[0];
        let val_rep = self.val_rep(pir_val);

        if let Some((_, idx, nlocals, _)) = self.stub_local(env_val, Some(name)) {
            let e = self.lower_env_operand(iid)?;
            let done = self.new_block("stubst.done");
            let cur = self.env_stub_get(e, idx, nlocals)?;

            if val_rep != Rep::Boxed {
                // reuse the slot's scalar payload when nothing shares it
                let fast = self.new_block("stubst.inplace");
                let fallback = self.new_block("stubst.fresh");
                let expected = if val_rep == Rep::Int32 {
                    ObjKind::Int
                } else {
                    ObjKind::Real
                };
                let obj = self.is_obj(cur)?;
                let not_obj = ir(self.builder.build_not(obj, ""))?;
                let sh = self.shared(cur)?;
                let not_shared = ir(self.builder.build_not(sh, ""))?;
                let kind = self.kind_of(cur)?;
                let kind_ok = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    kind,
                    self.c_i32(expected as i64),
                    "",
                ))?;
                let scalar = self.is_scalar_cell(cur)?;
                let reuse = ir(self.builder.build_and(not_obj, not_shared, ""))?;
                let reuse = ir(self.builder.build_and(reuse, kind_ok, ""))?;
                let reuse = ir(self.builder.build_and(reuse, scalar, ""))?;
                self.cond_br(reuse, fast, fallback, Some(BranchWeight::MostlyTrue))?;

                self.position_at(fast);
                let v = self.load_val(pir_val, val_rep)?;
                let ty = self.type_of(pir_val);
                self.assign_vector(cur, self.c_u64(0), v, &ty)?;
                self.br(done)?;

                self.position_at(fallback);
                let val = self.load_sxp(pir_val)?;
                self.ensure_named(val)?;
                self.env_stub_set(e, idx, val, nlocals, !is_starg)?;
                self.br(done)?;
            } else {
                let val = self.load_sxp(pir_val)?;
                let same = self.new_block("stubst.same");
                let different = self.new_block("stubst.diff");
                let eq = ir(self.builder.build_int_compare(IntPredicate::EQ, val, cur, ""))?;
                self.cond_br(eq, same, different, None)?;

                self.position_at(same);
                self.ensure_named(val)?;
                if !is_starg {
                    self.env_stub_set_not_missing(e, idx)?;
                }
                self.br(done)?;

                self.position_at(different);
                self.increment_named(val, NAMED_MAX)?;
                self.env_stub_set(e, idx, val, nlocals, !is_starg)?;
                self.br(done)?;
            }

            self.position_at(done);
            return Ok(());
        }

        let integer_value_case = val_rep == Rep::Int32 && self.type_of(pir_val).is_a(&PirType::int());
        let setter = if is_starg {
            &builtins::STARG
        } else if integer_value_case {
            &builtins::STVAR_INT
        } else {
            &builtins::STVAR
        };

        if let Some(offset) = self.cache_slot(env_val, Some(name)) {
            let cache_ptr = self.cache_slot_ptr(offset)?;
            let cache =
                ir(self.builder.build_load(self.t_ptr, cache_ptr, ""))?.into_pointer_value();

            let hit1 = self.new_block("st.hit1");
            let hit2 = self.new_block("st.hit2");
            let hit3 = self.new_block("st.write");
            let identical = self.new_block("st.identical");
            let miss = self.new_block("st.miss");
            let done = self.new_block("st.done");

            let as_int = ir(self.builder.build_ptr_to_int(cache, self.t_i64, ""))?;
            let sentinel = ir(self.builder.build_int_compare(
                IntPredicate::ULE,
                as_int,
                self.c_u64(1),
                "",
            ))?;
            self.cond_br(sentinel, miss, hit1, Some(BranchWeight::MostlyFalse))?;

            self.position_at(hit1);
            let bound = self.car(cache)?;
            let unbound = ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                bound,
                self.c_addr(self.rt.unbound_addr),
                "",
            ))?;
            self.cond_br(unbound, miss, hit2, Some(BranchWeight::MostlyFalse))?;

            self.position_at(hit2);
            let mut new_val: Option<PointerValue<'ctx>> = None;
            if integer_value_case {
                let hit_int = self.new_block("st.intslot");
                let hit_int2 = self.new_block("st.intwrite");
                let fallback_int = self.new_block("st.intbox");
                let kind = self.kind_of(bound)?;
                let kind_ok = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    kind,
                    self.c_i32(ObjKind::Int as i64),
                    "",
                ))?;
                let scalar = self.is_scalar_cell(bound)?;
                let slot_ok = ir(self.builder.build_and(kind_ok, scalar, ""))?;
                let sh = self.shared(bound)?;
                let not_shared = ir(self.builder.build_not(sh, ""))?;
                let reuse = ir(self.builder.build_and(slot_ok, not_shared, ""))?;
                self.cond_br(reuse, hit_int, fallback_int, None)?;

                self.position_at(hit_int);
                let fresh = self.load_val(pir_val, Rep::Int32)?;
                let ty = PirType::int().not_object();
                let current = self.access_vector(bound, self.c_u64(0), &ty)?;
                let same = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    fresh.into_int_value(),
                    current.into_int_value(),
                    "",
                ))?;
                self.cond_br(same, identical, hit_int2, None)?;

                self.position_at(hit_int2);
                self.assign_vector(bound, self.c_u64(0), fresh, &ty)?;
                self.br(done)?;

                self.position_at(fallback_int);
                let boxed = self.load_sxp(pir_val)?;
                new_val = Some(boxed);
                self.br(hit3)?;
            } else {
                let boxed = self.load_sxp(pir_val)?;
                new_val = Some(boxed);
                let same = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    bound,
                    boxed,
                    "",
                ))?;
                self.cond_br(same, identical, hit3, Some(BranchWeight::MostlyFalse))?;
            }

            self.position_at(hit3);
            let fresh = new_val
                .ok_or_else(|| Diagnostic::at_instr("store value never materialized", iid))?;
            self.increment_named(fresh, NAMED_MAX)?;
            self.set_car(cache, fresh, true)?;
            self.br(done)?;

            self.position_at(identical);
            // unchanged binding, but the value is now referenced by a name
            self.ensure_named(bound)?;
            self.br(done)?;

            self.position_at(miss);
            let env = self.lower_env_operand(iid)?;
            let payload = if setter.params[1] == crate::runtime::AbiType::Int {
                self.load_val(pir_val, Rep::Int32)?
            } else {
                self.load_sxp(pir_val)?.into()
            };
            self.call_rt(setter, &[sym.into(), payload.into(), env.into()])?;
            self.br(done)?;

            self.position_at(done);
        } else {
            let env = self.lower_env_operand(iid)?;
            let payload = if setter.params[1] == crate::runtime::AbiType::Int {
                self.load_val(pir_val, Rep::Int32)?
            } else {
                self.load_sxp(pir_val)?.into()
            };
            self.call_rt(setter, &[sym.into(), payload.into(), env.into()])?;
        }
        Ok(())
    }

    pub(crate) fn lower_mkenv(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let Op::MkEnv {
            names,
            stub,
            context,
        } = op
        else {
            return Err(Diagnostic::at_instr("not a MkEnv", iid));
        };
        let parent = self.lower_env_operand(iid)?;

        let encoded: Vec<u32> = names
            .iter()
            .map(|(n, missing)| n.0 | if *missing { MISSING_NAME_BIT } else { 0 })
            .collect();
        let names_store = self.global_i32_array(&encoded, "envnames");

        if *stub {
            let env = self
                .call_rt_val(
                    &builtins::CREATE_STUB_ENVIRONMENT,
                    &[
                        parent.into(),
                        self.c_i32(names.len() as i64).into(),
                        names_store.into(),
                        self.c_i32(*context as i64).into(),
                    ],
                )?
                .into_pointer_value();
            for (pos, v) in args.iter().enumerate() {
                let vn = self.load_sxp(*v)?;
                self.env_stub_set(env, pos as i32, vn, names.len(), false)?;
                self.increment_named(vn, NAMED_MAX)?;
            }
            return self.set_val(iid, env.into());
        }

        // binding cells are consed right-to-left
        let mut arglist = self.c_addr(self.rt.nil_addr);
        for ((sym, missing), v) in names.iter().zip(args.iter()).rev() {
            let val = self.load_sxp(*v)?;
            let name = self.symbol_const(*sym)?;
            let ctor = if *missing {
                &builtins::CREATE_MISSING_BINDING_CELL
            } else {
                &builtins::CREATE_BINDING_CELL
            };
            arglist = self
                .call_rt_val(ctor, &[val.into(), name.into(), arglist.into()])?
                .into_pointer_value();
        }

        let env = self.call_rt_val(
            &builtins::CREATE_ENVIRONMENT,
            &[
                parent.into(),
                arglist.into(),
                self.c_i32(*context as i64).into(),
            ],
        )?;
        self.set_val(iid, env)?;

        // a fresh environment invalidates its binding-cache entries
        if let Some(slots) = self.bindings_cache.get(&Value::Instr(iid)).cloned() {
            for (_, offset) in slots {
                let p = self.cache_slot_ptr(offset)?;
                ir(self.builder.build_store(p, self.null_ptr()))?;
            }
        }
        Ok(())
    }
}
