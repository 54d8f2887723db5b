//! Call lowering.
//!
//! All call shapes share one frame protocol: grow the node stack by the
//! argument count, store the boxed arguments with zeroed type tags,
//! invoke the runtime entry, then pop the frame. Dots expansion hands the
//! frame over to the runtime instead of popping it. A statically resolved
//! native target with the no-reflection property is invoked directly,
//! bypassing the trampoline.

use fern_pir::{Builtin, InstrId, Op, Value};

use crate::codegen::{ir, LowerFunction};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::runtime::builtins;

/// Name-list encoding for `named_call`/`dots_call`: symbol ids, with two
/// reserved values.
pub(crate) const NO_NAME: u32 = u32::MAX;
pub(crate) const DOTS_NAME: u32 = u32::MAX - 1;

/// Where the callee object comes from.
pub(crate) enum Callee {
    /// A PIR value to load.
    Dynamic(Value),
    /// A known object address.
    Static(usize),
}

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub(crate) fn lower_call(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let src = self.code.instr(iid).src_idx;
        match op {
            Op::Call { assumptions } => {
                let callee = args[0];
                let call_args = &args[1..];
                if self.compile_dotcall(iid, call_args, Callee::Dynamic(callee), &[])? {
                    return Ok(());
                }
                let cls = self.load_sxp(callee)?;
                let env = self.lower_env_operand(iid)?;
                let n = call_args.len();
                let asmpt = *assumptions;
                let res = self.with_call_frame(
                    call_args,
                    |lf| {
                        lf.call_rt_val(
                            &builtins::CALL,
                            &[
                                lf.param_code().into(),
                                lf.c_i32(src as i64).into(),
                                cls.into(),
                                env.into(),
                                lf.c_i64(n as i64).into(),
                                lf.c_i64(asmpt as i64).into(),
                            ],
                        )
                    },
                    true,
                )?;
                self.set_val(iid, res)
            }

            Op::NamedCall { names, assumptions } => {
                let callee = args[0];
                let call_args = &args[1..];
                if self.compile_dotcall(iid, call_args, Callee::Dynamic(callee), names)? {
                    return Ok(());
                }
                let encoded: Vec<u32> = names.iter().map(|n| n.0).collect();
                let names_store = self.global_i32_array(&encoded, "callnames");
                let cls = self.load_sxp(callee)?;
                let env = self.lower_env_operand(iid)?;
                let n = call_args.len();
                let asmpt = *assumptions;
                let res = self.with_call_frame(
                    call_args,
                    |lf| {
                        lf.call_rt_val(
                            &builtins::NAMED_CALL,
                            &[
                                lf.param_code().into(),
                                lf.c_i32(src as i64).into(),
                                cls.into(),
                                env.into(),
                                lf.c_i64(n as i64).into(),
                                names_store.into(),
                                lf.c_i64(asmpt as i64).into(),
                            ],
                        )
                    },
                    true,
                )?;
                self.set_val(iid, res)
            }

            Op::StaticCall {
                callee_addr,
                target,
                assumptions,
            } => self.compile_static_call(iid, args, *callee_addr, *target, *assumptions, src),

            Op::CallBuiltin(b) => {
                let obj = self.builtin_object(iid, *b)?;
                if self.compile_dotcall(iid, args, Callee::Static(obj), &[])? {
                    return Ok(());
                }
                let env = if self.code.instr(iid).has_env() {
                    self.lower_env_operand(iid)?
                } else {
                    self.c_addr(self.rt.base_env_addr)
                };
                let res = self.call_guest_builtin(iid, *b, args, env)?;
                self.set_val(iid, res)
            }

            _ => Err(Diagnostic::at_instr("not a call", iid)),
        }
    }

    pub(crate) fn builtin_object(&self, iid: InstrId, b: Builtin) -> DiagnosticResult<usize> {
        self.rt
            .builtin_addr(b.runtime_id())
            .ok_or_else(|| Diagnostic::at_instr(format!("no runtime object for {}", b.name()), iid))
    }

    /// The generic builtin invocation, used by `CallBuiltin` and as the
    /// safe-builtin fallback.
    pub(crate) fn call_guest_builtin(
        &mut self,
        iid: InstrId,
        b: Builtin,
        args: &[Value],
        env: inkwell::values::PointerValue<'ctx>,
    ) -> DiagnosticResult<inkwell::values::BasicValueEnum<'ctx>> {
        let src = self.code.instr(iid).src_idx;
        let obj = self.builtin_object(iid, b)?;
        let builtin_obj = self.c_addr(obj);
        let n = args.len();
        self.with_call_frame(
            args,
            |lf| {
                lf.call_rt_val(
                    &builtins::CALL_BUILTIN,
                    &[
                        lf.param_code().into(),
                        lf.c_i32(src as i64).into(),
                        builtin_obj.into(),
                        env.into(),
                        lf.c_i64(n as i64).into(),
                    ],
                )
            },
            true,
        )
    }

    fn compile_static_call(
        &mut self,
        iid: InstrId,
        args: &[Value],
        callee_addr: usize,
        target: Option<fern_pir::instr::NativeTarget>,
        assumptions: u64,
        src: u32,
    ) -> DiagnosticResult<()> {
        let env = self.lower_env_operand(iid)?;
        let n = args.len();

        if let Some(t) = target {
            if let (Some(fn_addr), true) = (t.fn_addr, t.no_reflection) {
                // a compiled no-reflection body can be entered directly,
                // frame pointer in hand
                let fn_ty = self.t_ptr.fn_type(
                    &[
                        self.t_ptr.into(),
                        self.t_ptr.into(),
                        self.t_ptr.into(),
                        self.t_ptr.into(),
                    ],
                    false,
                );
                let trg = self.c_addr(fn_addr);
                let code = self.c_addr(t.code_addr);
                let callee = self.c_addr(callee_addr);
                let res = self.with_call_frame(
                    args,
                    |lf| {
                        let arglist = lf.nodestack_ptr()?;
                        let cs = ir(lf.builder.build_indirect_call(
                            fn_ty,
                            trg,
                            &[code.into(), arglist.into(), env.into(), callee.into()],
                            "staticcall",
                        ))?;
                        match cs.try_as_basic_value() {
                            either::Either::Left(v) => Ok(v),
                            either::Either::Right(_) => {
                                Err(Diagnostic::new("native target returned void"))
                            }
                        }
                    },
                    true,
                )?;
                return self.set_val(iid, res);
            }

            let callee = self.c_addr(callee_addr);
            let code = self.c_addr(t.code_addr);
            let res = self.with_call_frame(
                args,
                |lf| {
                    lf.call_rt_val(
                        &builtins::NATIVE_CALL_TRAMPOLINE,
                        &[
                            callee.into(),
                            code.into(),
                            lf.c_i32(src as i64).into(),
                            env.into(),
                            lf.c_i64(n as i64).into(),
                            lf.c_i64(assumptions as i64).into(),
                        ],
                    )
                },
                true,
            )?;
            return self.set_val(iid, res);
        }

        // no native version: dispatch like a generic call on the known
        // closure object
        let callee = self.c_addr(callee_addr);
        let res = self.with_call_frame(
            args,
            |lf| {
                lf.call_rt_val(
                    &builtins::CALL,
                    &[
                        lf.param_code().into(),
                        lf.c_i32(src as i64).into(),
                        callee.into(),
                        env.into(),
                        lf.c_i64(n as i64).into(),
                        lf.c_i64(assumptions as i64).into(),
                    ],
                )
            },
            true,
        )?;
        self.set_val(iid, res)
    }

    /// Dots dispatch: when any argument is an `ExpandDots`, the whole call
    /// goes through `dots_call` with a per-argument name table, and the
    /// frame is left for the runtime to consume.
    pub(crate) fn compile_dotcall(
        &mut self,
        iid: InstrId,
        call_args: &[Value],
        callee: Callee,
        names: &[fern_pir::SymId],
    ) -> DiagnosticResult<bool> {
        let mut seen_dots = false;
        let mut encoded: Vec<u32> = Vec::with_capacity(call_args.len());
        for (pos, v) in call_args.iter().enumerate() {
            let is_dots = matches!(
                v,
                Value::Instr(i) if matches!(self.code.instr(*i).op, Op::ExpandDots)
            );
            if is_dots {
                seen_dots = true;
                encoded.push(DOTS_NAME);
            } else {
                encoded.push(names.get(pos).map(|s| s.0).unwrap_or(NO_NAME));
            }
        }
        if !seen_dots {
            return Ok(false);
        }

        let src = self.code.instr(iid).src_idx;
        let assumptions = match &self.code.instr(iid).op {
            Op::Call { assumptions } => *assumptions,
            Op::NamedCall { assumptions, .. } => *assumptions,
            Op::StaticCall { assumptions, .. } => *assumptions,
            _ => 0,
        };
        let names_store = self.global_i32_array(&encoded, "dotnames");
        let callee_ptr = match callee {
            Callee::Dynamic(v) => self.load_sxp(v)?,
            Callee::Static(addr) => self.c_addr(addr),
        };
        let env = if self.code.instr(iid).has_env() {
            self.lower_env_operand(iid)?
        } else {
            self.c_addr(self.rt.base_env_addr)
        };
        let n = call_args.len();
        let res = self.with_call_frame(
            call_args,
            |lf| {
                lf.call_rt_val(
                    &builtins::DOTS_CALL,
                    &[
                        lf.param_code().into(),
                        lf.c_i32(src as i64).into(),
                        callee_ptr.into(),
                        env.into(),
                        lf.c_i64(n as i64).into(),
                        names_store.into(),
                        lf.c_i64(assumptions as i64).into(),
                    ],
                )
            },
            // the dots call consumes the frame itself
            false,
        )?;
        self.set_val(iid, res)?;
        Ok(true)
    }
}
