//! Speculative inlining of safe builtins.
//!
//! "Safe" builtins cannot trigger reflection, so many collapse to a few
//! native instructions when the operand representations cooperate: header
//! tests for the type predicates, intrinsics for `abs`/`sqrt`, direct
//! vector fills for `c`/`list`. Anything that does not match a fast case
//! falls through to the generic builtin invocation against the base
//! environment.

use inkwell::values::BasicValueEnum;
use inkwell::{FloatPredicate, IntPredicate};

use fern_pir::{Builtin, Const, InstrId, Op, PirType, Value};

use crate::codegen::{ir, BranchWeight, LowerFunction};
use crate::constants::{ObjKind, NA_INT};
use crate::diagnostics::DiagnosticResult;
use crate::rep::Rep;
use crate::runtime::builtins;

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub(crate) fn lower_safe_builtin(
        &mut self,
        iid: InstrId,
        b: Builtin,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        let obj = self.builtin_object(iid, b)?;
        if self.dotcall_safe(iid, args, obj)? {
            return Ok(());
        }

        if self.try_inline_bitwise(iid, b, args)? {
            self.fix_visibility(iid)?;
            return Ok(());
        }
        if args.len() == 1 && self.try_inline_unary(iid, b, args[0])? {
            self.fix_visibility(iid)?;
            return Ok(());
        }
        if args.len() == 2 && self.try_inline_binary(iid, b, args)? {
            self.fix_visibility(iid)?;
            return Ok(());
        }
        if self.try_inline_variadic(iid, b, args)? {
            self.fix_visibility(iid)?;
            return Ok(());
        }

        // some safe builtins still resolve names in the base env
        let base = self.c_addr(self.rt.base_env_addr);
        let res = self.call_guest_builtin(iid, b, args, base)?;
        self.set_val(iid, res)
    }

    fn dotcall_safe(
        &mut self,
        iid: InstrId,
        args: &[Value],
        obj: usize,
    ) -> DiagnosticResult<bool> {
        self.compile_dotcall(iid, args, super::calls::Callee::Static(obj), &[])
    }

    fn fix_visibility(&mut self, iid: InstrId) -> DiagnosticResult<()> {
        if self
            .code
            .instr(iid)
            .effects
            .includes(fern_pir::Effect::Visibility)
        {
            self.set_visible(true)?;
        }
        Ok(())
    }

    /// A true/false answer in the instruction's representation.
    fn bool_result(
        &mut self,
        cond: inkwell::values::IntValue<'ctx>,
        rep: Rep,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let t = self.load_typed(Value::True, &PirType::simple_scalar_lgl().not_na(), rep)?;
        let f = self.load_typed(Value::False, &PirType::simple_scalar_lgl().not_na(), rep)?;
        ir(self.builder.build_select(cond, t, f, ""))
    }

    fn const_bool(&mut self, iid: InstrId, truth: bool) -> DiagnosticResult<()> {
        let rep = self.instr_rep(iid);
        let v = self.load_typed(
            if truth { Value::True } else { Value::False },
            &PirType::simple_scalar_lgl().not_na(),
            rep,
        )?;
        self.set_val(iid, v)
    }

    fn kind_test(&mut self, iid: InstrId, arg: Value, kind: ObjKind) -> DiagnosticResult<()> {
        let rep = self.instr_rep(iid);
        if self.val_rep(arg) != Rep::Boxed {
            return self.const_bool(iid, false);
        }
        let a = self.load_sxp(arg)?;
        let k = self.kind_of(a)?;
        let hit = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            k,
            self.c_i32(kind as i64),
            "",
        ))?;
        let v = self.bool_result(hit, rep)?;
        self.set_val(iid, v)
    }

    fn try_inline_bitwise(
        &mut self,
        iid: InstrId,
        b: Builtin,
        args: &[Value],
    ) -> DiagnosticResult<bool> {
        use Builtin::*;
        if self.instr_rep(iid) != Rep::Int32 || args.len() != 2 {
            return Ok(false);
        }
        let shift = matches!(b, BitwiseShiftL | BitwiseShiftR);
        if !shift && !matches!(b, BitwiseAnd | BitwiseOr | BitwiseXor) {
            return Ok(false);
        }

        let num = PirType::num().not_object().scalar();
        let eff_rep = |lf: &Self, v: Value| {
            let r = lf.val_rep(v);
            if r == Rep::Boxed && lf.type_of(v).is_a(&num) {
                Rep::Float64
            } else {
                r
            }
        };
        let x_rep = eff_rep(self, args[0]);
        let y_rep = eff_rep(self, args[1]);
        if x_rep == Rep::Boxed || y_rep == Rep::Boxed {
            return Ok(false);
        }

        let is_na = self.new_block("bitw.na");
        let done = self.new_block("bitw.done");
        let mut res = self.phi_join(Rep::Int32);

        let mut native = Vec::with_capacity(2);
        for (v, rep) in [(args[0], x_rep), (args[1], y_rep)] {
            if rep == Rep::Float64 {
                let f = self.load_val(v, Rep::Float64)?;
                self.nacheck(f, is_na, None)?;
            }
            let as_int = self.load_val(v, Rep::Int32)?.into_int_value();
            if rep == Rep::Int32 {
                self.nacheck(as_int.into(), is_na, None)?;
            }
            native.push(as_int);
        }
        let (x, y) = (native[0], native[1]);

        let v = match b {
            BitwiseShiftL | BitwiseShiftR => {
                // shift amounts outside 0..31 overflow to NA
                let ok1 = self.new_block("bitw.lo");
                let neg = ir(self
                    .builder
                    .build_int_compare(IntPredicate::SLT, y, self.c_i32(0), ""))?;
                self.cond_br(neg, is_na, ok1, Some(BranchWeight::MostlyFalse))?;
                self.position_at(ok1);

                let ok2 = self.new_block("bitw.hi");
                let big = ir(self
                    .builder
                    .build_int_compare(IntPredicate::SGT, y, self.c_i32(31), ""))?;
                self.cond_br(big, is_na, ok2, Some(BranchWeight::MostlyFalse))?;
                self.position_at(ok2);

                if matches!(b, BitwiseShiftL) {
                    ir(self.builder.build_left_shift(x, y, ""))?
                } else {
                    ir(self.builder.build_right_shift(x, y, false, ""))?
                }
            }
            BitwiseAnd => ir(self.builder.build_and(x, y, ""))?,
            BitwiseOr => ir(self.builder.build_or(x, y, ""))?,
            _ => ir(self.builder.build_xor(x, y, ""))?,
        };
        res.add(v.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_na);
        res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)?;
        Ok(true)
    }

    fn try_inline_unary(
        &mut self,
        iid: InstrId,
        b: Builtin,
        arg: Value,
    ) -> DiagnosticResult<bool> {
        let irep = self.val_rep(arg);
        let orep = self.instr_rep(iid);

        match b {
            Builtin::Length => {
                if irep == Rep::Boxed {
                    let a = self.load_sxp(arg)?;
                    let n = self
                        .call_rt_val(&builtins::LENGTH, &[a.into()])?
                        .into_int_value();
                    let v = self.length_result(n, orep)?;
                    self.set_val(iid, v)?;
                } else {
                    // scalar representations are length one by construction
                    let v: BasicValueEnum = match orep {
                        Rep::Float64 => self.c_f64(1.0).into(),
                        Rep::Boxed => self.box_int(self.c_i32(1))?.into(),
                        _ => self.c_i32(1).into(),
                    };
                    self.set_val(iid, v)?;
                }
                Ok(true)
            }

            Builtin::Names => {
                let ty = self.type_of(arg);
                if irep != Rep::Boxed {
                    self.set_val(iid, self.c_addr(self.rt.nil_addr).into())?;
                    return Ok(true);
                }
                if !ty.is_a(&PirType::vecs().or_object()) {
                    return Ok(false);
                }
                if !ty.maybe_has_attrs() && !ty.maybe_obj() {
                    self.set_val(iid, self.c_addr(self.rt.nil_addr).into())?;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let has_attr = self.new_block("names.attr");
                let no_attr = self.new_block("names.bare");
                let done = self.new_block("names.done");
                let mut res = self.phi_join(Rep::Boxed);

                let mut might = ir(self.builder.build_int_compare(
                    IntPredicate::NE,
                    self.attr(a)?,
                    self.c_addr(self.rt.nil_addr),
                    "",
                ))?;
                if ty.maybe_obj() {
                    let o = self.is_obj(a)?;
                    might = ir(self.builder.build_or(might, o, ""))?;
                }
                self.cond_br(might, has_attr, no_attr, None)?;

                self.position_at(has_attr);
                let named = self.call_rt_val(&builtins::NAMES, &[a.into()])?;
                res.add(named, self.cur_block());
                self.br(done)?;

                self.position_at(no_attr);
                res.add(self.c_addr(self.rt.nil_addr).into(), self.cur_block());
                self.br(done)?;

                self.position_at(done);
                let v = res.build(&self.builder)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::Abs => match irep {
                Rep::Int32 => {
                    let a = self.load_val(arg, Rep::Int32)?.into_int_value();
                    let nonneg = ir(self
                        .builder
                        .build_int_compare(IntPredicate::SGE, a, self.c_i32(0), ""))?;
                    let neg = ir(self.builder.build_int_neg(a, ""))?;
                    let v = ir(self.builder.build_select(nonneg, a, neg, ""))?;
                    self.set_val(iid, v)?;
                    Ok(true)
                }
                Rep::Float64 => {
                    let a = self.load_val(arg, Rep::Float64)?.into_float_value();
                    let v = self.call_intrinsic("llvm.fabs.f64", &[a.into()])?;
                    self.set_val(iid, v)?;
                    Ok(true)
                }
                _ => Ok(false),
            },

            Builtin::Sqrt => {
                if orep == Rep::Float64 && matches!(irep, Rep::Int32 | Rep::Float64) {
                    let a = self.load_val(arg, Rep::Float64)?;
                    let v = self.call_intrinsic("llvm.sqrt.f64", &[a.into()])?;
                    self.set_val(iid, v)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }

            Builtin::Sum | Builtin::Prod => {
                if matches!(irep, Rep::Int32 | Rep::Float64) {
                    // a scalar reduces to itself
                    let ty = self.code.instr(iid).ty;
                    let a = self.load_val(arg, irep)?;
                    let v = self.convert(a, &ty, false)?;
                    self.set_val(iid, v)?;
                    return Ok(true);
                }
                if matches!(orep, Rep::Int32 | Rep::Float64)
                    && self.type_of(arg).is_a(&PirType::int_real())
                {
                    let trg = if matches!(b, Builtin::Sum) {
                        &builtins::SUM_REAL
                    } else {
                        &builtins::PROD_REAL
                    };
                    let a = self.load_sxp(arg)?;
                    let r = self.call_rt_val(trg, &[a.into()])?;
                    let ty = self.code.instr(iid).ty;
                    let v = self.convert(r, &ty, false)?;
                    self.set_val(iid, v)?;
                    return Ok(true);
                }
                Ok(false)
            }

            Builtin::AsInteger => match (irep, orep) {
                (Rep::Int32, Rep::Int32) => {
                    let a = self.load_val(arg, Rep::Int32)?;
                    self.set_val(iid, a)?;
                    Ok(true)
                }
                (Rep::Float64, Rep::Int32) => {
                    let a = self.load_val(arg, Rep::Float64)?.into_float_value();
                    let v = self.float_to_int_na(a)?;
                    self.set_val(iid, v.into())?;
                    Ok(true)
                }
                (Rep::Float64, Rep::Float64) => {
                    let a = self.load_val(arg, Rep::Float64)?.into_float_value();
                    let nan = ir(self
                        .builder
                        .build_float_compare(FloatPredicate::UNE, a, a, ""))?;
                    let floored = self
                        .call_intrinsic("llvm.floor.f64", &[a.into()])?
                        .into_float_value();
                    let v = ir(self.builder.build_select(nan, a, floored, ""))?;
                    self.set_val(iid, v)?;
                    Ok(true)
                }
                (Rep::Boxed, _) => {
                    let a = self.load_sxp(arg)?;
                    let simple = self.is_simple_scalar(a, ObjKind::Int)?;
                    let fast = self.new_block("asint.fast");
                    let slow = self.new_block("asint.slow");
                    let done = self.new_block("asint.done");
                    let mut res = self.phi_join(orep);

                    self.cond_br(simple, fast, slow, Some(BranchWeight::MostlyTrue))?;

                    self.position_at(fast);
                    let ty = self.code.instr(iid).ty;
                    let v = self.convert(a.into(), &ty, false)?;
                    res.add(v, self.cur_block());
                    self.br(done)?;

                    self.position_at(slow);
                    let base = self.c_addr(self.rt.base_env_addr);
                    let r = self.call_guest_builtin(iid, b, &[arg], base)?;
                    let ty = self.code.instr(iid).ty;
                    let v = self.convert(r, &ty, false)?;
                    res.add(v, self.cur_block());
                    self.br(done)?;

                    self.position_at(done);
                    let v = res.build(&self.builder)?;
                    self.set_val(iid, v)?;
                    Ok(true)
                }
                _ => Ok(false),
            },

            Builtin::IsLogical => {
                if self.type_of(arg).is_a(&PirType::logical()) {
                    // covers logicals currently carried as native ints
                    self.const_bool(iid, true)?;
                } else {
                    self.kind_test(iid, arg, ObjKind::Logical)?;
                }
                Ok(true)
            }
            Builtin::IsComplex => {
                self.kind_test(iid, arg, ObjKind::Complex)?;
                Ok(true)
            }
            Builtin::IsCharacter => {
                self.kind_test(iid, arg, ObjKind::Str)?;
                Ok(true)
            }
            Builtin::IsSymbol => {
                self.kind_test(iid, arg, ObjKind::Sym)?;
                Ok(true)
            }
            Builtin::IsExpression => {
                self.kind_test(iid, arg, ObjKind::Expr)?;
                Ok(true)
            }
            Builtin::IsCall => {
                self.kind_test(iid, arg, ObjKind::Call)?;
                Ok(true)
            }

            Builtin::IsFunction => {
                let rep = self.instr_rep(iid);
                if irep != Rep::Boxed {
                    self.const_bool(iid, false)?;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let k = self.kind_of(a)?;
                let mut hit = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    k,
                    self.c_i32(ObjKind::Closure as i64),
                    "",
                ))?;
                for kind in [ObjKind::BuiltinFun, ObjKind::Special] {
                    let h = ir(self.builder.build_int_compare(
                        IntPredicate::EQ,
                        k,
                        self.c_i32(kind as i64),
                        "",
                    ))?;
                    hit = ir(self.builder.build_or(hit, h, ""))?;
                }
                let v = self.bool_result(hit, rep)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::IsNa => {
                let rep = self.instr_rep(iid);
                match irep {
                    Rep::Int32 => {
                        let a = self.load_val(arg, Rep::Int32)?.into_int_value();
                        let hit = ir(self.builder.build_int_compare(
                            IntPredicate::EQ,
                            a,
                            self.c_i32(NA_INT as i64),
                            "",
                        ))?;
                        let v = self.bool_result(hit, rep)?;
                        self.set_val(iid, v)?;
                        Ok(true)
                    }
                    Rep::Float64 => {
                        let a = self.load_val(arg, Rep::Float64)?.into_float_value();
                        let hit = ir(self
                            .builder
                            .build_float_compare(FloatPredicate::UNE, a, a, ""))?;
                        let v = self.bool_result(hit, rep)?;
                        self.set_val(iid, v)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }

            Builtin::IsObject => {
                let rep = self.instr_rep(iid);
                if irep != Rep::Boxed {
                    self.const_bool(iid, false)?;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let o = self.is_obj(a)?;
                let v = self.bool_result(o, rep)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::IsArray => {
                let rep = self.instr_rep(iid);
                if irep != Rep::Boxed {
                    self.const_bool(iid, false)?;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let dim = self.c_addr(self.rt.dim_sym_addr);
                let attr = self
                    .call_rt_val(&builtins::GET_ATTRIB, &[a.into(), dim.into()])?
                    .into_pointer_value();
                let k = self.kind_of(attr)?;
                let int_dims = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    k,
                    self.c_i32(ObjKind::Int as i64),
                    "",
                ))?;
                let len = self.vector_length(attr)?;
                let has_dims = ir(self.builder.build_int_compare(
                    IntPredicate::UGT,
                    len,
                    self.c_u64(0),
                    "",
                ))?;
                let hit = ir(self.builder.build_and(int_dims, has_dims, ""))?;
                let v = self.bool_result(hit, rep)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::IsAtomic => {
                let rep = self.instr_rep(iid);
                if irep != Rep::Boxed {
                    self.const_bool(iid, true)?;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let k = self.kind_of(a)?;
                let mut hit = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    k,
                    self.c_i32(ObjKind::Nil as i64),
                    "",
                ))?;
                for kind in [
                    ObjKind::Char,
                    ObjKind::Logical,
                    ObjKind::Int,
                    ObjKind::Real,
                    ObjKind::Complex,
                    ObjKind::Str,
                    ObjKind::Raw,
                ] {
                    let h = ir(self.builder.build_int_compare(
                        IntPredicate::EQ,
                        k,
                        self.c_i32(kind as i64),
                        "",
                    ))?;
                    hit = ir(self.builder.build_or(hit, h, ""))?;
                }
                let v = self.bool_result(hit, rep)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::BodyCode => {
                if irep != Rep::Boxed {
                    return Ok(false);
                }
                let a = self.load_sxp(arg)?;
                let v: BasicValueEnum = if self.type_of(arg).is_a(&PirType::closure()) {
                    self.cdr(a)?.into()
                } else {
                    let k = self.kind_of(a)?;
                    let is_clo = ir(self.builder.build_int_compare(
                        IntPredicate::EQ,
                        k,
                        self.c_i32(ObjKind::Closure as i64),
                        "",
                    ))?;
                    let body = self.cdr(a)?;
                    ir(self
                        .builder
                        .build_select(is_clo, body, self.c_addr(self.rt.nil_addr), ""))?
                };
                self.set_val(iid, v)?;
                Ok(true)
            }

            Builtin::Environment => {
                if !self.type_of(arg).is_a(&PirType::closure()) {
                    self.success = false;
                    return Ok(true);
                }
                let a = self.load_sxp(arg)?;
                let env = self.tag(a)?;
                self.set_val(iid, env.into())?;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    fn try_inline_binary(
        &mut self,
        iid: InstrId,
        b: Builtin,
        args: &[Value],
    ) -> DiagnosticResult<bool> {
        let arep = self.val_rep(args[0]);
        let brep = self.val_rep(args[1]);
        let orep = self.instr_rep(iid);

        match b {
            Builtin::Vector => {
                // vector(type, n) with a literal type string
                let Some(kind) = self.const_string_arg(args[0]).and_then(str_to_kind) else {
                    return Ok(false);
                };
                if !self
                    .type_of(args[1])
                    .is_a(&PirType::simple_scalar_int())
                {
                    return Ok(false);
                }
                let n = self.load_val(args[1], Rep::Int32)?.into_int_value();
                let wide = ir(self.builder.build_int_z_extend(n, self.t_i64, ""))?;
                let res = self.call_rt_val(
                    &builtins::MAKE_VECTOR,
                    &[self.c_i32(kind as i64).into(), wide.into()],
                )?;
                self.set_val(iid, res)?;
                Ok(true)
            }

            Builtin::Min | Builtin::Max => {
                let is_min = matches!(b, Builtin::Min);
                if arep == Rep::Int32 && brep == Rep::Int32 && orep != Rep::Float64 {
                    let a = self.load_val(args[0], Rep::Int32)?.into_int_value();
                    let bv = self.load_val(args[1], Rep::Int32)?.into_int_value();
                    let cmp = if is_min {
                        ir(self.builder.build_int_compare(IntPredicate::SLT, bv, a, ""))?
                    } else {
                        ir(self.builder.build_int_compare(IntPredicate::SLT, a, bv, ""))?
                    };
                    let picked = ir(self.builder.build_select(cmp, bv, a, ""))?;
                    if orep == Rep::Int32 {
                        self.set_val(iid, picked)?;
                    } else {
                        let boxed = self.box_int(picked.into_int_value())?;
                        self.set_val(iid, boxed.into())?;
                    }
                    return Ok(true);
                }
                if arep == Rep::Float64 && brep == Rep::Float64 && orep != Rep::Int32 {
                    let a = self.load_val(args[0], Rep::Float64)?.into_float_value();
                    let bv = self.load_val(args[1], Rep::Float64)?.into_float_value();
                    let cmp = if is_min {
                        ir(self
                            .builder
                            .build_float_compare(FloatPredicate::UGT, bv, a, ""))?
                    } else {
                        ir(self
                            .builder
                            .build_float_compare(FloatPredicate::UGT, a, bv, ""))?
                    };
                    let picked = ir(self.builder.build_select(cmp, a, bv, ""))?;
                    if orep == Rep::Float64 {
                        self.set_val(iid, picked)?;
                    } else {
                        let boxed = self.box_real(picked.into_float_value())?;
                        self.set_val(iid, boxed.into())?;
                    }
                    return Ok(true);
                }
                Ok(false)
            }

            Builtin::IsVector => {
                // only the is.vector(x, "any") form folds
                let Some(mode) = self.const_string_arg(args[1]) else {
                    return Ok(false);
                };
                if mode != "any" {
                    return Ok(false);
                }
                let rep = self.instr_rep(iid);
                if arep != Rep::Boxed {
                    self.const_bool(iid, true)?;
                    return Ok(true);
                }
                let a = self.load_sxp(args[0])?;
                let k = self.kind_of(a)?;
                let mut hit = ir(self.builder.build_int_compare(
                    IntPredicate::EQ,
                    k,
                    self.c_i32(ObjKind::Logical as i64),
                    "",
                ))?;
                for kind in [
                    ObjKind::Int,
                    ObjKind::Real,
                    ObjKind::Complex,
                    ObjKind::Str,
                    ObjKind::Raw,
                    ObjKind::List,
                    ObjKind::Expr,
                ] {
                    let h = ir(self.builder.build_int_compare(
                        IntPredicate::EQ,
                        k,
                        self.c_i32(kind as i64),
                        "",
                    ))?;
                    hit = ir(self.builder.build_or(hit, h, ""))?;
                }
                let v = self.bool_result(hit, rep)?;
                self.set_val(iid, v)?;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    fn try_inline_variadic(
        &mut self,
        iid: InstrId,
        b: Builtin,
        args: &[Value],
    ) -> DiagnosticResult<bool> {
        match b {
            Builtin::Concat => {
                let all_int = args.iter().all(|v| self.val_rep(*v) == Rep::Int32);
                let all_real = args.iter().all(|v| self.val_rep(*v) == Rep::Float64);
                if !all_int && !all_real {
                    return Ok(false);
                }
                let kind = if all_int { ObjKind::Int } else { ObjKind::Real };
                let elem_ty = if all_int {
                    PirType::int().not_object()
                } else {
                    PirType::real().not_object()
                };
                let res = self
                    .call_rt_val(
                        &builtins::MAKE_VECTOR,
                        &[
                            self.c_i32(kind as i64).into(),
                            self.c_i64(args.len() as i64).into(),
                        ],
                    )?
                    .into_pointer_value();
                for (pos, v) in args.iter().enumerate() {
                    let val = self.load_val(*v, self.val_rep(*v))?;
                    self.assign_vector(res, self.c_u64(pos as u64), val, &elem_ty)?;
                }
                self.set_val(iid, res.into())?;
                Ok(true)
            }

            Builtin::MakeList => {
                let res = self
                    .call_rt_val(
                        &builtins::MAKE_VECTOR,
                        &[
                            self.c_i32(ObjKind::List as i64).into(),
                            self.c_i64(args.len() as i64).into(),
                        ],
                    )?
                    .into_pointer_value();
                self.protect_temp(res)?;
                let elem_ty = PirType::list().not_object();
                for (pos, v) in args.iter().enumerate() {
                    let val = self.load_sxp(*v)?;
                    self.assign_vector(res, self.c_u64(pos as u64), val.into(), &elem_ty)?;
                }
                self.set_val(iid, res.into())?;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// The string payload of a constant-pool operand, if that's what it is.
    fn const_string_arg(&self, v: Value) -> Option<String> {
        let Value::Instr(i) = v else { return None };
        let Op::LdConst(idx) = self.code.instr(i).op else {
            return None;
        };
        match self.code.pool_get(idx) {
            Const::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

fn str_to_kind(s: String) -> Option<ObjKind> {
    Some(match s.as_str() {
        "logical" => ObjKind::Logical,
        "integer" => ObjKind::Int,
        "numeric" | "double" => ObjKind::Real,
        "complex" => ObjKind::Complex,
        "character" => ObjKind::Str,
        "expression" => ObjKind::Expr,
        "list" => ObjKind::List,
        "raw" => ObjKind::Raw,
        _ => return None,
    })
}
