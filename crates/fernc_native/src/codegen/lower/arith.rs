//! Arithmetic, relational, logical and unary lowering.
//!
//! Every operator splits the same way: if any side (or the result) is
//! boxed, the whole operation goes to the runtime `binop`/`unop` entry
//! with the operator kind; otherwise native code is emitted with NA
//! checks on Int32 operands that may hold NA. Float64 NA is NaN and
//! propagates through the FP unit for free.

use inkwell::values::{BasicValueEnum, FloatValue, IntValue};
use inkwell::{FloatPredicate, IntPredicate};

use fern_pir::{InstrId, Op, Value};

use crate::codegen::{ir, BranchWeight, LowerFunction, PhiJoin};
use crate::constants::{MOD_ACCURACY_LIMIT, NA_INT};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::Rep;
use crate::runtime::builtins;

/// Operator codes shared with the runtime's generic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub(crate) enum BinopKind {
    Add = 0,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    LAnd,
    LOr,
    Colon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub(crate) enum UnopKind {
    Minus = 0,
    Plus,
}

#[derive(Debug, Clone, Copy)]
enum IntArith {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy)]
enum FpArith {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
}

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    pub(crate) fn lower_arith(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        match op {
            Op::Add => self.compile_binop(iid, args, BinopKind::Add, IntArith::Add, FpArith::Add),
            Op::Sub => self.compile_binop(iid, args, BinopKind::Sub, IntArith::Sub, FpArith::Sub),
            Op::Mul => self.compile_binop(iid, args, BinopKind::Mul, IntArith::Mul, FpArith::Mul),
            Op::Div => self.compile_binop(iid, args, BinopKind::Div, IntArith::Div, FpArith::Div),
            Op::IDiv => {
                self.compile_binop(iid, args, BinopKind::IDiv, IntArith::IDiv, FpArith::IDiv)
            }
            Op::Mod => self.compile_binop(iid, args, BinopKind::Mod, IntArith::Mod, FpArith::Mod),
            Op::Pow => self.compile_binop(iid, args, BinopKind::Pow, IntArith::Pow, FpArith::Pow),
            Op::Eq => self.compile_relop(
                iid,
                args,
                BinopKind::Eq,
                IntPredicate::EQ,
                FloatPredicate::UEQ,
            ),
            Op::Neq => self.compile_relop(
                iid,
                args,
                BinopKind::Ne,
                IntPredicate::NE,
                FloatPredicate::UNE,
            ),
            Op::Lt => self.compile_relop(
                iid,
                args,
                BinopKind::Lt,
                IntPredicate::SLT,
                FloatPredicate::ULT,
            ),
            Op::Lte => self.compile_relop(
                iid,
                args,
                BinopKind::Lte,
                IntPredicate::SLE,
                FloatPredicate::ULE,
            ),
            Op::Gt => self.compile_relop(
                iid,
                args,
                BinopKind::Gt,
                IntPredicate::SGT,
                FloatPredicate::UGT,
            ),
            Op::Gte => self.compile_relop(
                iid,
                args,
                BinopKind::Gte,
                IntPredicate::SGE,
                FloatPredicate::UGE,
            ),
            Op::LAnd => self.compile_logical(iid, args, BinopKind::LAnd),
            Op::LOr => self.compile_logical(iid, args, BinopKind::LOr),
            Op::Not => self.compile_not(iid, args),
            Op::Minus => self.compile_unop(iid, args, UnopKind::Minus),
            Op::Plus => self.compile_unop(iid, args, UnopKind::Plus),
            _ => Err(Diagnostic::at_instr("not an arithmetic op", iid)),
        }
    }

    fn slow_binop(
        &mut self,
        iid: InstrId,
        args: &[Value],
        kind: BinopKind,
    ) -> DiagnosticResult<()> {
        let a = self.load_sxp(args[0])?;
        let b = self.load_sxp(args[1])?;
        let src = self.code.instr(iid).src_idx;
        let res = if self.code.instr(iid).has_env() {
            let e = self.lower_env_operand(iid)?;
            self.call_rt_val(
                &builtins::BINOP_ENV,
                &[
                    a.into(),
                    b.into(),
                    e.into(),
                    self.c_i32(src as i64).into(),
                    self.c_i32(kind as i64).into(),
                ],
            )?
        } else {
            self.call_rt_val(
                &builtins::BINOP,
                &[a.into(), b.into(), self.c_i32(kind as i64).into()],
            )?
        };
        self.set_val(iid, res)
    }

    fn compile_binop(
        &mut self,
        iid: InstrId,
        args: &[Value],
        kind: BinopKind,
        int_arith: IntArith,
        fp_arith: FpArith,
    ) -> DiagnosticResult<()> {
        let (lhs, rhs) = (args[0], args[1]);
        let rep = self.instr_rep(iid);
        let lhs_rep = self.val_rep(lhs);
        let rhs_rep = self.val_rep(rhs);

        if lhs_rep == Rep::Boxed || rhs_rep == Rep::Boxed {
            return self.slow_binop(iid, args, kind);
        }

        let r = if lhs_rep == Rep::Float64 || rhs_rep == Rep::Float64 {
            Rep::Float64
        } else {
            Rep::Int32
        };
        let done = self.new_block("binop.done");
        let mut res = self.phi_join(r);
        let mut is_na_br = None;

        let a = self.load_val(lhs, lhs_rep)?;
        let b = self.load_val(rhs, rhs_rep)?;

        for (v, pir) in [(a, lhs), (b, rhs)] {
            if self.type_of(pir).maybe_na() && self.val_rep(pir) == Rep::Int32 {
                let br = *is_na_br.get_or_insert_with(|| self.new_block("binop.na"));
                self.nacheck(v, br, None)?;
            }
        }

        if a.is_int_value() && b.is_int_value() && r == Rep::Int32 {
            let v = self.emit_int_arith(int_arith, a.into_int_value(), b.into_int_value())?;
            res.add(v.into(), self.cur_block());
        } else {
            let fa = self.widen(a)?;
            let fb = self.widen(b)?;
            let v = self.emit_fp_arith(fp_arith, fa, fb)?;
            res.add(v.into(), self.cur_block());
        }
        self.br(done)?;

        if let Some(na) = is_na_br {
            self.position_at(na);
            let na_val: BasicValueEnum = if r == Rep::Int32 {
                self.c_i32(NA_INT as i64).into()
            } else {
                self.c_f64(f64::NAN).into()
            };
            res.add(na_val, self.cur_block());
            self.br(done)?;
        }

        self.position_at(done);
        let v = res.build(&self.builder)?;
        if rep == Rep::Boxed {
            let merged = self
                .type_of(lhs)
                .merge_with_conversion(&self.type_of(rhs));
            let boxed = self.box_value(v, &merged, false)?;
            self.set_val(iid, boxed.into())
        } else {
            self.set_val(iid, v)
        }
    }

    fn widen(&self, v: BasicValueEnum<'ctx>) -> DiagnosticResult<FloatValue<'ctx>> {
        if v.is_float_value() {
            return Ok(v.into_float_value());
        }
        // NA was already peeled off on this path
        ir(self
            .builder
            .build_signed_int_to_float(v.into_int_value(), self.t_f64, ""))
    }

    fn emit_int_arith(
        &mut self,
        k: IntArith,
        a: IntValue<'ctx>,
        b: IntValue<'ctx>,
    ) -> DiagnosticResult<IntValue<'ctx>> {
        match k {
            IntArith::Add => ir(self.builder.build_int_nsw_add(a, b, "")),
            IntArith::Sub => ir(self.builder.build_int_nsw_sub(a, b, "")),
            IntArith::Mul => ir(self.builder.build_int_nsw_mul(a, b, "")),
            IntArith::Div => ir(self.builder.build_int_signed_div(a, b, "")),
            IntArith::Pow => {
                let fa = ir(self.builder.build_signed_int_to_float(a, self.t_f64, ""))?;
                let p = self
                    .call_intrinsic("llvm.powi.f64.i32", &[fa.into(), b.into()])?
                    .into_float_value();
                ir(self.builder.build_float_to_signed_int(p, self.t_i32, ""))
            }
            IntArith::IDiv => {
                // integer division by zero yields NA
                let is_zero = self.new_block("idiv.zero");
                let not_zero = self.new_block("idiv.div");
                let cont = self.new_block("idiv.cont");
                let mut res = PhiJoin::new(self.t_i32.into());
                let z = ir(self
                    .builder
                    .build_int_compare(IntPredicate::EQ, b, self.c_i32(0), ""))?;
                self.cond_br(z, is_zero, not_zero, Some(BranchWeight::MostlyFalse))?;

                self.position_at(is_zero);
                res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
                self.br(cont)?;

                self.position_at(not_zero);
                let fa = ir(self.builder.build_signed_int_to_float(a, self.t_f64, ""))?;
                let fb = ir(self.builder.build_signed_int_to_float(b, self.t_f64, ""))?;
                let q = ir(self.builder.build_float_div(fa, fb, ""))?;
                let fq = self
                    .call_intrinsic("llvm.floor.f64", &[q.into()])?
                    .into_float_value();
                let v = ir(self.builder.build_float_to_signed_int(fq, self.t_i32, ""))?;
                res.add(v.into(), self.cur_block());
                self.br(cont)?;

                self.position_at(cont);
                Ok(res.build(&self.builder)?.into_int_value())
            }
            IntArith::Mod => {
                // non-negative operands use native remainder, the rest
                // fall to the FP algorithm
                let fast1 = self.new_block("mod.fast1");
                let fast = self.new_block("mod.fast");
                let slow = self.new_block("mod.slow");
                let cont = self.new_block("mod.cont");
                let mut res = PhiJoin::new(self.t_i32.into());

                let a_ok = ir(self
                    .builder
                    .build_int_compare(IntPredicate::SGE, a, self.c_i32(0), ""))?;
                self.cond_br(a_ok, fast1, slow, Some(BranchWeight::MostlyTrue))?;

                self.position_at(fast1);
                let b_ok = ir(self
                    .builder
                    .build_int_compare(IntPredicate::SGT, b, self.c_i32(0), ""))?;
                self.cond_br(b_ok, fast, slow, Some(BranchWeight::MostlyTrue))?;

                self.position_at(fast);
                let rem = ir(self.builder.build_int_signed_rem(a, b, ""))?;
                res.add(rem.into(), self.cur_block());
                self.br(cont)?;

                self.position_at(slow);
                let fa = ir(self.builder.build_signed_int_to_float(a, self.t_f64, ""))?;
                let fb = ir(self.builder.build_signed_int_to_float(b, self.t_f64, ""))?;
                let fm = self.emit_fmod(fa, fb)?;
                let v = ir(self.builder.build_float_to_signed_int(fm, self.t_i32, ""))?;
                res.add(v.into(), self.cur_block());
                self.br(cont)?;

                self.position_at(cont);
                Ok(res.build(&self.builder)?.into_int_value())
            }
        }
    }

    fn emit_fp_arith(
        &mut self,
        k: FpArith,
        a: FloatValue<'ctx>,
        b: FloatValue<'ctx>,
    ) -> DiagnosticResult<FloatValue<'ctx>> {
        match k {
            FpArith::Add => ir(self.builder.build_float_add(a, b, "")),
            FpArith::Sub => ir(self.builder.build_float_sub(a, b, "")),
            FpArith::Mul => ir(self.builder.build_float_mul(a, b, "")),
            FpArith::Div => ir(self.builder.build_float_div(a, b, "")),
            FpArith::Pow => Ok(self
                .call_intrinsic("llvm.pow.f64", &[a.into(), b.into()])?
                .into_float_value()),
            FpArith::IDiv => {
                // real divide-by-zero keeps the IEEE quotient (±inf)
                let q = ir(self.builder.build_float_div(a, b, ""))?;
                let is_zero = self.new_block("fidiv.zero");
                let not_zero = self.new_block("fidiv.floor");
                let cont = self.new_block("fidiv.cont");
                let mut res = PhiJoin::new(self.t_f64.into());
                let z = ir(self.builder.build_float_compare(
                    FloatPredicate::UEQ,
                    b,
                    self.c_f64(0.0),
                    "",
                ))?;
                self.cond_br(z, is_zero, not_zero, Some(BranchWeight::MostlyFalse))?;

                self.position_at(is_zero);
                res.add(q.into(), self.cur_block());
                self.br(cont)?;

                self.position_at(not_zero);
                let fq = self
                    .call_intrinsic("llvm.floor.f64", &[q.into()])?
                    .into_float_value();
                let fqb = ir(self.builder.build_float_mul(fq, b, ""))?;
                let tmp = ir(self.builder.build_float_sub(a, fqb, ""))?;
                let tq = ir(self.builder.build_float_div(tmp, b, ""))?;
                let frem = self
                    .call_intrinsic("llvm.floor.f64", &[tq.into()])?
                    .into_float_value();
                let v = ir(self.builder.build_float_add(fq, frem, ""))?;
                res.add(v.into(), self.cur_block());
                self.br(cont)?;

                self.position_at(cont);
                Ok(res.build(&self.builder)?.into_float_value())
            }
            FpArith::Mod => self.emit_fmod(a, b),
        }
    }

    /// `fmod(a, b) = (a - floor(a/b)*b) - floor((a - floor(a/b)*b)/b)*b`,
    /// with the guest's accuracy-loss warning when `|a/b|` grows past
    /// `1/eps`.
    fn emit_fmod(
        &mut self,
        a: FloatValue<'ctx>,
        b: FloatValue<'ctx>,
    ) -> DiagnosticResult<FloatValue<'ctx>> {
        let is_zero = self.new_block("fmod.zero");
        let not_zero = self.new_block("fmod.go");
        let cont = self.new_block("fmod.cont");
        let mut res = PhiJoin::new(self.t_f64.into());

        let z = ir(self.builder.build_float_compare(
            FloatPredicate::UEQ,
            b,
            self.c_f64(0.0),
            "",
        ))?;
        self.cond_br(z, is_zero, not_zero, Some(BranchWeight::MostlyFalse))?;

        self.position_at(is_zero);
        res.add(self.c_f64(f64::NAN).into(), self.cur_block());
        self.br(cont)?;

        self.position_at(not_zero);
        let q = ir(self.builder.build_float_div(a, b, ""))?;
        let fq = self
            .call_intrinsic("llvm.floor.f64", &[q.into()])?
            .into_float_value();
        let absq = self
            .call_intrinsic("llvm.fabs.f64", &[q.into()])?
            .into_float_value();
        let finite = ir(self.builder.build_float_compare(
            FloatPredicate::UNE,
            absq,
            self.c_f64(f64::INFINITY),
            "",
        ))?;
        let too_big = ir(self.builder.build_float_compare(
            FloatPredicate::UGT,
            absq,
            self.c_f64(MOD_ACCURACY_LIMIT),
            "",
        ))?;
        let warn = self.new_block("fmod.warn");
        let no_warn = self.new_block("fmod.nowarn");
        let should_warn = ir(self.builder.build_and(finite, too_big, ""))?;
        self.cond_br(should_warn, warn, no_warn, Some(BranchWeight::MostlyFalse))?;

        self.position_at(warn);
        let msg = self.global_string("probable complete loss of accuracy in modulus")?;
        self.call_rt(&builtins::WARN, &[msg.into()])?;
        self.br(no_warn)?;

        self.position_at(no_warn);
        let fqb = ir(self.builder.build_float_mul(fq, b, ""))?;
        let tmp = ir(self.builder.build_float_sub(a, fqb, ""))?;
        let tq = ir(self.builder.build_float_div(tmp, b, ""))?;
        let frem = self
            .call_intrinsic("llvm.floor.f64", &[tq.into()])?
            .into_float_value();
        let fremb = ir(self.builder.build_float_mul(frem, b, ""))?;
        let v = ir(self.builder.build_float_sub(tmp, fremb, ""))?;
        res.add(v.into(), self.cur_block());
        self.br(cont)?;

        self.position_at(cont);
        Ok(res.build(&self.builder)?.into_float_value())
    }

    fn compile_relop(
        &mut self,
        iid: InstrId,
        args: &[Value],
        kind: BinopKind,
        int_pred: IntPredicate,
        fp_pred: FloatPredicate,
    ) -> DiagnosticResult<()> {
        let (lhs, rhs) = (args[0], args[1]);
        let rep = self.instr_rep(iid);
        let lhs_rep = self.val_rep(lhs);
        let rhs_rep = self.val_rep(rhs);

        if lhs_rep == Rep::Boxed || rhs_rep == Rep::Boxed {
            return self.slow_binop(iid, args, kind);
        }

        let is_na_br = self.new_block("relop.na");
        let done = self.new_block("relop.done");
        let mut res = self.phi_join(Rep::Int32);

        let a = self.load_val(lhs, lhs_rep)?;
        let b = self.load_val(rhs, rhs_rep)?;
        self.nacheck(a, is_na_br, None)?;
        self.nacheck(b, is_na_br, None)?;

        let bit = if a.is_int_value() && b.is_int_value() {
            ir(self.builder.build_int_compare(
                int_pred,
                a.into_int_value(),
                b.into_int_value(),
                "",
            ))?
        } else {
            let fa = self.widen(a)?;
            let fb = self.widen(b)?;
            ir(self.builder.build_float_compare(fp_pred, fa, fb, ""))?
        };
        let wide = ir(self.builder.build_int_z_extend(bit, self.t_i32, ""))?;
        res.add(wide.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_na_br);
        res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        let v = res.build(&self.builder)?;
        if rep == Rep::Boxed {
            let boxed = self.box_lgl(v.into_int_value())?;
            self.set_val(iid, boxed.into())
        } else {
            self.set_val(iid, v)
        }
    }

    fn compile_logical(
        &mut self,
        iid: InstrId,
        args: &[Value],
        kind: BinopKind,
    ) -> DiagnosticResult<()> {
        let (lhs, rhs) = (args[0], args[1]);
        let rep = self.instr_rep(iid);
        let lhs_rep = self.val_rep(lhs);
        let rhs_rep = self.val_rep(rhs);

        if lhs_rep == Rep::Boxed || rhs_rep == Rep::Boxed {
            return self.slow_binop(iid, args, kind);
        }

        let is_na_br = self.new_block("logical.na");
        let done = self.new_block("logical.done");
        let mut res = self.phi_join(Rep::Int32);

        let a = self.load_val(lhs, lhs_rep)?;
        let b = self.load_val(rhs, rhs_rep)?;
        self.nacheck(a, is_na_br, None)?;
        self.nacheck(b, is_na_br, None)?;

        let ta = self.truthy(a)?;
        let tb = self.truthy(b)?;
        let combined = match kind {
            BinopKind::LAnd => ir(self.builder.build_and(ta, tb, ""))?,
            _ => ir(self.builder.build_or(ta, tb, ""))?,
        };
        res.add(combined.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_na_br);
        res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        let v = res.build(&self.builder)?;
        if rep == Rep::Boxed {
            let boxed = self.box_lgl(v.into_int_value())?;
            self.set_val(iid, boxed.into())
        } else {
            self.set_val(iid, v)
        }
    }

    /// Normalize a native numeric to an Int32 0/1.
    fn truthy(&self, v: BasicValueEnum<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let bit = if v.is_float_value() {
            ir(self.builder.build_float_compare(
                FloatPredicate::UNE,
                v.into_float_value(),
                self.c_f64(0.0),
                "",
            ))?
        } else {
            ir(self.builder.build_int_compare(
                IntPredicate::NE,
                v.into_int_value(),
                self.c_i32(0),
                "",
            ))?
        };
        ir(self.builder.build_int_z_extend(bit, self.t_i32, ""))
    }

    fn compile_not(&mut self, iid: InstrId, args: &[Value]) -> DiagnosticResult<()> {
        let arg = args[0];
        let rep = self.instr_rep(iid);
        let arg_rep = self.val_rep(arg);

        if arg_rep == Rep::Boxed {
            let a = self.load_sxp(arg)?;
            let src = self.code.instr(iid).src_idx;
            let res = if self.code.instr(iid).has_env() {
                let e = self.lower_env_operand(iid)?;
                self.call_rt_val(
                    &builtins::NOT_ENV,
                    &[a.into(), e.into(), self.c_i32(src as i64).into()],
                )?
            } else {
                self.call_rt_val(&builtins::NOT_OP, &[a.into()])?
            };
            return self.set_val(iid, res);
        }

        let done = self.new_block("not.done");
        let is_na = self.new_block("not.na");
        let mut res = self.phi_join(Rep::Int32);

        let a = self.load_val(arg, arg_rep)?;
        self.nacheck(a, is_na, None)?;

        let zero_bit = if a.is_float_value() {
            ir(self.builder.build_float_compare(
                FloatPredicate::UEQ,
                a.into_float_value(),
                self.c_f64(0.0),
                "",
            ))?
        } else {
            ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                a.into_int_value(),
                self.c_i32(0),
                "",
            ))?
        };
        let flipped = ir(self.builder.build_int_z_extend(zero_bit, self.t_i32, ""))?;
        res.add(flipped.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_na);
        res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        let v = res.build(&self.builder)?;
        if rep == Rep::Boxed {
            let boxed = self.box_lgl(v.into_int_value())?;
            self.set_val(iid, boxed.into())
        } else {
            self.set_val(iid, v)
        }
    }

    fn compile_unop(
        &mut self,
        iid: InstrId,
        args: &[Value],
        kind: UnopKind,
    ) -> DiagnosticResult<()> {
        let arg = args[0];
        let arg_rep = self.val_rep(arg);

        if arg_rep == Rep::Boxed {
            let a = self.load_sxp(arg)?;
            let src = self.code.instr(iid).src_idx;
            let res = if self.code.instr(iid).has_env() {
                let e = self.lower_env_operand(iid)?;
                self.call_rt_val(
                    &builtins::UNOP_ENV,
                    &[
                        a.into(),
                        e.into(),
                        self.c_i32(src as i64).into(),
                        self.c_i32(kind as i64).into(),
                    ],
                )?
            } else {
                self.call_rt_val(
                    &builtins::UNOP,
                    &[a.into(), self.c_i32(kind as i64).into()],
                )?
            };
            return self.set_val(iid, res);
        }

        let r = arg_rep;
        let done = self.new_block("unop.done");
        let mut is_na_br = None;
        let mut res = self.phi_join(r);

        let a = self.load_val(arg, arg_rep)?;
        if arg_rep == Rep::Int32 {
            let br = *is_na_br.get_or_insert_with(|| self.new_block("unop.na"));
            self.nacheck(a, br, None)?;
        }

        let v: BasicValueEnum = match (kind, a.is_float_value()) {
            (UnopKind::Plus, _) => a,
            (UnopKind::Minus, true) => {
                ir(self.builder.build_float_neg(a.into_float_value(), ""))?.into()
            }
            (UnopKind::Minus, false) => {
                ir(self.builder.build_int_neg(a.into_int_value(), ""))?.into()
            }
        };
        res.add(v, self.cur_block());
        self.br(done)?;

        if let Some(na) = is_na_br {
            self.position_at(na);
            res.add(self.c_i32(NA_INT as i64).into(), self.cur_block());
            self.br(done)?;
        }

        self.position_at(done);
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)
    }
}
