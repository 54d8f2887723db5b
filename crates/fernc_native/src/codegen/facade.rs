//! Typed emission helpers over the raw builder.
//!
//! Everything the per-opcode lowering shares lives here: heap-header
//! accessors, named-count maintenance, the generational write barrier,
//! box/unbox, operand loading with representation conversion, the node
//! stack, promise forcing, stub-environment access, and the fast-path
//! index computation.

use inkwell::basic_block::BasicBlock;
use inkwell::values::{BasicValueEnum, FloatValue, IntValue, PointerValue};
use inkwell::{FloatPredicate, IntPredicate};

use fern_pir::analysis::AdjustKind;
use fern_pir::{BaseKind, Const, InstrId, Op, PirType, PoolIdx, SymId, Value};

use crate::codegen::types_llvm::{stack_cell_field, value_field, vector_field};
use crate::codegen::{ir, BranchWeight, LowerFunction};
use crate::constants::*;
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::{rep_of_type, Rep};
use crate::runtime::builtins;

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    // -- PIR-side queries --------------------------------------------------

    pub fn type_of(&self, v: Value) -> PirType {
        match v {
            Value::Instr(i) => self.code.instr(i).ty,
            Value::True | Value::False => PirType::simple_scalar_lgl().not_na(),
            Value::NaLogical => PirType::simple_scalar_lgl(),
            Value::Nil => PirType::new(BaseKind::Nil).scalar(),
            Value::MissingArg => PirType::new(BaseKind::MissingArg).scalar(),
            Value::UnboundValue => PirType::new(BaseKind::Unbound).scalar(),
            Value::ElidedEnv | Value::GlobalEnv | Value::BaseEnv => PirType::env(),
        }
    }

    pub fn val_rep(&self, v: Value) -> Rep {
        rep_of_type(&self.type_of(v))
    }

    pub fn instr_rep(&self, i: InstrId) -> Rep {
        rep_of_type(&self.code.instr(i).ty)
    }

    pub fn symbol_const(&self, sym: SymId) -> DiagnosticResult<PointerValue<'ctx>> {
        let addr = self
            .rt
            .symbol_addr(sym)
            .ok_or_else(|| Diagnostic::new(format!("unknown symbol id {}", sym.0)))?;
        Ok(self.c_addr(addr))
    }

    // -- header word -------------------------------------------------------

    pub fn objinfo_ptr(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        ir(self
            .builder
            .build_struct_gep(self.guest.value, v, value_field::OBJINFO, "objinfo"))
    }

    pub fn load_objinfo(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let p = self.objinfo_ptr(v)?;
        Ok(ir(self.builder.build_load(self.t_i64, p, "info"))?.into_int_value())
    }

    pub fn kind_of(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let info = self.load_objinfo(v)?;
        let masked = ir(self.builder.build_and(info, self.c_u64(KIND_MASK), ""))?;
        ir(self.builder.build_int_truncate(masked, self.t_i32, "kind"))
    }

    pub fn set_kind(&self, v: PointerValue<'ctx>, kind: ObjKind) -> DiagnosticResult<()> {
        let p = self.objinfo_ptr(v)?;
        let info = ir(self.builder.build_load(self.t_i64, p, ""))?.into_int_value();
        let cleared = ir(self.builder.build_and(info, self.c_u64(!KIND_MASK), ""))?;
        let updated = ir(self.builder.build_or(cleared, self.c_u64(kind as u64), ""))?;
        ir(self.builder.build_store(p, updated))?;
        Ok(())
    }

    fn objinfo_bit(&self, v: PointerValue<'ctx>, bit: u64) -> DiagnosticResult<IntValue<'ctx>> {
        let info = self.load_objinfo(v)?;
        let masked = ir(self.builder.build_and(info, self.c_u64(bit), ""))?;
        ir(self
            .builder
            .build_int_compare(IntPredicate::NE, masked, self.c_u64(0), ""))
    }

    pub fn is_obj(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        self.objinfo_bit(v, OBJECT_BIT)
    }

    pub fn is_altrep(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        self.objinfo_bit(v, ALTREP_BIT)
    }

    pub fn attr(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = ir(self
            .builder
            .build_struct_gep(self.guest.value, v, value_field::ATTRIB, "attr"))?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, ""))?.into_pointer_value())
    }

    pub fn vector_length(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let p = ir(self.builder.build_struct_gep(
            self.guest.vector,
            v,
            vector_field::LENGTH,
            "len",
        ))?;
        Ok(ir(self.builder.build_load(self.t_i64, p, ""))?.into_int_value())
    }

    pub fn is_scalar_cell(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let l = self.vector_length(v)?;
        ir(self
            .builder
            .build_int_compare(IntPredicate::EQ, l, self.c_u64(1), ""))
    }

    /// kind matches, the scalar bit is set, and there are no attributes.
    pub fn is_simple_scalar(
        &self,
        v: PointerValue<'ctx>,
        kind: ObjKind,
    ) -> DiagnosticResult<IntValue<'ctx>> {
        let info = self.load_objinfo(v)?;
        let k = ir(self.builder.build_and(info, self.c_u64(KIND_MASK), ""))?;
        let ok_kind = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            k,
            self.c_u64(kind as u64),
            "",
        ))?;
        let sc = ir(self.builder.build_and(info, self.c_u64(SCALAR_BIT), ""))?;
        let is_scalar =
            ir(self
                .builder
                .build_int_compare(IntPredicate::NE, sc, self.c_u64(0), ""))?;
        let no_attr = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            self.attr(v)?,
            self.c_addr(self.rt.nil_addr),
            "",
        ))?;
        let both = ir(self.builder.build_and(ok_kind, is_scalar, ""))?;
        ir(self.builder.build_and(both, no_attr, ""))
    }

    /// Attributes allow the fast vector-element path: none at all, or
    /// only `dim`.
    pub fn fast_vecelt_ok(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let attrs = self.attr(v)?;
        let nil = self.c_addr(self.rt.nil_addr);
        let is_nil = ir(self
            .builder
            .build_int_compare(IntPredicate::EQ, attrs, nil, ""))?;
        let is_dim = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            self.tag(attrs)?,
            self.c_addr(self.rt.dim_sym_addr),
            "",
        ))?;
        let only_one = ir(self
            .builder
            .build_int_compare(IntPredicate::EQ, self.cdr(attrs)?, nil, ""))?;
        let dim_only = ir(self.builder.build_and(is_dim, only_one, ""))?;
        ir(self.builder.build_or(is_nil, dim_only, ""))
    }

    // -- cons cells --------------------------------------------------------

    fn payload_field(
        &self,
        v: PointerValue<'ctx>,
        field: u32,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        ir(self
            .builder
            .build_struct_gep(self.guest.value, v, field, ""))
    }

    pub fn car(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = self.payload_field(v, value_field::CAR)?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, "car"))?.into_pointer_value())
    }

    pub fn cdr(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = self.payload_field(v, value_field::CDR)?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, "cdr"))?.into_pointer_value())
    }

    pub fn tag(&self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = self.payload_field(v, value_field::TAG)?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, "tag"))?.into_pointer_value())
    }

    /// The generational write barrier. `x` receives a pointer to `y`; the
    /// store must go through the runtime when an old-generation cell would
    /// point at a younger one.
    pub fn write_barrier(
        &mut self,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
        fast: impl FnOnce(&mut Self) -> DiagnosticResult<()>,
        slow: impl FnOnce(&mut Self) -> DiagnosticResult<()>,
    ) -> DiagnosticResult<()> {
        let done = self.new_block("wb.done");
        let no_barrier = self.new_block("wb.fast");
        let check_y = self.new_block("wb.checky");
        let check_gen = self.new_block("wb.checkgen");
        let needs_barrier = self.new_block("wb.slow");

        let info_x = self.load_objinfo(x)?;
        let mark_x = ir(self.builder.build_and(info_x, self.c_u64(MARK_BIT), ""))?;
        let x_marked =
            ir(self
                .builder
                .build_int_compare(IntPredicate::NE, mark_x, self.c_u64(0), ""))?;
        self.cond_br(x_marked, check_y, no_barrier, None)?;

        self.position_at(check_y);
        let info_y = self.load_objinfo(y)?;
        let mark_y = ir(self.builder.build_and(info_y, self.c_u64(MARK_BIT), ""))?;
        let y_marked =
            ir(self
                .builder
                .build_int_compare(IntPredicate::NE, mark_y, self.c_u64(0), ""))?;
        self.cond_br(y_marked, check_gen, needs_barrier, None)?;

        self.position_at(check_gen);
        let gen_x = ir(self
            .builder
            .build_and(info_x, self.c_u64(GENERATION_BIT), ""))?;
        let gen_y = ir(self
            .builder
            .build_and(info_y, self.c_u64(GENERATION_BIT), ""))?;
        let older = ir(self
            .builder
            .build_int_compare(IntPredicate::UGT, gen_x, gen_y, ""))?;
        self.cond_br(older, needs_barrier, no_barrier, Some(BranchWeight::MostlyFalse))?;

        self.position_at(no_barrier);
        fast(self)?;
        self.br(done)?;

        self.position_at(needs_barrier);
        slow(self)?;
        self.br(done)?;

        self.position_at(done);
        Ok(())
    }

    pub fn set_car(
        &mut self,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
        barrier: bool,
    ) -> DiagnosticResult<()> {
        self.set_payload(x, y, value_field::CAR, barrier, &builtins::SET_CAR)
    }

    pub fn set_cdr(
        &mut self,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
        barrier: bool,
    ) -> DiagnosticResult<()> {
        self.set_payload(x, y, value_field::CDR, barrier, &builtins::SET_CDR)
    }

    pub fn set_tag(
        &mut self,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
        barrier: bool,
    ) -> DiagnosticResult<()> {
        self.set_payload(x, y, value_field::TAG, barrier, &builtins::SET_TAG)
    }

    fn set_payload(
        &mut self,
        x: PointerValue<'ctx>,
        y: PointerValue<'ctx>,
        field: u32,
        barrier: bool,
        slow: &'static crate::runtime::NativeBuiltin,
    ) -> DiagnosticResult<()> {
        if !barrier {
            let p = self.payload_field(x, field)?;
            ir(self.builder.build_store(p, y))?;
            return Ok(());
        }
        self.write_barrier(
            x,
            y,
            |lf| {
                let p = lf.payload_field(x, field)?;
                ir(lf.builder.build_store(p, y))?;
                Ok(())
            },
            |lf| {
                lf.call_rt(slow, &[x.into(), y.into()])?;
                Ok(())
            },
        )
    }

    // -- named counts ------------------------------------------------------

    pub fn shared(&self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let info = self.load_objinfo(v)?;
        let named = ir(self
            .builder
            .build_right_shift(info, self.c_u64(NAMED_SHIFT as u64), false, ""))?;
        let named = ir(self
            .builder
            .build_and(named, self.c_u64((1 << NAMED_BITS) - 1), ""))?;
        ir(self
            .builder
            .build_int_compare(IntPredicate::UGT, named, self.c_u64(1), "shared"))
    }

    /// NAMED = max(NAMED, 1).
    pub fn ensure_named(&self, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        let p = self.objinfo_ptr(v)?;
        let info = ir(self.builder.build_load(self.t_i64, p, ""))?.into_int_value();
        let named = ir(self.builder.build_and(info, self.c_u64(NAMED_MASK), ""))?;
        let unnamed =
            ir(self
                .builder
                .build_int_compare(IntPredicate::EQ, named, self.c_u64(0), ""))?;

        let bump = self.new_block("named.set");
        let done = self.new_block("named.done");
        self.cond_br(unnamed, bump, done, None)?;

        self.position_at(bump);
        let set = ir(self
            .builder
            .build_or(info, self.c_u64(1u64 << NAMED_SHIFT), ""))?;
        ir(self.builder.build_store(p, set))?;
        self.br(done)?;

        self.position_at(done);
        Ok(())
    }

    /// NAMED = max(NAMED, 2).
    pub fn ensure_shared(&self, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        let p = self.objinfo_ptr(v)?;
        let info = ir(self.builder.build_load(self.t_i64, p, ""))?.into_int_value();
        let named = ir(self
            .builder
            .build_right_shift(info, self.c_u64(NAMED_SHIFT as u64), false, ""))?;
        let named = ir(self
            .builder
            .build_and(named, self.c_u64((1 << NAMED_BITS) - 1), ""))?;
        let already =
            ir(self
                .builder
                .build_int_compare(IntPredicate::UGE, named, self.c_u64(2), ""))?;

        let bump = self.new_block("shared.set");
        let done = self.new_block("shared.done");
        self.cond_br(already, done, bump, None)?;

        self.position_at(bump);
        let cleared = ir(self.builder.build_and(info, self.c_u64(!NAMED_MASK), ""))?;
        let set = ir(self
            .builder
            .build_or(cleared, self.c_u64(2u64 << NAMED_SHIFT), ""))?;
        ir(self.builder.build_store(p, set))?;
        self.br(done)?;

        self.position_at(done);
        Ok(())
    }

    /// Saturating NAMED increment.
    pub fn increment_named(&self, v: PointerValue<'ctx>, max: u64) -> DiagnosticResult<()> {
        let p = self.objinfo_ptr(v)?;
        let info = ir(self.builder.build_load(self.t_i64, p, ""))?.into_int_value();
        let named = ir(self
            .builder
            .build_right_shift(info, self.c_u64(NAMED_SHIFT as u64), false, ""))?;
        let named = ir(self
            .builder
            .build_and(named, self.c_u64((1 << NAMED_BITS) - 1), ""))?;
        let saturated =
            ir(self
                .builder
                .build_int_compare(IntPredicate::EQ, named, self.c_u64(max), ""))?;

        let bump = self.new_block("incnamed");
        let done = self.new_block("incnamed.done");
        self.cond_br(saturated, done, bump, None)?;

        self.position_at(bump);
        let next = ir(self.builder.build_int_nsw_add(named, self.c_u64(1), ""))?;
        let shifted = ir(self
            .builder
            .build_left_shift(next, self.c_u64(NAMED_SHIFT as u64), ""))?;
        let cleared = ir(self.builder.build_and(info, self.c_u64(!NAMED_MASK), ""))?;
        let set = ir(self.builder.build_or(cleared, shifted, ""))?;
        ir(self.builder.build_store(p, set))?;
        self.br(done)?;

        self.position_at(done);
        Ok(())
    }

    /// Apply the creation-site refcount annotation for `i`, if any.
    pub fn ensure_named_if_needed(
        &mut self,
        i: InstrId,
        val: Option<BasicValueEnum<'ctx>>,
    ) -> DiagnosticResult<()> {
        if self.instr_rep(i) != Rep::Boxed {
            return Ok(());
        }
        let initialized = self
            .variables
            .get(&i)
            .map(|v| v.initialized)
            .unwrap_or(false);
        if !initialized {
            return Ok(());
        }
        if self.inputs.refcount.at_creation.contains_key(&i) {
            // conservatively shares for either adjustment kind
            let v = match val {
                Some(v) => v,
                None => self.load_val(Value::Instr(i), Rep::Boxed)?,
            };
            self.ensure_shared(v.into_pointer_value())?;
        }
        Ok(())
    }

    /// Apply the before-use refcount annotations of `i` to its operands.
    pub fn adjust_refcounts_before_use(&mut self, i: InstrId) -> DiagnosticResult<()> {
        let needed = match self.inputs.refcount.before_use.get(&i) {
            Some(m) => m.clone(),
            None => return Ok(()),
        };
        let mut operands: Vec<Value> = Vec::new();
        self.code.instr(i).each_arg(|v| operands.push(v));
        for v in operands {
            if self.val_rep(v) != Rep::Boxed {
                continue;
            }
            if let Value::Instr(j) = self.code.follow_casts(v) {
                if let Some(kind) = needed.get(&j) {
                    let loaded = self.load_val(v, Rep::Boxed)?.into_pointer_value();
                    match kind {
                        AdjustKind::SetShared => self.ensure_shared(loaded)?,
                        AdjustKind::EnsureNamed => self.ensure_named(loaded)?,
                    }
                }
            }
        }
        Ok(())
    }

    // -- NA and error checks ----------------------------------------------

    /// Branch to `is_na` when `v` is the representation's NA; fall through
    /// (or to `not_na`) otherwise, leaving the builder positioned there.
    pub fn nacheck(
        &mut self,
        v: BasicValueEnum<'ctx>,
        is_na: BasicBlock<'ctx>,
        not_na: Option<BasicBlock<'ctx>>,
    ) -> DiagnosticResult<()> {
        let not_na = match not_na {
            Some(b) => b,
            None => self.new_block("notna"),
        };
        let ok = if v.is_float_value() {
            let f = v.into_float_value();
            ir(self
                .builder
                .build_float_compare(FloatPredicate::OEQ, f, f, "notna"))?
        } else {
            let i = v.into_int_value();
            ir(self.builder.build_int_compare(
                IntPredicate::NE,
                i,
                self.c_i32(NA_INT as i64),
                "notna",
            ))?
        };
        self.cond_br(ok, not_na, is_na, Some(BranchWeight::MostlyTrue))?;
        self.position_at(not_na);
        Ok(())
    }

    /// Raise the missing-argument error when `v` is the missing sentinel.
    pub fn check_missing(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        let bad = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            v,
            self.c_addr(self.rt.missing_addr),
            "",
        ))?;
        let nok = self.new_block("missing");
        let ok = self.new_block("notmissing");
        self.cond_br(bad, nok, ok, Some(BranchWeight::AlwaysFalse))?;

        self.position_at(nok);
        let msg = self.global_string("argument is missing, with no default")?;
        self.call_rt(&builtins::ERROR, &[msg.into()])?;
        self.br(ok)?;

        self.position_at(ok);
        Ok(())
    }

    /// Raise the object-not-found error when `v` is the unbound sentinel.
    pub fn check_unbound(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        let bad = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            v,
            self.c_addr(self.rt.unbound_addr),
            "",
        ))?;
        let nok = self.new_block("unbound");
        let ok = self.new_block("bound");
        self.cond_br(bad, nok, ok, Some(BranchWeight::AlwaysFalse))?;

        self.position_at(nok);
        let msg = self.global_string("object not found")?;
        self.call_rt(&builtins::ERROR, &[msg.into()])?;
        self.br(ok)?;

        self.position_at(ok);
        Ok(())
    }

    pub fn global_string(&mut self, s: &str) -> DiagnosticResult<PointerValue<'ctx>> {
        let name = format!("str.{}", self.next_global);
        self.next_global += 1;
        let gv = ir(self.builder.build_global_string_ptr(s, &name))?;
        Ok(gv.as_pointer_value())
    }

    /// Emit a self-check: abort through the runtime when `cond` is false.
    /// Only present with `slow_asserts`.
    pub fn insn_assert(&mut self, cond: IntValue<'ctx>, msg: &str) -> DiagnosticResult<()> {
        if !self.opts.slow_asserts {
            return Ok(());
        }
        let fail = self.new_block("assert.fail");
        let ok = self.new_block("assert.ok");
        self.cond_br(cond, ok, fail, Some(BranchWeight::AlwaysTrue))?;

        self.position_at(fail);
        let m = self.global_string(msg)?;
        self.call_rt(&builtins::ASSERT_FAIL, &[m.into()])?;
        ir(self.builder.build_return(Some(&self.null_ptr())))?;

        self.position_at(ok);
        Ok(())
    }

    // -- boxing and unboxing ----------------------------------------------

    /// Pointer to a vector's element data, which follows the header.
    pub fn data_ptr(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        if self.opts.slow_asserts {
            let alt = self.is_altrep(v)?;
            let not_alt = ir(self.builder.build_not(alt, ""))?;
            self.insn_assert(not_alt, "direct data access on an altrep vector")?;
        }
        unsafe {
            ir(self
                .builder
                .build_gep(self.guest.vector, v, &[self.c_i32(1)], "data"))
        }
    }

    fn elem_type(&self, ty: &PirType) -> inkwell::types::BasicTypeEnum<'ctx> {
        if ty.is_a(&PirType::int().not_object()) || ty.is_a(&PirType::logical().not_object()) {
            self.t_i32.into()
        } else if ty.is_a(&PirType::real().not_object()) {
            self.t_f64.into()
        } else {
            self.t_ptr.into()
        }
    }

    pub fn vector_position_ptr(
        &mut self,
        vector: PointerValue<'ctx>,
        position: IntValue<'ctx>,
        ty: &PirType,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let data = self.data_ptr(vector)?;
        let elem = self.elem_type(ty);
        let pos64 = if position.get_type() == self.t_i64 {
            position
        } else {
            ir(self.builder.build_int_z_extend(position, self.t_i64, ""))?
        };
        unsafe { ir(self.builder.build_gep(elem, data, &[pos64], "elt")) }
    }

    pub fn access_vector(
        &mut self,
        vector: PointerValue<'ctx>,
        position: IntValue<'ctx>,
        ty: &PirType,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let p = self.vector_position_ptr(vector, position, ty)?;
        let elem = self.elem_type(ty);
        ir(self.builder.build_load(elem, p, ""))
    }

    pub fn assign_vector(
        &mut self,
        vector: PointerValue<'ctx>,
        position: IntValue<'ctx>,
        value: BasicValueEnum<'ctx>,
        ty: &PirType,
    ) -> DiagnosticResult<()> {
        let p = self.vector_position_ptr(vector, position, ty)?;
        ir(self.builder.build_store(p, value))?;
        Ok(())
    }

    pub fn unbox_int_lgl(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let p = self.data_ptr(v)?;
        Ok(ir(self.builder.build_load(self.t_i32, p, "unbox"))?.into_int_value())
    }

    pub fn unbox_real(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<FloatValue<'ctx>> {
        let p = self.data_ptr(v)?;
        Ok(ir(self.builder.build_load(self.t_f64, p, "unbox"))?.into_float_value())
    }

    /// Unbox a numeric scalar of unknown concrete kind to Float64, mapping
    /// the integer NA to NaN.
    pub fn unbox_real_int_lgl(
        &mut self,
        v: PointerValue<'ctx>,
    ) -> DiagnosticResult<FloatValue<'ctx>> {
        let is_real = self.new_block("unbox.real");
        let not_real = self.new_block("unbox.intlgl");
        let done = self.new_block("unbox.done");
        let mut res = self.phi_join(Rep::Float64);

        let kind = self.kind_of(v)?;
        let t = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.c_i32(ObjKind::Real as i64),
            "",
        ))?;
        self.cond_br(t, is_real, not_real, None)?;

        self.position_at(not_real);
        let iv = self.unbox_int_lgl(v)?;
        let is_na = self.new_block("unbox.isna");
        self.nacheck(iv.into(), is_na, None)?;
        let widened = ir(self
            .builder
            .build_signed_int_to_float(iv, self.t_f64, ""))?;
        res.add(widened.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_na);
        res.add(self.c_f64(f64::NAN).into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_real);
        let fv = self.unbox_real(v)?;
        res.add(fv.into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        Ok(res.build(&self.builder)?.into_float_value())
    }

    pub fn box_int(&mut self, v: IntValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        Ok(self
            .call_rt_val(&builtins::BOX_INT, &[v.into()])?
            .into_pointer_value())
    }

    pub fn box_real(&mut self, v: FloatValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        Ok(self
            .call_rt_val(&builtins::BOX_REAL, &[v.into()])?
            .into_pointer_value())
    }

    pub fn box_lgl(&mut self, v: IntValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        Ok(self
            .call_rt_val(&builtins::BOX_LGL, &[v.into()])?
            .into_pointer_value())
    }

    /// Test values are exactly 0 or 1; boxing is a select between the
    /// eternal singletons, no allocation.
    pub fn box_tst(&self, v: IntValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let t = ir(self
            .builder
            .build_int_compare(IntPredicate::NE, v, self.c_i32(0), ""))?;
        Ok(ir(self.builder.build_select(
            t,
            self.c_addr(self.rt.true_addr),
            self.c_addr(self.rt.false_addr),
            "",
        ))?
        .into_pointer_value())
    }

    /// Box an unboxed scalar according to the PIR type that demanded it.
    pub fn box_value(
        &mut self,
        v: BasicValueEnum<'ctx>,
        ty: &PirType,
        protect: bool,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let res = if ty.is_a(&PirType::test()) {
            self.box_tst(v.into_int_value())?
        } else if ty.is_a(&PirType::logical().not_object()) {
            self.box_lgl(v.into_int_value())?
        } else if ty.is_a(&PirType::int().not_object()) {
            let iv = if v.is_float_value() {
                self.float_to_int_na(v.into_float_value())?
            } else {
                v.into_int_value()
            };
            self.box_int(iv)?
        } else if ty.is_a(&PirType::real().not_object()) {
            let fv = if v.is_int_value() {
                self.int_to_float_na(v.into_int_value())?
            } else {
                v.into_float_value()
            };
            self.box_real(fv)?
        } else {
            return Err(Diagnostic::new(format!("cannot box a {:?}", ty)));
        };
        if protect {
            self.protect_temp(res)?;
        }
        Ok(res)
    }

    /// NA-exact Int32 -> Float64.
    pub fn int_to_float_na(&self, v: IntValue<'ctx>) -> DiagnosticResult<FloatValue<'ctx>> {
        let is_na = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            v,
            self.c_i32(NA_INT as i64),
            "",
        ))?;
        let wide = ir(self.builder.build_signed_int_to_float(v, self.t_f64, ""))?;
        Ok(
            ir(self
                .builder
                .build_select(is_na, self.c_f64(f64::NAN), wide, ""))?
            .into_float_value(),
        )
    }

    /// NA-exact Float64 -> Int32.
    pub fn float_to_int_na(&self, v: FloatValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let is_na = ir(self
            .builder
            .build_float_compare(FloatPredicate::UNE, v, v, ""))?;
        let narrow = ir(self.builder.build_float_to_signed_int(v, self.t_i32, ""))?;
        Ok(ir(self.builder.build_select(
            is_na,
            self.c_i32(NA_INT as i64),
            narrow,
            "",
        ))?
        .into_int_value())
    }

    // -- operand loading ---------------------------------------------------

    pub fn load_sxp(&mut self, v: Value) -> DiagnosticResult<PointerValue<'ctx>> {
        Ok(self.load_val(v, Rep::Boxed)?.into_pointer_value())
    }

    pub fn load_val(&mut self, v: Value, needed: Rep) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let ty = self.type_of(v);
        self.load_typed(v, &ty, needed)
    }

    /// Resolve an operand and coerce it into the requested representation.
    pub fn load_typed(
        &mut self,
        v: Value,
        ty: &PirType,
        needed: Rep,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        // casts of constant loads re-materialize from the pool
        if let Value::Instr(i) = v {
            if matches!(self.code.instr(i).op, Op::CastType) {
                let inner = self.code.instr(i).args[0];
                if let Value::Instr(a) = inner {
                    if matches!(self.code.instr(a).op, Op::LdConst(_)) {
                        return self.load_typed(inner, ty, needed);
                    }
                }
            }
        }

        let mut res: BasicValueEnum<'ctx> = match v {
            Value::Instr(i) => {
                if let Op::LdConst(idx) = self.code.instr(i).op {
                    self.constant_pool_at(idx, needed)?
                } else if self.variables.contains_key(&i) {
                    self.get_variable(i)?
                } else {
                    return Err(Diagnostic::at_instr("operand has no binding", i));
                }
            }
            Value::True => self.singleton(self.rt.true_addr, 1, needed)?,
            Value::False => self.singleton(self.rt.false_addr, 0, needed)?,
            Value::NaLogical => self.singleton(self.rt.na_logical_addr, NA_INT as i64, needed)?,
            Value::Nil | Value::ElidedEnv => self.c_addr(self.rt.nil_addr).into(),
            Value::MissingArg => self.c_addr(self.rt.missing_addr).into(),
            Value::UnboundValue => self.c_addr(self.rt.unbound_addr).into(),
            Value::GlobalEnv => self.c_addr(self.rt.global_env_addr).into(),
            Value::BaseEnv => self.c_addr(self.rt.base_env_addr).into(),
        };

        // unbox when a scalar representation is requested
        if res.is_pointer_value() && needed != Rep::Boxed {
            let p = res.into_pointer_value();
            if ty.is_a(&PirType::int().scalar().not_object()) {
                res = self.unbox_int_lgl(p)?.into();
            } else if ty.is_a(
                &PirType::int()
                    .union(&PirType::logical())
                    .scalar()
                    .not_object(),
            ) {
                res = self.unbox_int_lgl(p)?.into();
            } else if ty.is_a(&PirType::real().scalar().not_object()) {
                res = self.unbox_real(p)?.into();
            } else if ty.is_a(&PirType::num().scalar().not_object()) {
                res = self.unbox_real_int_lgl(p)?.into();
            } else {
                return Err(Diagnostic::new(format!("cannot unbox a {:?}", ty)));
            }
        }

        // scalar-to-scalar coercions
        if res.is_int_value() && needed == Rep::Float64 {
            res = self.int_to_float_na(res.into_int_value())?.into();
        } else if res.is_float_value() && needed == Rep::Int32 {
            res = self.float_to_int_na(res.into_float_value())?.into();
        } else if !res.is_pointer_value() && needed == Rep::Boxed {
            res = self.box_value(res, ty, true)?.into();
        }

        let want = self.rep_type(needed);
        if res.get_type() != want {
            return Err(Diagnostic::new(format!(
                "failed to load operand in representation {:?}",
                needed
            )));
        }
        Ok(res)
    }

    fn singleton(
        &self,
        addr: usize,
        scalar: i64,
        needed: Rep,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        Ok(match needed {
            Rep::Boxed | Rep::Bottom => self.c_addr(addr).into(),
            Rep::Int32 => self.c_i32(scalar).into(),
            Rep::Float64 => {
                if scalar == NA_INT as i64 {
                    self.c_f64(f64::NAN).into()
                } else {
                    self.c_f64(scalar as f64).into()
                }
            }
        })
    }

    /// A constant-pool entry in the requested representation. Scalars fold
    /// to immediates; boxed loads index the runtime pool vector.
    pub fn constant_pool_at(
        &mut self,
        idx: PoolIdx,
        needed: Rep,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let c = self.code.pool_get(idx).clone();
        match needed {
            Rep::Int32 => Ok(match c {
                Const::Int(v) | Const::Lgl(v) => self.c_i32(v as i64).into(),
                Const::Real(v) => self.c_i32(v as i32 as i64).into(),
                _ => return Err(Diagnostic::new("constant is not integer convertible")),
            }),
            Rep::Float64 => Ok(match c {
                Const::Int(v) => self.c_f64(v as f64).into(),
                Const::Real(v) => self.c_f64(v).into(),
                _ => return Err(Diagnostic::new("constant is not real convertible")),
            }),
            Rep::Boxed | Rep::Bottom => match c {
                Const::Sym(s) => Ok(self.symbol_const(s)?.into()),
                Const::Nil => Ok(self.c_addr(self.rt.nil_addr).into()),
                _ => {
                    let pool_cell = self.c_addr(self.rt.constant_pool_addr);
                    let pool = ir(self.builder.build_load(self.t_ptr, pool_cell, "pool"))?
                        .into_pointer_value();
                    let data = self.data_ptr(pool)?;
                    let slot = unsafe {
                        ir(self.builder.build_gep(
                            self.t_ptr,
                            data,
                            &[self.c_i64(idx.0 as i64)],
                            "",
                        ))?
                    };
                    ir(self.builder.build_load(self.t_ptr, slot, "const"))
                }
            },
        }
    }

    /// Convert a produced value to an instruction's declared type.
    pub fn convert(
        &mut self,
        val: BasicValueEnum<'ctx>,
        to: &PirType,
        protect: bool,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let to_rep = rep_of_type(to);
        let want = self.rep_type(to_rep);
        if val.get_type() == want {
            return Ok(val);
        }
        if val.is_pointer_value() && to_rep == Rep::Int32 {
            return Ok(self.unbox_int_lgl(val.into_pointer_value())?.into());
        }
        if val.is_pointer_value() && to_rep == Rep::Float64 {
            return Ok(self.unbox_real_int_lgl(val.into_pointer_value())?.into());
        }
        if !val.is_pointer_value() && to_rep == Rep::Boxed {
            return Ok(self.box_value(val, to, protect)?.into());
        }
        if val.is_int_value() && to_rep == Rep::Float64 {
            return Ok(self.int_to_float_na(val.into_int_value())?.into());
        }
        if val.is_float_value() && to_rep == Rep::Int32 {
            return Ok(self.float_to_int_na(val.into_float_value())?.into());
        }
        Err(Diagnostic::new(format!("cannot convert value to {:?}", to)))
    }

    // -- variable bindings -------------------------------------------------

    pub fn get_variable(&mut self, i: InstrId) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        if !self.liveness.count(i) {
            return Err(Diagnostic::at_instr("read of value liveness dropped", i));
        }
        let var = self
            .variables
            .get(&i)
            .ok_or_else(|| Diagnostic::at_instr("value has no variable", i))?;
        var.get(&self.builder)
    }

    /// First write. Writes to values liveness proved dead are silently
    /// dropped; their storage may have been reused.
    pub fn set_variable(
        &mut self,
        i: InstrId,
        val: BasicValueEnum<'ctx>,
        volatile: bool,
    ) -> DiagnosticResult<()> {
        if !self.liveness.count(i) {
            return Ok(());
        }
        if !self.code.instr(i).is_phi() && !self.liveness.live_after(self.current_instr, i) {
            return Err(Diagnostic::at_instr(
                "write to a value that is dead at its definition",
                i,
            ));
        }
        let var = self
            .variables
            .get_mut(&i)
            .ok_or_else(|| Diagnostic::at_instr("value has no variable", i))?;
        let store = var.set(&self.builder, val)?;
        if volatile {
            if let Some(inst) = store {
                let _ = inst.set_volatile(true);
            }
        }
        Ok(())
    }

    /// Later write through a mutable binding (phi updates, restarts).
    pub fn update_variable(
        &mut self,
        i: InstrId,
        val: BasicValueEnum<'ctx>,
    ) -> DiagnosticResult<()> {
        if !self.liveness.count(i) {
            return Ok(());
        }
        if self.code.instr(i).is_phi() {
            // the phi's block must be a successor of the updating block
            let target = self.code.instr(i).owner();
            let ok = self
                .code
                .successors(self.current_bb)
                .contains(&target);
            if !ok {
                return Err(Diagnostic::at_instr(
                    "phi update outside a predecessor block",
                    i,
                ));
            }
        }
        let var = self
            .variables
            .get_mut(&i)
            .ok_or_else(|| Diagnostic::at_instr("value has no variable", i))?;
        var.update(&self.builder, val)?;
        Ok(())
    }

    /// Assign instruction `i`'s result.
    pub fn set_val(&mut self, i: InstrId, val: BasicValueEnum<'ctx>) -> DiagnosticResult<()> {
        let ty = self.code.instr(i).ty;
        let val = self.convert(val, &ty, false)?;
        let volatile = self.in_push_context > 0 && self.escapes_inline_context.contains(&i);
        self.set_variable(i, val, volatile)
    }

    /// If `from` and `to` already share storage, the move is dead; marks
    /// `to` initialized as a side effect.
    pub fn dead_move(&mut self, from: Value, to: InstrId) -> bool {
        let fi = match from {
            Value::Instr(i) => i,
            _ => return false,
        };
        let (Some(a), Some(b)) = (self.variables.get(&fi), self.variables.get(&to)) else {
            return false;
        };
        let dead = a.same_storage(b);
        if dead {
            if let Some(b) = self.variables.get_mut(&to) {
                b.initialized = true;
            }
        }
        dead
    }

    // -- node stack --------------------------------------------------------

    pub fn nodestack_ptr(&self) -> DiagnosticResult<PointerValue<'ctx>> {
        let addr = self.c_addr(self.rt.stack_top_addr);
        Ok(ir(self.builder.build_load(self.t_ptr, addr, "stacktop"))?.into_pointer_value())
    }

    pub fn inc_stack(&mut self, n: usize, zero: bool) -> DiagnosticResult<()> {
        if n == 0 {
            return Ok(());
        }
        let cur = self.nodestack_ptr()?;
        if zero {
            let bytes = self.c_u64((n * 16) as u64);
            ir(self
                .builder
                .build_memset(cur, 1, self.t_i8.const_zero(), bytes))?;
        }
        let up = unsafe {
            ir(self.builder.build_gep(
                self.guest.stack_cell,
                cur,
                &[self.c_i32(n as i64)],
                "",
            ))?
        };
        ir(self
            .builder
            .build_store(self.c_addr(self.rt.stack_top_addr), up))?;
        Ok(())
    }

    pub fn dec_stack(&mut self, n: usize) -> DiagnosticResult<()> {
        if n == 0 {
            return Ok(());
        }
        let cur = self.nodestack_ptr()?;
        let down = unsafe {
            ir(self.builder.build_gep(
                self.guest.stack_cell,
                cur,
                &[self.c_i32(-(n as i64))],
                "",
            ))?
        };
        ir(self
            .builder
            .build_store(self.c_addr(self.rt.stack_top_addr), down))?;
        Ok(())
    }

    /// Store `vals` into the cells below the (already grown) stack top,
    /// zeroing their tags first.
    pub fn write_stack(&mut self, vals: &[PointerValue<'ctx>]) -> DiagnosticResult<()> {
        if vals.is_empty() {
            return Ok(());
        }
        let top = self.nodestack_ptr()?;
        let n = vals.len();
        let base = unsafe {
            ir(self.builder.build_gep(
                self.guest.stack_cell,
                top,
                &[self.c_i32(-(n as i64))],
                "frame",
            ))?
        };
        let bytes = self.c_u64((n * 16) as u64);
        ir(self
            .builder
            .build_memset(base, 1, self.t_i8.const_zero(), bytes))?;
        for (k, v) in vals.iter().enumerate() {
            let cell = unsafe {
                ir(self.builder.build_gep(
                    self.guest.stack_cell,
                    base,
                    &[self.c_i32(k as i64)],
                    "",
                ))?
            };
            let slot = ir(self.builder.build_struct_gep(
                self.guest.stack_cell,
                cell,
                stack_cell_field::VALUE,
                "",
            ))?;
            ir(self.builder.build_store(slot, *v))?;
        }
        Ok(())
    }

    /// Grow a call frame, evaluate the arguments into it, run `call`, then
    /// (unless `pop` is off) shrink the frame again.
    pub fn with_call_frame(
        &mut self,
        args: &[Value],
        call: impl FnOnce(&mut Self) -> DiagnosticResult<BasicValueEnum<'ctx>>,
        pop: bool,
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let n = args.len();
        self.inc_stack(n, false)?;
        let mut vals = Vec::with_capacity(n);
        for a in args {
            vals.push(self.load_sxp(*a)?);
        }
        self.write_stack(&vals)?;
        let res = call(self)?;
        if pop {
            self.dec_stack(n)?;
        }
        Ok(res)
    }

    fn frame_slot_ptr(&self, i: usize) -> DiagnosticResult<PointerValue<'ctx>> {
        let base = self
            .basepointer
            .ok_or_else(|| Diagnostic::new("frame base not yet established"))?;
        let cell = unsafe {
            ir(self.builder.build_gep(
                self.guest.stack_cell,
                base,
                &[self.c_i32(i as i64)],
                "",
            ))?
        };
        ir(self.builder.build_struct_gep(
            self.guest.stack_cell,
            cell,
            stack_cell_field::VALUE,
            "local",
        ))
    }

    pub fn set_local(&mut self, i: usize, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        let p = self.frame_slot_ptr(i)?;
        let store = ir(self.builder.build_store(p, v))?;
        let _ = store.set_volatile(true);
        Ok(())
    }

    pub fn get_local(&mut self, i: usize) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = self.frame_slot_ptr(i)?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, ""))?.into_pointer_value())
    }

    /// Park a freshly allocated temporary in a scratch slot so it survives
    /// the next allocation.
    pub fn protect_temp(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<()> {
        if self.num_temps >= MAX_TEMPS {
            return Err(Diagnostic::new("out of temp protection slots"));
        }
        let slot = self.num_locals - 1 - self.num_temps;
        self.num_temps += 1;
        self.set_local(slot, v)
    }

    /// The n-th incoming argument cell.
    pub fn argument(&mut self, n: u32) -> DiagnosticResult<PointerValue<'ctx>> {
        let cell = unsafe {
            ir(self.builder.build_gep(
                self.guest.stack_cell,
                self.param_args(),
                &[self.c_i32(n as i64)],
                "",
            ))?
        };
        let slot = ir(self.builder.build_struct_gep(
            self.guest.stack_cell,
            cell,
            stack_cell_field::VALUE,
            "arg",
        ))?;
        Ok(ir(self.builder.build_load(self.t_ptr, slot, ""))?.into_pointer_value())
    }

    pub fn set_visible(&self, visible: bool) -> DiagnosticResult<()> {
        let addr = self.c_addr(self.rt.visible_addr);
        ir(self
            .builder
            .build_store(addr, self.c_i32(visible as i64)))?;
        Ok(())
    }

    // -- promises ----------------------------------------------------------

    /// Peel a promise wrapper without evaluating: a promise yields its CAR,
    /// anything else passes through.
    pub fn depromise(&mut self, arg: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let is_prom = self.new_block("deprom.prom");
        let is_val = self.new_block("deprom.val");
        let done = self.new_block("deprom.done");
        let mut res = self.phi_join(Rep::Boxed);

        let kind = self.kind_of(arg)?;
        let t = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.c_i32(ObjKind::Promise as i64),
            "",
        ))?;
        self.cond_br(t, is_prom, is_val, None)?;

        self.position_at(is_prom);
        let val = self.car(arg)?;
        res.add(val.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_val);
        res.add(arg.into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        Ok(res.build(&self.builder)?.into_pointer_value())
    }

    /// Full force: already-evaluated promises read their CAR, unevaluated
    /// ones go through the runtime. Never returns a promise.
    pub fn force_value(&mut self, arg: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        let is_prom = self.new_block("force.prom");
        let needs_eval = self.new_block("force.eval");
        let is_val = self.new_block("force.val");
        let is_prom_val = self.new_block("force.promval");
        let done = self.new_block("force.done");
        let mut res = self.phi_join(Rep::Boxed);

        let kind = self.kind_of(arg)?;
        let t = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.c_i32(ObjKind::Promise as i64),
            "",
        ))?;
        self.cond_br(t, is_prom, is_val, None)?;

        self.position_at(is_prom);
        let val = self.car(arg)?;
        let unbound = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            val,
            self.c_addr(self.rt.unbound_addr),
            "",
        ))?;
        self.cond_br(unbound, needs_eval, is_prom_val, None)?;

        self.position_at(needs_eval);
        let forced = self
            .call_rt_val(&builtins::FORCE_PROMISE, &[arg.into()])?
            .into_pointer_value();
        res.add(forced.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_val);
        res.add(arg.into(), self.cur_block());
        self.br(done)?;

        self.position_at(is_prom_val);
        res.add(val.into(), self.cur_block());
        self.br(done)?;

        self.position_at(done);
        Ok(res.build(&self.builder)?.into_pointer_value())
    }

    // -- stub environments -------------------------------------------------

    /// Is `v` a runtime external object tagged as a stub environment?
    pub fn is_env_stub_obj(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<IntValue<'ctx>> {
        let kind = self.kind_of(v)?;
        let is_ext = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            kind,
            self.c_i32(ObjKind::Native as i64),
            "",
        ))?;
        let header = self.stub_header(v)?;
        let magic_p = ir(self
            .builder
            .build_struct_gep(self.guest.stub_env, header, 0, "magic"))?;
        let magic = ir(self.builder.build_load(self.t_i32, magic_p, ""))?.into_int_value();
        let magic_ok = ir(self.builder.build_int_compare(
            IntPredicate::EQ,
            magic,
            self.c_i32(STUB_ENV_MAGIC as i64),
            "",
        ))?;
        ir(self.builder.build_and(is_ext, magic_ok, ""))
    }

    fn stub_header(&mut self, v: PointerValue<'ctx>) -> DiagnosticResult<PointerValue<'ctx>> {
        self.data_ptr(v)
    }

    /// Pointer to slot `i` of a stub's payload. Negative indices address
    /// the materialized-env and parent slots before the locals.
    fn stub_slot_ptr(
        &mut self,
        v: PointerValue<'ctx>,
        i: i32,
        nlocals: usize,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let header = self.stub_header(v)?;
        let missing = unsafe {
            ir(self.builder.build_gep(
                self.guest.stub_env,
                header,
                &[self.c_i32(1)],
                "missingbits",
            ))?
        };
        let payload = unsafe {
            ir(self.builder.build_gep(
                self.t_i8,
                missing,
                &[self.c_i32(nlocals as i64)],
                "payload",
            ))?
        };
        unsafe {
            ir(self.builder.build_gep(
                self.t_ptr,
                payload,
                &[self.c_i32((i + STUB_ARG_OFFSET) as i64)],
                "stubslot",
            ))
        }
    }

    pub fn env_stub_get(
        &mut self,
        v: PointerValue<'ctx>,
        i: i32,
        nlocals: usize,
    ) -> DiagnosticResult<PointerValue<'ctx>> {
        let p = self.stub_slot_ptr(v, i, nlocals)?;
        Ok(ir(self.builder.build_load(self.t_ptr, p, ""))?.into_pointer_value())
    }

    pub fn env_stub_set_not_missing(
        &mut self,
        v: PointerValue<'ctx>,
        i: i32,
    ) -> DiagnosticResult<()> {
        let header = self.stub_header(v)?;
        let missing = unsafe {
            ir(self.builder.build_gep(
                self.guest.stub_env,
                header,
                &[self.c_i32(1)],
                "",
            ))?
        };
        let p = unsafe {
            ir(self
                .builder
                .build_gep(self.t_i8, missing, &[self.c_i32(i as i64)], ""))?
        };
        ir(self
            .builder
            .build_store(p, self.t_i8.const_int(1, false)))?;
        Ok(())
    }

    pub fn env_stub_set(
        &mut self,
        v: PointerValue<'ctx>,
        i: i32,
        y: PointerValue<'ctx>,
        nlocals: usize,
        set_not_missing: bool,
    ) -> DiagnosticResult<()> {
        self.write_barrier(
            v,
            y,
            |lf| {
                let p = lf.stub_slot_ptr(v, i, nlocals)?;
                ir(lf.builder.build_store(p, y))?;
                Ok(())
            },
            |lf| {
                lf.call_rt(
                    &builtins::EXTERNAL_SET_ENTRY,
                    &[v.into(), lf.c_i32((i + STUB_ARG_OFFSET) as i64).into(), y.into()],
                )?;
                Ok(())
            },
        )?;
        if set_not_missing {
            self.env_stub_set_not_missing(v, i)?;
        }
        Ok(())
    }

    // -- fast-path index computation --------------------------------------

    /// Whether a vector operand's type admits direct element access.
    pub fn vector_type_support(&self, v: Value) -> bool {
        let t = self.type_of(v);
        t.is_a(&PirType::list().not_object())
            || t.is_a(&PirType::int().not_object())
            || t.is_a(&PirType::logical().not_object())
            || t.is_a(&PirType::real().not_object())
    }

    /// Turn a 1-based guest index into a checked 0-based native index,
    /// branching to `fallback` on NA, fractional garbage, or bounds
    /// violations. Leaves the builder in the hit block.
    pub fn compute_and_check_index(
        &mut self,
        index: Value,
        vector: BasicValueEnum<'ctx>,
        fallback: BasicBlock<'ctx>,
        max: Option<IntValue<'ctx>>,
    ) -> DiagnosticResult<IntValue<'ctx>> {
        let hit1 = self.new_block("idx.native");
        let hit = self.new_block("idx.ok");

        let mut rep = self.val_rep(index);
        let mut native = self.load_val(index, rep)?;
        if rep == Rep::Boxed {
            // a boxed index is some numeric scalar; go through Float64 so
            // integer NA surfaces as NaN and fails the checks below
            let p = native.into_pointer_value();
            native = self.unbox_real_int_lgl(p)?.into();
            rep = Rep::Float64;
        }

        let index64 = if rep == Rep::Float64 {
            let f = native.into_float_value();
            let under = ir(self
                .builder
                .build_float_compare(FloatPredicate::ULT, f, self.c_f64(1.0), ""))?;
            let over = ir(self.builder.build_float_compare(
                FloatPredicate::UGE,
                f,
                self.c_f64(u64::MAX as f64),
                "",
            ))?;
            let nan = ir(self
                .builder
                .build_float_compare(FloatPredicate::UNE, f, f, ""))?;
            let bad = ir(self.builder.build_or(under, over, ""))?;
            let bad = ir(self.builder.build_or(bad, nan, ""))?;
            self.cond_br(bad, fallback, hit1, Some(BranchWeight::MostlyFalse))?;
            self.position_at(hit1);
            ir(self.builder.build_float_to_unsigned_int(f, self.t_i64, ""))?
        } else {
            let iv = native.into_int_value();
            let under =
                ir(self
                    .builder
                    .build_int_compare(IntPredicate::SLT, iv, self.c_i32(1), ""))?;
            let na = ir(self.builder.build_int_compare(
                IntPredicate::EQ,
                iv,
                self.c_i32(NA_INT as i64),
                "",
            ))?;
            let bad = ir(self.builder.build_or(under, na, ""))?;
            self.cond_br(bad, fallback, hit1, Some(BranchWeight::MostlyFalse))?;
            self.position_at(hit1);
            ir(self.builder.build_int_z_extend(iv, self.t_i64, ""))?
        };

        // guest indexing is 1-based
        let zero_based = ir(self.builder.build_int_nsw_sub(index64, self.c_u64(1), ""))?;

        let limit = match max {
            Some(m) => m,
            None => {
                if vector.is_pointer_value() {
                    self.vector_length(vector.into_pointer_value())?
                } else {
                    self.c_u64(1)
                }
            }
        };
        let oob = ir(self
            .builder
            .build_int_compare(IntPredicate::UGE, zero_based, limit, ""))?;
        self.cond_br(oob, fallback, hit, Some(BranchWeight::MostlyFalse))?;
        self.position_at(hit);
        Ok(zero_based)
    }
}
