//! Vector element reads and writes.
//!
//! Reads and writes of statically plausible shapes get a guarded direct
//! path: not altrep, attributes absent (or only `dim`), index in range,
//! and for writes the vector must be unshared so in-place update is
//! legal. Every guard failure lands in a fallback block that calls the
//! generic runtime accessor, and both results join in a phi.

use inkwell::values::BasicValueEnum;

use fern_pir::{InstrId, Op, PirType, Value};

use crate::codegen::{ir, BranchWeight, LowerFunction};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::rep::Rep;
use crate::runtime::{builtins, NativeBuiltin};

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    fn scalar_num_index(&self, idx: Value) -> bool {
        self.type_of(idx)
            .is_a(&PirType::int_real().not_object().scalar())
    }

    /// env operand, or nil for env-elided accesses.
    fn env_or_nil(&mut self, iid: InstrId) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        if self.code.instr(iid).has_env() {
            Ok(self.lower_env_operand(iid)?.into())
        } else {
            Ok(self.c_addr(self.rt.nil_addr).into())
        }
    }

    pub(crate) fn lower_extract(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        match op {
            Op::Extract1_1D => self.extract_1d(iid, args, true),
            Op::Extract2_1D => self.extract_1d(iid, args, false),
            Op::Extract1_2D => self.extract_2d(iid, args, true),
            Op::Extract2_2D => self.extract_2d(iid, args, false),
            Op::Extract1_3D => {
                // no speculative path for three subscripts
                let vec = self.load_sxp(args[0])?;
                let i1 = self.load_sxp(args[1])?;
                let i2 = self.load_sxp(args[2])?;
                let i3 = self.load_sxp(args[3])?;
                let env = self.env_or_nil(iid)?;
                let src = self.code.instr(iid).src_idx;
                let res = self.call_rt_val(
                    &builtins::EXTRACT13,
                    &[
                        vec.into(),
                        i1.into(),
                        i2.into(),
                        i3.into(),
                        env.into_pointer_value().into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?;
                self.set_val(iid, res)
            }
            _ => Err(Diagnostic::at_instr("not an extract", iid)),
        }
    }

    fn extract_1d(
        &mut self,
        iid: InstrId,
        args: &[Value],
        shape_preserving: bool,
    ) -> DiagnosticResult<()> {
        let (vec, idx) = (args[0], args[1]);
        let vec_ty = self.type_of(vec);
        let fastcase = if shape_preserving {
            !vec_ty.maybe(fern_pir::BaseKind::List)
                && !vec_ty.maybe_obj()
                && self.vector_type_support(vec)
                && self.scalar_num_index(idx)
        } else {
            self.vector_type_support(vec) && self.scalar_num_index(idx)
        };

        let rep = self.instr_rep(iid);
        let mut res = self.phi_join(rep);
        let mut done = None;

        if fastcase {
            let fallback = self.new_block("ext.fallback");
            let d = self.new_block("ext.done");
            done = Some(d);

            let vector = self.load_val(vec, self.val_rep(vec))?;
            if vector.is_pointer_value() {
                let p = vector.into_pointer_value();
                let hit = self.new_block("ext.notaltrep");
                let alt = self.is_altrep(p)?;
                self.cond_br(alt, fallback, hit, Some(BranchWeight::MostlyFalse))?;
                self.position_at(hit);

                if shape_preserving && vec_ty.maybe_has_attrs() {
                    let hit2 = self.new_block("ext.noattrs");
                    let ok = self.fast_vecelt_ok(p)?;
                    self.cond_br(ok, hit2, fallback, Some(BranchWeight::MostlyTrue))?;
                    self.position_at(hit2);
                }
            }

            let index = self.compute_and_check_index(idx, vector, fallback, None)?;
            let res0 = if vec_ty.is_scalar() {
                vector
            } else {
                self.access_vector(vector.into_pointer_value(), index, &vec_ty)?
            };
            let ty = self.code.instr(iid).ty;
            let v = self.convert(res0, &ty, true)?;
            res.add(v, self.cur_block());
            self.br(d)?;

            self.position_at(fallback);
        }

        let src = self.code.instr(iid).src_idx;
        let slow = if shape_preserving {
            let vector = self.load_sxp(vec)?;
            let index = self.load_sxp(idx)?;
            let env = self.env_or_nil(iid)?;
            self.call_rt_val(
                &builtins::EXTRACT11,
                &[
                    vector.into(),
                    index.into(),
                    env.into_pointer_value().into(),
                    self.c_i32(src as i64).into(),
                ],
            )?
        } else {
            // typed entry points avoid boxing a native index
            let irep = self.val_rep(idx);
            let vector = self.load_sxp(vec)?;
            let env = self.lower_env_operand(iid)?;
            match irep {
                Rep::Int32 => {
                    let i = self.load_val(idx, Rep::Int32)?;
                    self.call_rt_val(
                        &builtins::EXTRACT21_INT,
                        &[
                            vector.into(),
                            i.into(),
                            env.into(),
                            self.c_i32(src as i64).into(),
                        ],
                    )?
                }
                Rep::Float64 => {
                    let i = self.load_val(idx, Rep::Float64)?;
                    self.call_rt_val(
                        &builtins::EXTRACT21_REAL,
                        &[
                            vector.into(),
                            i.into(),
                            env.into(),
                            self.c_i32(src as i64).into(),
                        ],
                    )?
                }
                _ => {
                    let i = self.load_sxp(idx)?;
                    self.call_rt_val(
                        &builtins::EXTRACT21,
                        &[
                            vector.into(),
                            i.into(),
                            env.into(),
                            self.c_i32(src as i64).into(),
                        ],
                    )?
                }
            }
        };
        let ty = self.code.instr(iid).ty;
        let v = self.convert(slow, &ty, true)?;
        res.add(v, self.cur_block());

        if let Some(d) = done {
            self.br(d)?;
            self.position_at(d);
        }
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)
    }

    fn extract_2d(
        &mut self,
        iid: InstrId,
        args: &[Value],
        shape_preserving: bool,
    ) -> DiagnosticResult<()> {
        let (vec, idx1, idx2) = (args[0], args[1], args[2]);
        let vec_ty = self.type_of(vec);
        let fastcase = if shape_preserving {
            !vec_ty.maybe(fern_pir::BaseKind::List)
                && !vec_ty.maybe_obj()
                && self.vector_type_support(vec)
                && self.scalar_num_index(idx1)
                && self.scalar_num_index(idx2)
        } else {
            self.vector_type_support(vec)
                && self.scalar_num_index(idx1)
                && self.scalar_num_index(idx2)
        };

        let rep = self.instr_rep(iid);
        let mut res = self.phi_join(rep);
        let mut done = None;

        if fastcase {
            let fallback = self.new_block("ext2.fallback");
            let d = self.new_block("ext2.done");
            done = Some(d);

            let vector = self.load_val(vec, self.val_rep(vec))?;
            if vector.is_pointer_value() {
                let p = vector.into_pointer_value();
                let hit = self.new_block("ext2.notaltrep");
                let alt = self.is_altrep(p)?;
                self.cond_br(alt, fallback, hit, Some(BranchWeight::MostlyFalse))?;
                self.position_at(hit);

                if shape_preserving && vec_ty.maybe_has_attrs() {
                    let hit2 = self.new_block("ext2.noattrs");
                    let ok = self.fast_vecelt_ok(p)?;
                    self.cond_br(ok, hit2, fallback, Some(BranchWeight::MostlyTrue))?;
                    self.position_at(hit2);
                }
            }

            let (nrow, ncol) = self.matrix_dims(vector)?;
            let index1 = self.compute_and_check_index(idx1, vector, fallback, Some(nrow))?;
            let index2 = self.compute_and_check_index(idx2, vector, fallback, Some(ncol))?;
            let scaled = ir(self.builder.build_int_nsw_mul(nrow, index2, ""))?;
            let index = ir(self.builder.build_int_nsw_add(scaled, index1, ""))?;

            let res0 = if vec_ty.is_scalar() {
                vector
            } else {
                self.access_vector(vector.into_pointer_value(), index, &vec_ty)?
            };
            let ty = self.code.instr(iid).ty;
            let v = self.convert(res0, &ty, true)?;
            res.add(v, self.cur_block());
            self.br(d)?;

            self.position_at(fallback);
        }

        let src = self.code.instr(iid).src_idx;
        let vector = self.load_sxp(vec)?;
        let env = self.lower_env_operand(iid)?;
        let slow = if shape_preserving {
            let i1 = self.load_sxp(idx1)?;
            let i2 = self.load_sxp(idx2)?;
            self.call_rt_val(
                &builtins::EXTRACT12,
                &[
                    vector.into(),
                    i1.into(),
                    i2.into(),
                    env.into(),
                    self.c_i32(src as i64).into(),
                ],
            )?
        } else {
            let irep = self.val_rep(idx1);
            if irep != Rep::Boxed && self.val_rep(idx2) == irep {
                let getter = if irep == Rep::Int32 {
                    &builtins::EXTRACT22_II
                } else {
                    &builtins::EXTRACT22_RR
                };
                let i1 = self.load_val(idx1, irep)?;
                let i2 = self.load_val(idx2, irep)?;
                self.call_rt_val(
                    getter,
                    &[
                        vector.into(),
                        i1.into(),
                        i2.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?
            } else {
                let i1 = self.load_sxp(idx1)?;
                let i2 = self.load_sxp(idx2)?;
                self.call_rt_val(
                    &builtins::EXTRACT22,
                    &[
                        vector.into(),
                        i1.into(),
                        i2.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?
            }
        };
        let ty = self.code.instr(iid).ty;
        let v = self.convert(slow, &ty, true)?;
        res.add(v, self.cur_block());

        if let Some(d) = done {
            self.br(d)?;
            self.position_at(d);
        }
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)
    }

    fn matrix_dims(
        &mut self,
        vector: BasicValueEnum<'ctx>,
    ) -> DiagnosticResult<(inkwell::values::IntValue<'ctx>, inkwell::values::IntValue<'ctx>)> {
        if !vector.is_pointer_value() {
            // an unboxed scalar behaves as a 1x1
            return Ok((self.c_u64(1), self.c_u64(1)));
        }
        let p: BasicMetadataValue = vector.into_pointer_value().into();
        let nrow = self
            .call_rt_val(&builtins::MATRIX_NROWS, &[p])?
            .into_int_value();
        let nrow = ir(self.builder.build_int_z_extend(nrow, self.t_i64, "nrow"))?;
        let ncol = self
            .call_rt_val(&builtins::MATRIX_NCOLS, &[p])?
            .into_int_value();
        let ncol = ir(self.builder.build_int_z_extend(ncol, self.t_i64, "ncol"))?;
        Ok((nrow, ncol))
    }

    pub(crate) fn lower_subassign(
        &mut self,
        iid: InstrId,
        op: &Op,
        args: &[Value],
    ) -> DiagnosticResult<()> {
        match op {
            Op::Subassign1_1D => self.subassign_1d(iid, args, true),
            Op::Subassign2_1D => self.subassign_1d(iid, args, false),
            Op::Subassign2_2D => self.subassign_2_2d(iid, args),
            Op::Subassign1_2D => {
                let vec = self.load_sxp(args[0])?;
                let i1 = self.load_sxp(args[1])?;
                let i2 = self.load_sxp(args[2])?;
                let val = self.load_sxp(args[3])?;
                let env = self.lower_env_operand(iid)?;
                let src = self.code.instr(iid).src_idx;
                let res = self.call_rt_val(
                    &builtins::SUBASSIGN12,
                    &[
                        vec.into(),
                        i1.into(),
                        i2.into(),
                        val.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?;
                self.set_val(iid, res)
            }
            Op::Subassign1_3D => {
                let vec = self.load_sxp(args[0])?;
                let i1 = self.load_sxp(args[1])?;
                let i2 = self.load_sxp(args[2])?;
                let i3 = self.load_sxp(args[3])?;
                let val = self.load_sxp(args[4])?;
                let env = self.lower_env_operand(iid)?;
                let src = self.code.instr(iid).src_idx;
                let res = self.call_rt_val(
                    &builtins::SUBASSIGN13,
                    &[
                        vec.into(),
                        i1.into(),
                        i2.into(),
                        i3.into(),
                        val.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?;
                self.set_val(iid, res)
            }
            _ => Err(Diagnostic::at_instr("not a subassign", iid)),
        }
    }

    /// Uniform fast-path precondition for scalar stores: scalar numeric
    /// index, scalar value of the vector's own element kind, and a
    /// non-object vector.
    fn subassign_fastcase(&self, vec: Value, idx: &[Value], val: Value) -> bool {
        let vec_ty = self.type_of(vec);
        let val_ty = self.type_of(val);
        idx.iter().all(|i| self.scalar_num_index(*i))
            && val_ty.is_scalar()
            && !vec_ty.maybe_obj()
            && ((vec_ty.is_a(&PirType::int()) && val_ty.is_a(&PirType::int()))
                || (vec_ty.is_a(&PirType::real()) && val_ty.is_a(&PirType::real())))
    }

    fn subassign_1d(
        &mut self,
        iid: InstrId,
        args: &[Value],
        shape_preserving: bool,
    ) -> DiagnosticResult<()> {
        let (vec, idx, val) = (args[0], args[1], args[2]);
        let vec_ty = self.type_of(vec);
        let fastcase = self.subassign_fastcase(vec, &args[1..2], val);

        let rep = self.instr_rep(iid);
        let mut res = self.phi_join(rep);
        let mut done = None;

        if fastcase {
            let fallback = self.new_block("sa.fallback");
            let d = self.new_block("sa.done");
            done = Some(d);

            let vector = self.load_val(vec, self.val_rep(vec))?;
            if vector.is_pointer_value() {
                let p = vector.into_pointer_value();
                let hit1 = self.new_block("sa.notaltrep");
                let alt = self.is_altrep(p)?;
                self.cond_br(alt, fallback, hit1, Some(BranchWeight::MostlyFalse))?;
                self.position_at(hit1);

                if shape_preserving && vec_ty.maybe_has_attrs() {
                    let hit2 = self.new_block("sa.noattrs");
                    let ok = self.fast_vecelt_ok(p)?;
                    self.cond_br(ok, hit2, fallback, Some(BranchWeight::MostlyTrue))?;
                    self.position_at(hit2);
                }

                // in-place update needs an unshared vector
                let hit3 = self.new_block("sa.unshared");
                let sh = self.shared(p)?;
                self.cond_br(sh, fallback, hit3, Some(BranchWeight::MostlyFalse))?;
                self.position_at(hit3);
            }

            let index = self.compute_and_check_index(idx, vector, fallback, None)?;
            let v = self.load_val(val, self.val_rep(val))?;
            let ty = self.code.instr(iid).ty;
            if rep == Rep::Boxed {
                self.assign_vector(vector.into_pointer_value(), index, v, &vec_ty)?;
                let out = self.convert(vector, &ty, true)?;
                res.add(out, self.cur_block());
            } else {
                let out = self.convert(v, &ty, true)?;
                res.add(out, self.cur_block());
            }
            self.br(d)?;

            self.position_at(fallback);
        }

        let src = self.code.instr(iid).src_idx;
        let env = self.lower_env_operand(iid)?;
        let slow = if shape_preserving {
            let vs = self.load_sxp(vec)?;
            let is = self.load_sxp(idx)?;
            let val_s = self.load_sxp(val)?;
            self.call_rt_val(
                &builtins::SUBASSIGN11,
                &[
                    vs.into(),
                    is.into(),
                    val_s.into(),
                    env.into(),
                    self.c_i32(src as i64).into(),
                ],
            )?
        } else {
            let irep = self.val_rep(idx);
            let vrep = self.val_rep(val);
            if irep != Rep::Boxed && vrep != Rep::Boxed {
                let setter: &NativeBuiltin = match (irep, vrep) {
                    (Rep::Int32, Rep::Int32) => &builtins::SUBASSIGN21_II,
                    (Rep::Int32, Rep::Float64) => &builtins::SUBASSIGN21_IR,
                    (Rep::Float64, Rep::Int32) => &builtins::SUBASSIGN21_RI,
                    _ => &builtins::SUBASSIGN21_RR,
                };
                let vs = self.load_sxp(vec)?;
                let is = self.load_val(idx, irep)?;
                let vv = self.load_val(val, vrep)?;
                self.call_rt_val(
                    setter,
                    &[
                        vs.into(),
                        is.into(),
                        vv.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?
            } else {
                let vs = self.load_sxp(vec)?;
                let is = self.load_sxp(idx)?;
                let vv = self.load_sxp(val)?;
                self.call_rt_val(
                    &builtins::SUBASSIGN21,
                    &[
                        vs.into(),
                        is.into(),
                        vv.into(),
                        env.into(),
                        self.c_i32(src as i64).into(),
                    ],
                )?
            }
        };
        let ty = self.code.instr(iid).ty;
        let v = self.convert(slow, &ty, true)?;
        res.add(v, self.cur_block());

        if let Some(d) = done {
            self.br(d)?;
            self.position_at(d);
        }
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)
    }

    fn subassign_2_2d(&mut self, iid: InstrId, args: &[Value]) -> DiagnosticResult<()> {
        let (vec, idx1, idx2, val) = (args[0], args[1], args[2], args[3]);
        let vec_ty = self.type_of(vec);
        let fastcase = self.subassign_fastcase(vec, &args[1..3], val);

        let rep = self.instr_rep(iid);
        let mut res = self.phi_join(rep);
        let mut done = None;

        if fastcase {
            let fallback = self.new_block("sa22.fallback");
            let d = self.new_block("sa22.done");
            done = Some(d);

            let vector = self.load_val(vec, self.val_rep(vec))?;
            if vector.is_pointer_value() {
                let p = vector.into_pointer_value();
                let hit = self.new_block("sa22.unshared");
                let sh = self.shared(p)?;
                self.cond_br(sh, fallback, hit, Some(BranchWeight::MostlyFalse))?;
                self.position_at(hit);
            }

            let (nrow, ncol) = self.matrix_dims(vector)?;
            let index1 = self.compute_and_check_index(idx1, vector, fallback, Some(nrow))?;
            let index2 = self.compute_and_check_index(idx2, vector, fallback, Some(ncol))?;

            let v = self.load_val(val, self.val_rep(val))?;
            let ty = self.code.instr(iid).ty;
            if rep == Rep::Boxed {
                let scaled = ir(self.builder.build_int_nsw_mul(nrow, index2, ""))?;
                let index = ir(self.builder.build_int_nsw_add(scaled, index1, ""))?;
                self.assign_vector(vector.into_pointer_value(), index, v, &vec_ty)?;
                let out = self.convert(vector, &ty, true)?;
                res.add(out, self.cur_block());
            } else {
                let out = self.convert(v, &ty, true)?;
                res.add(out, self.cur_block());
            }
            self.br(d)?;

            self.position_at(fallback);
        }

        let src = self.code.instr(iid).src_idx;
        let env = self.lower_env_operand(iid)?;
        let irep = self.val_rep(idx1);
        let vrep = self.val_rep(val);
        let slow = if self.val_rep(idx2) == irep && irep != Rep::Boxed && vrep != Rep::Boxed {
            let setter: &NativeBuiltin = match (irep, vrep) {
                (Rep::Int32, Rep::Int32) => &builtins::SUBASSIGN22_III,
                (Rep::Int32, Rep::Float64) => &builtins::SUBASSIGN22_IIR,
                (Rep::Float64, Rep::Int32) => &builtins::SUBASSIGN22_RRI,
                _ => &builtins::SUBASSIGN22_RRR,
            };
            let vs = self.load_sxp(vec)?;
            let i1 = self.load_val(idx1, irep)?;
            let i2 = self.load_val(idx2, irep)?;
            let vv = self.load_val(val, vrep)?;
            self.call_rt_val(
                setter,
                &[
                    vs.into(),
                    i1.into(),
                    i2.into(),
                    vv.into(),
                    env.into(),
                    self.c_i32(src as i64).into(),
                ],
            )?
        } else {
            let vs = self.load_sxp(vec)?;
            let i1 = self.load_sxp(idx1)?;
            let i2 = self.load_sxp(idx2)?;
            let vv = self.load_sxp(val)?;
            self.call_rt_val(
                &builtins::SUBASSIGN22,
                &[
                    vs.into(),
                    i1.into(),
                    i2.into(),
                    vv.into(),
                    env.into(),
                    self.c_i32(src as i64).into(),
                ],
            )?
        };
        let ty = self.code.instr(iid).ty;
        let v = self.convert(slow, &ty, true)?;
        res.add(v, self.cur_block());

        if let Some(d) = done {
            self.br(d)?;
            self.position_at(d);
        }
        let v = res.build(&self.builder)?;
        self.set_val(iid, v)
    }
}

type BasicMetadataValue<'ctx> = inkwell::values::BasicMetadataValueEnum<'ctx>;
