//! Runtime builtin declarations and call emission.
//!
//! Builtins are declared in the module by name, without bodies; the
//! runtime resolves them when the module is materialized. Declarations
//! are idempotent and cached, so every call site of the same helper
//! shares one `FunctionValue` with a consistent ABI.

use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, CallSiteValue, FunctionValue};

use crate::codegen::{ir, LowerFunction};
use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::runtime::{AbiType, NativeBuiltin, SETJMP_NAME};

impl<'ctx, 'a> LowerFunction<'ctx, 'a> {
    fn abi_type(&self, t: AbiType) -> BasicTypeEnum<'ctx> {
        match t {
            AbiType::Ptr => self.t_ptr.into(),
            AbiType::Int => self.t_i32.into(),
            AbiType::I64 => self.t_i64.into(),
            AbiType::Double => self.t_f64.into(),
        }
    }

    /// Declare `builtin` if this module has not seen it yet.
    pub fn declare_builtin(&mut self, builtin: &NativeBuiltin) -> FunctionValue<'ctx> {
        if let Some(f) = self.declared.get(builtin.name) {
            return *f;
        }
        if let Some(f) = self.module.get_function(builtin.name) {
            self.declared.insert(builtin.name, f);
            return f;
        }
        let params: Vec<BasicMetadataTypeEnum<'ctx>> = builtin
            .params
            .iter()
            .map(|p| self.abi_type(*p).into())
            .collect();
        let fn_ty = match builtin.ret {
            Some(r) => self.abi_type(r).fn_type(&params, false),
            None => self.context.void_type().fn_type(&params, false),
        };
        let f = self.module.add_function(builtin.name, fn_ty, None);
        self.declared.insert(builtin.name, f);
        f
    }

    /// Call a runtime builtin, returning its value for non-void entries.
    pub fn call_rt(
        &mut self,
        builtin: &NativeBuiltin,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> DiagnosticResult<Option<BasicValueEnum<'ctx>>> {
        let f = self.declare_builtin(builtin);
        let cs = ir(self.builder.build_call(f, args, builtin.name))?;
        Ok(match cs.try_as_basic_value() {
            either::Either::Left(v) => Some(v),
            either::Either::Right(_) => None,
        })
    }

    /// Call a value-returning builtin.
    pub fn call_rt_val(
        &mut self,
        builtin: &NativeBuiltin,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        self.call_rt(builtin, args)?.ok_or_else(|| {
            Diagnostic::new(format!("builtin {} returns no value", builtin.name))
        })
    }

    /// Like `call_rt`, but hands back the call site (deopt needs to mark
    /// the call as a tail call).
    pub fn call_rt_site(
        &mut self,
        builtin: &NativeBuiltin,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> DiagnosticResult<CallSiteValue<'ctx>> {
        let f = self.declare_builtin(builtin);
        ir(self.builder.build_call(f, args, builtin.name))
    }

    /// The platform's sigsetjmp entry point: `i32 (ptr, i32)`.
    pub fn declare_setjmp(&mut self) -> FunctionValue<'ctx> {
        if let Some(f) = self.module.get_function(SETJMP_NAME) {
            return f;
        }
        let fn_ty = self
            .t_i32
            .fn_type(&[self.t_ptr.into(), self.t_i32.into()], false);
        self.module.add_function(SETJMP_NAME, fn_ty, None)
    }

    /// Declare an LLVM math intrinsic by its mangled name.
    pub fn declare_intrinsic(&mut self, name: &'static str) -> FunctionValue<'ctx> {
        if let Some(f) = self.module.get_function(name) {
            return f;
        }
        let f64_t = self.t_f64;
        let fn_ty = match name {
            "llvm.powi.f64.i32" => f64_t.fn_type(&[f64_t.into(), self.t_i32.into()], false),
            "llvm.pow.f64" => f64_t.fn_type(&[f64_t.into(), f64_t.into()], false),
            // sqrt, floor, fabs
            _ => f64_t.fn_type(&[f64_t.into()], false),
        };
        self.module.add_function(name, fn_ty, None)
    }

    pub fn call_intrinsic(
        &mut self,
        name: &'static str,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        let f = self.declare_intrinsic(name);
        let cs = ir(self.builder.build_call(f, args, "intrinsic"))?;
        match cs.try_as_basic_value() {
            either::Either::Left(v) => Ok(v),
            either::Either::Right(_) => Err(Diagnostic::new("intrinsic returned void")),
        }
    }
}
