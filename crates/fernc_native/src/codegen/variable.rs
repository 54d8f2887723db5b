//! Per-SSA-value storage bindings.
//!
//! The allocator decides *whether* a value gets a boxed frame slot; this
//! module decides how each live definition is materialized:
//!
//! - `MutableBoxed` / `ImmutableBoxed`: a GC-scanned frame slot at a fixed
//!   index, addressed through the frame base pointer.
//! - `MutableScalar`: a function-local alloca of the native type.
//! - `ImmutableScalar`: no storage at all; the producing instruction's
//!   LLVM value is the binding.
//!
//! A binding is initialized at most once by `set`; `update` requires prior
//! initialization and mutability. Phis and values crossing a push-context
//! are always mutable so predecessors and restarts can rewrite them.

use inkwell::builder::Builder;
use inkwell::types::BasicTypeEnum;
use inkwell::values::{BasicValueEnum, InstructionValue, PointerValue};

use crate::diagnostics::{Diagnostic, DiagnosticResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    MutableBoxed,
    ImmutableBoxed,
    MutableScalar,
    ImmutableScalar,
}

#[derive(Debug, Clone, Copy)]
pub struct Variable<'ctx> {
    pub kind: VarKind,
    /// Storage pointer; `None` only for `ImmutableScalar`.
    storage: Option<PointerValue<'ctx>>,
    /// The bound value of an initialized `ImmutableScalar`.
    value: Option<BasicValueEnum<'ctx>>,
    /// Pointee type for loads from `storage`.
    ty: BasicTypeEnum<'ctx>,
    pub initialized: bool,
    /// Frame slot index for boxed kinds.
    pub stack_slot: Option<usize>,
}

impl<'ctx> Variable<'ctx> {
    pub fn boxed(
        mutable: bool,
        storage: PointerValue<'ctx>,
        ty: BasicTypeEnum<'ctx>,
        stack_slot: usize,
    ) -> Self {
        Variable {
            kind: if mutable {
                VarKind::MutableBoxed
            } else {
                VarKind::ImmutableBoxed
            },
            storage: Some(storage),
            value: None,
            ty,
            initialized: false,
            stack_slot: Some(stack_slot),
        }
    }

    pub fn mutable_scalar(storage: PointerValue<'ctx>, ty: BasicTypeEnum<'ctx>) -> Self {
        Variable {
            kind: VarKind::MutableScalar,
            storage: Some(storage),
            value: None,
            ty,
            initialized: false,
            stack_slot: None,
        }
    }

    pub fn immutable_scalar(ty: BasicTypeEnum<'ctx>) -> Self {
        Variable {
            kind: VarKind::ImmutableScalar,
            storage: None,
            value: None,
            ty,
            initialized: false,
            stack_slot: None,
        }
    }

    pub fn get(&self, builder: &Builder<'ctx>) -> DiagnosticResult<BasicValueEnum<'ctx>> {
        if !self.initialized {
            return Err(Diagnostic::new("read of uninitialized variable"));
        }
        match self.kind {
            VarKind::ImmutableScalar => self
                .value
                .ok_or_else(|| Diagnostic::new("immutable scalar has no value")),
            _ => {
                let ptr = self
                    .storage
                    .ok_or_else(|| Diagnostic::new("variable has no storage"))?;
                builder
                    .build_load(self.ty, ptr, "")
                    .map_err(|e| Diagnostic::new(format!("load failed: {e}")))
            }
        }
    }

    /// First (and for immutables, only) assignment. Returns the store
    /// instruction when one was emitted.
    pub fn set(
        &mut self,
        builder: &Builder<'ctx>,
        val: BasicValueEnum<'ctx>,
    ) -> DiagnosticResult<Option<InstructionValue<'ctx>>> {
        if self.initialized {
            return Err(Diagnostic::new("variable initialized twice"));
        }
        self.initialized = true;
        match self.kind {
            VarKind::ImmutableScalar => {
                self.value = Some(val);
                Ok(None)
            }
            _ => {
                let ptr = self
                    .storage
                    .ok_or_else(|| Diagnostic::new("variable has no storage"))?;
                let st = builder
                    .build_store(ptr, val)
                    .map_err(|e| Diagnostic::new(format!("store failed: {e}")))?;
                Ok(Some(st))
            }
        }
    }

    /// Rewrite a mutable binding on some later path.
    pub fn update(
        &mut self,
        builder: &Builder<'ctx>,
        val: BasicValueEnum<'ctx>,
    ) -> DiagnosticResult<Option<InstructionValue<'ctx>>> {
        match self.kind {
            VarKind::MutableBoxed | VarKind::MutableScalar => {
                self.initialized = true;
                let ptr = self
                    .storage
                    .ok_or_else(|| Diagnostic::new("variable has no storage"))?;
                let st = builder
                    .build_store(ptr, val)
                    .map_err(|e| Diagnostic::new(format!("store failed: {e}")))?;
                Ok(Some(st))
            }
            _ => Err(Diagnostic::new("update of immutable variable")),
        }
    }

    /// Do `self` and `other` denote the same storage? When they do, a move
    /// between them is a no-op.
    pub fn same_storage(&self, other: &Variable<'ctx>) -> bool {
        if let (Some(a), Some(b)) = (self.stack_slot, other.stack_slot) {
            return a == b;
        }
        match (self.storage, other.storage) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
