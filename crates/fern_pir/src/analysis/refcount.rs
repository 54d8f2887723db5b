//! Refcount-adjustment annotations.
//!
//! The optimizer's alias analysis decides where the generated code must
//! bump the named count of a boxed value: either right before a use that
//! may stash the value somewhere (`before_use`) or once at the creation
//! site (`at_creation`). The backend only consumes the result; an empty
//! annotation is always sound (it just forfeits copy elision).

use std::collections::HashMap;

use crate::instr::InstrId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustKind {
    /// Raise NAMED to at least 1.
    EnsureNamed,
    /// Raise NAMED to the shared threshold.
    SetShared,
}

#[derive(Debug, Clone, Default)]
pub struct RefcountAdjustment {
    /// (consuming instruction) -> (operand instruction -> adjustment).
    pub before_use: HashMap<InstrId, HashMap<InstrId, AdjustKind>>,
    /// Adjustment applied right after the value is created.
    pub at_creation: HashMap<InstrId, AdjustKind>,
}
