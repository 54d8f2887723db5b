//! PIR: the typed SSA intermediate representation consumed by the native
//! lowering backend.
//!
//! The crate is a pure data model plus the dataflow analyses whose results
//! the backend needs. It has no LLVM dependency:
//! - `types` : the type lattice over guest base kinds and approximation flags
//! - `instr` : instructions, operands, effects, feedback origins
//! - `code`  : the CFG arena, constant pool, symbol table
//! - `analysis` : liveness and the refcount-adjustment annotation
//!
//! Instructions reference each other through `InstrId` indices into the
//! owning `Code` arena, and phi edges are `(BlockId, Value)` pairs, so the
//! graph is cycle-safe without interior mutability.

pub mod analysis;
pub mod code;
pub mod instr;
pub mod types;

pub use code::{Block, BlockId, Code, Const, PoolIdx, SymId, SymbolTable, Successors};
pub use instr::{
    Builtin, DeoptReason, Effect, Effects, FeedbackOrigin, FrameInfo, Instr, InstrId, Op, Value,
};
pub use types::{BaseKind, PirType};
