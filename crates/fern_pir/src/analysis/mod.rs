//! Dataflow analyses whose results the native backend consumes.

pub mod liveness;
pub mod refcount;

pub use liveness::Liveness;
pub use refcount::{AdjustKind, RefcountAdjustment};
