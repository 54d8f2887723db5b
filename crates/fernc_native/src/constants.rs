//! Heap-object header layout and backend magic numbers.
//!
//! Every boxed guest value starts with a 64-bit `objinfo` word. The layout
//! mirrors the runtime's header definition and must stay in sync with it:
//!
//! ```text
//! bits 0..5    kind
//! bit  5       scalar
//! bit  6       object
//! bit  7       altrep
//! bit  24      gc mark
//! bit  28      gc generation
//! bits 32..48  named count
//! ```

/// Bits used by the kind field.
pub const KIND_BITS: u32 = 5;
pub const KIND_MASK: u64 = (1 << KIND_BITS) - 1;

pub const SCALAR_BIT: u64 = 1 << KIND_BITS;
pub const OBJECT_BIT: u64 = 1 << (KIND_BITS + 1);
pub const ALTREP_BIT: u64 = 1 << (KIND_BITS + 2);
pub const MARK_BIT: u64 = 1 << (KIND_BITS + 19);
pub const GENERATION_BIT: u64 = 1 << (KIND_BITS + 23);

pub const NAMED_BITS: u32 = 16;
pub const NAMED_SHIFT: u32 = 32;
pub const NAMED_MASK: u64 = ((1u64 << NAMED_BITS) - 1) << NAMED_SHIFT;
/// Saturation point of the named count.
pub const NAMED_MAX: u64 = 7;

/// The integer NA sentinel; Float64 NA is NaN.
pub const NA_INT: i32 = i32::MIN;

/// `1/eps` threshold above which the modulus fast path warns about
/// accuracy loss.
pub const MOD_ACCURACY_LIMIT: f64 = 1.0 / f64::EPSILON;

/// Scratch frame slots reserved for GC-protecting temporaries.
pub const MAX_TEMPS: usize = 4;

/// Heap object kind codes. Shared with the runtime's header definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjKind {
    Nil = 0,
    Sym = 1,
    Pairlist = 2,
    Closure = 3,
    Env = 4,
    Promise = 5,
    Call = 6,
    Special = 7,
    BuiltinFun = 8,
    Char = 9,
    Logical = 10,
    Int = 13,
    Real = 14,
    Complex = 15,
    Str = 16,
    Dots = 17,
    Any = 18,
    List = 19,
    Expr = 20,
    Bytecode = 21,
    ExternalPtr = 22,
    WeakRef = 23,
    Raw = 24,
    /// Runtime-defined external object (stub environments, code objects).
    Native = 25,
}

pub const MAX_NUM_KINDS: u64 = 32;

/// Magic tag stored in the payload of `Native` objects that are lazily
/// materialized environment stubs.
pub const STUB_ENV_MAGIC: u32 = 0xEAC0_0E11;

/// Payload slot indices of a stub environment (before the locals).
pub const STUB_SLOT_MATERIALIZED: i32 = -2;
pub const STUB_SLOT_PARENT: i32 = -1;
pub const STUB_ARG_OFFSET: i32 = 2;
