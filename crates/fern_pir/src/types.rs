//! The PIR type lattice.
//!
//! A `PirType` is a set of guest base kinds plus a handful of "maybe" flags
//! approximating runtime properties the optimizer could not rule out. The
//! subtype relation `is_a` is bitwise subset on both words; greatest lower
//! bounds are intersections. The lattice deliberately over-approximates:
//! a value of type `real & scalar & !object` is guaranteed to be a plain
//! one-element real vector without attributes, which is what licenses the
//! backend to unbox it.

/// Guest base kinds, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BaseKind {
    Nil = 1 << 0,
    Logical = 1 << 1,
    Integer = 1 << 2,
    Real = 1 << 3,
    Complex = 1 << 4,
    Str = 1 << 5,
    Raw = 1 << 6,
    /// Generic (heterogeneous) vector.
    List = 1 << 7,
    Expr = 1 << 8,
    Sym = 1 << 9,
    Closure = 1 << 10,
    Special = 1 << 11,
    BuiltinFun = 1 << 12,
    Env = 1 << 13,
    Promise = 1 << 14,
    Dots = 1 << 15,
    ExpandedDots = 1 << 16,
    MissingArg = 1 << 17,
    Unbound = 1 << 18,
    Code = 1 << 19,
    /// The native branch-condition type. Not a guest value kind; always
    /// represented as an Int32 0/1.
    Test = 1 << 20,
}

const FLAG_MAYBE_NA: u8 = 1 << 0;
const FLAG_MAYBE_OBJ: u8 = 1 << 1;
const FLAG_MAYBE_ATTRS: u8 = 1 << 2;
const FLAG_NOT_SCALAR: u8 = 1 << 3;
const FLAG_PROMISE_WRAPPED: u8 = 1 << 4;
const FLAG_LAZY: u8 = 1 << 5;
const FLAG_MAYBE_MISSING: u8 = 1 << 6;

/// A point in the type lattice: base-kind set plus approximation flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PirType {
    kinds: u32,
    flags: u8,
}

impl PirType {
    /// A fresh vector type of the given kinds: possibly NA, possibly an
    /// object, possibly carrying attributes, length unknown.
    pub fn new(kind: BaseKind) -> Self {
        PirType {
            kinds: kind as u32,
            flags: FLAG_MAYBE_NA | FLAG_MAYBE_OBJ | FLAG_MAYBE_ATTRS | FLAG_NOT_SCALAR,
        }
    }

    pub fn bottom() -> Self {
        PirType { kinds: 0, flags: 0 }
    }

    pub fn logical() -> Self {
        Self::new(BaseKind::Logical)
    }
    pub fn int() -> Self {
        Self::new(BaseKind::Integer)
    }
    pub fn real() -> Self {
        Self::new(BaseKind::Real)
    }
    pub fn list() -> Self {
        Self::new(BaseKind::List)
    }
    pub fn closure() -> Self {
        Self::new(BaseKind::Closure)
    }
    pub fn env() -> Self {
        Self::new(BaseKind::Env)
    }
    pub fn dots() -> Self {
        Self::new(BaseKind::Dots)
    }

    /// The branch-condition type: a bare Int32 0/1, nothing else.
    pub fn test() -> Self {
        PirType {
            kinds: BaseKind::Test as u32,
            flags: 0,
        }
    }

    /// int | real, vector shaped.
    pub fn int_real() -> Self {
        Self::int().union(&Self::real())
    }

    /// int | logical | real, vector shaped.
    pub fn num() -> Self {
        Self::int_real().union(&Self::logical())
    }

    /// All vector kinds.
    pub fn vecs() -> Self {
        Self::num()
            .union(&Self::new(BaseKind::Complex))
            .union(&Self::new(BaseKind::Str))
            .union(&Self::new(BaseKind::Raw))
            .union(&Self::list())
            .union(&Self::new(BaseKind::Expr))
    }

    pub fn simple_scalar_int() -> Self {
        Self::int().scalar().not_object().no_attribs()
    }
    pub fn simple_scalar_lgl() -> Self {
        Self::logical().scalar().not_object().no_attribs()
    }
    pub fn simple_scalar_real() -> Self {
        Self::real().scalar().not_object().no_attribs()
    }

    /// Any guest value at all: every kind, every approximation.
    pub fn any() -> Self {
        PirType {
            kinds: u32::MAX,
            flags: u8::MAX,
        }
    }

    // -- refinements ------------------------------------------------------

    pub fn scalar(mut self) -> Self {
        self.flags &= !FLAG_NOT_SCALAR;
        self
    }
    pub fn not_object(mut self) -> Self {
        self.flags &= !FLAG_MAYBE_OBJ;
        self
    }
    pub fn not_na(mut self) -> Self {
        self.flags &= !FLAG_MAYBE_NA;
        self
    }
    pub fn no_attribs(mut self) -> Self {
        self.flags &= !(FLAG_MAYBE_ATTRS | FLAG_MAYBE_OBJ);
        self
    }
    pub fn not_missing(mut self) -> Self {
        self.flags &= !FLAG_MAYBE_MISSING;
        self.kinds &= !(BaseKind::MissingArg as u32);
        self
    }
    pub fn not_promise_wrapped(mut self) -> Self {
        self.flags &= !(FLAG_PROMISE_WRAPPED | FLAG_LAZY);
        self
    }
    pub fn not_lazy(mut self) -> Self {
        self.flags &= !FLAG_LAZY;
        self
    }

    // -- widenings --------------------------------------------------------

    pub fn or_na(mut self) -> Self {
        self.flags |= FLAG_MAYBE_NA;
        self
    }
    pub fn or_object(mut self) -> Self {
        self.flags |= FLAG_MAYBE_OBJ | FLAG_MAYBE_ATTRS;
        self
    }
    pub fn or_attribs(mut self) -> Self {
        self.flags |= FLAG_MAYBE_ATTRS;
        self
    }
    pub fn or_missing(mut self) -> Self {
        self.flags |= FLAG_MAYBE_MISSING;
        self
    }
    pub fn or_promise_wrapped(mut self) -> Self {
        self.flags |= FLAG_PROMISE_WRAPPED;
        self
    }
    pub fn or_lazy(mut self) -> Self {
        self.flags |= FLAG_PROMISE_WRAPPED | FLAG_LAZY;
        self
    }

    pub fn union(&self, other: &PirType) -> PirType {
        PirType {
            kinds: self.kinds | other.kinds,
            flags: self.flags | other.flags,
        }
    }

    // -- queries ----------------------------------------------------------

    pub fn is_a(&self, other: &PirType) -> bool {
        (self.kinds & !other.kinds) == 0 && (self.flags & !other.flags) == 0
    }

    pub fn maybe(&self, kind: BaseKind) -> bool {
        self.kinds & (kind as u32) != 0
    }

    pub fn maybe_na(&self) -> bool {
        self.flags & FLAG_MAYBE_NA != 0
    }
    pub fn maybe_obj(&self) -> bool {
        self.flags & FLAG_MAYBE_OBJ != 0
    }
    pub fn maybe_has_attrs(&self) -> bool {
        self.flags & (FLAG_MAYBE_ATTRS | FLAG_MAYBE_OBJ) != 0
    }
    pub fn is_scalar(&self) -> bool {
        self.flags & FLAG_NOT_SCALAR == 0
    }
    pub fn maybe_promise_wrapped(&self) -> bool {
        self.flags & FLAG_PROMISE_WRAPPED != 0
    }
    pub fn maybe_lazy(&self) -> bool {
        self.flags & FLAG_LAZY != 0
    }
    pub fn maybe_missing(&self) -> bool {
        self.flags & FLAG_MAYBE_MISSING != 0 || self.maybe(BaseKind::MissingArg)
    }

    /// Result type of arithmetic between `self` and `other`, after the
    /// guest's implicit conversion rules. A combined int∪real collapses to
    /// real since the operation would have promoted.
    pub fn merge_with_conversion(&self, other: &PirType) -> PirType {
        let mut t = self.union(other);
        let int = BaseKind::Integer as u32;
        let real = BaseKind::Real as u32;
        if t.kinds & int != 0 && t.kinds & real != 0 {
            t.kinds &= !int;
        }
        let lgl = BaseKind::Logical as u32;
        if t.kinds & lgl != 0 && t.kinds & (int | real) != 0 {
            // logical promotes to the numeric side
            t.kinds &= !lgl;
            if t.kinds & real == 0 {
                t.kinds |= int;
            }
        }
        t
    }
}

impl std::fmt::Debug for PirType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (BaseKind::Nil, "nil"),
            (BaseKind::Logical, "lgl"),
            (BaseKind::Integer, "int"),
            (BaseKind::Real, "real"),
            (BaseKind::Complex, "cplx"),
            (BaseKind::Str, "str"),
            (BaseKind::Raw, "raw"),
            (BaseKind::List, "list"),
            (BaseKind::Expr, "expr"),
            (BaseKind::Sym, "sym"),
            (BaseKind::Closure, "clo"),
            (BaseKind::Special, "special"),
            (BaseKind::BuiltinFun, "blt"),
            (BaseKind::Env, "env"),
            (BaseKind::Promise, "prom"),
            (BaseKind::Dots, "dots"),
            (BaseKind::ExpandedDots, "dots*"),
            (BaseKind::MissingArg, "miss"),
            (BaseKind::Unbound, "unbound"),
            (BaseKind::Code, "code"),
            (BaseKind::Test, "t"),
        ];
        let mut first = true;
        for (k, n) in names {
            if self.kinds & (k as u32) != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", n)?;
                first = false;
            }
        }
        if first {
            write!(f, "bottom")?;
        }
        if self.is_scalar() {
            write!(f, "$")?;
        }
        if self.maybe_na() {
            write!(f, "?na")?;
        }
        if self.maybe_obj() {
            write!(f, "?obj")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_ordering() {
        let scalar_int = PirType::simple_scalar_int();
        assert!(scalar_int.is_a(&PirType::int()));
        assert!(!PirType::int().is_a(&scalar_int));
        assert!(scalar_int.is_a(&PirType::int_real().scalar().not_object()));
    }

    #[test]
    fn combined_int_real_is_not_scalar_int() {
        let both = PirType::int_real().scalar().not_object();
        assert!(!both.is_a(&PirType::int().scalar().not_object()));
        assert!(!both.is_a(&PirType::real().scalar().not_object()));
    }

    #[test]
    fn conversion_merge_promotes() {
        let t = PirType::int()
            .scalar()
            .merge_with_conversion(&PirType::real().scalar());
        assert!(t.maybe(BaseKind::Real));
        assert!(!t.maybe(BaseKind::Integer));
    }
}
