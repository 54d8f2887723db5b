//! The runtime boundary.
//!
//! Two halves:
//!
//! - [`NativeRuntime`] is the injected record of stable addresses the
//!   generated code needs: process-wide mutable state (top-of-stack,
//!   visibility flag, longjmp return slot), eternal singletons, interned
//!   symbols, and builtin function objects. Supplying them as data keeps
//!   the backend free of global state and lets tests fabricate a runtime.
//!
//! - [`builtins`] is the fixed table of external native helpers the
//!   generated code may call. Each entry carries the link-time name and
//!   the typed signature; declarations are added to the module on first
//!   use (see `codegen::runtime_decls`), and the runtime provides the
//!   bodies when the module is materialized.

use fern_pir::SymId;

/// Parameter/return slots of a native builtin, in frame ABI terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    Ptr,
    Int,
    I64,
    Double,
}

/// Name plus typed signature of one external helper.
#[derive(Debug, Clone, Copy)]
pub struct NativeBuiltin {
    pub name: &'static str,
    pub params: &'static [AbiType],
    pub ret: Option<AbiType>,
}

macro_rules! builtin {
    ($id:ident, $name:literal, [$($p:ident),*], $ret:ident) => {
        pub const $id: NativeBuiltin = NativeBuiltin {
            name: $name,
            params: &[$(AbiType::$p),*],
            ret: Some(AbiType::$ret),
        };
    };
    ($id:ident, $name:literal, [$($p:ident),*]) => {
        pub const $id: NativeBuiltin = NativeBuiltin {
            name: $name,
            params: &[$(AbiType::$p),*],
            ret: None,
        };
    };
}

/// The closed set of runtime entry points the generated code calls.
pub mod builtins {
    use super::{AbiType, NativeBuiltin};

    // boxing
    builtin!(BOX_INT, "box_int", [Int], Ptr);
    builtin!(BOX_REAL, "box_real", [Double], Ptr);
    builtin!(BOX_LGL, "box_lgl", [Int], Ptr);
    builtin!(BOX_TST, "box_tst", [Int], Ptr);

    // promises
    builtin!(FORCE_PROMISE, "force_promise", [Ptr], Ptr);
    builtin!(CREATE_PROMISE, "create_promise", [Ptr, Int, Ptr, Ptr], Ptr);

    // calls
    builtin!(CALL, "call", [Ptr, Int, Ptr, Ptr, I64, I64], Ptr);
    builtin!(NAMED_CALL, "named_call", [Ptr, Int, Ptr, Ptr, I64, Ptr, I64], Ptr);
    builtin!(DOTS_CALL, "dots_call", [Ptr, Int, Ptr, Ptr, I64, Ptr, I64], Ptr);
    builtin!(
        NATIVE_CALL_TRAMPOLINE,
        "native_call_trampoline",
        [Ptr, Ptr, Int, Ptr, I64, I64],
        Ptr
    );
    builtin!(CALL_BUILTIN, "call_builtin", [Ptr, Int, Ptr, Ptr, I64], Ptr);

    // environments
    builtin!(CREATE_ENVIRONMENT, "create_environment", [Ptr, Ptr, Int], Ptr);
    builtin!(
        CREATE_STUB_ENVIRONMENT,
        "create_stub_environment",
        [Ptr, Int, Ptr, Int],
        Ptr
    );
    builtin!(MATERIALIZE_ENVIRONMENT, "materialize_environment", [Ptr], Ptr);
    builtin!(CREATE_BINDING_CELL, "create_binding_cell", [Ptr, Ptr, Ptr], Ptr);
    builtin!(
        CREATE_MISSING_BINDING_CELL,
        "create_missing_binding_cell",
        [Ptr, Ptr, Ptr],
        Ptr
    );

    // variable access
    builtin!(LDVAR, "ldvar", [Ptr, Ptr], Ptr);
    builtin!(LDVAR_FOR_UPDATE, "ldvar_for_update", [Ptr, Ptr], Ptr);
    builtin!(LDVAR_CACHE_MISS, "ldvar_cache_miss", [Ptr, Ptr, Ptr], Ptr);
    builtin!(LDFUN, "ldfun", [Ptr, Ptr], Ptr);
    builtin!(STVAR, "stvar", [Ptr, Ptr, Ptr]);
    builtin!(STVAR_INT, "stvar_int", [Ptr, Int, Ptr]);
    builtin!(STARG, "starg", [Ptr, Ptr, Ptr]);
    builtin!(DEFVAR, "defvar", [Ptr, Ptr, Ptr]);
    builtin!(IS_MISSING, "is_missing", [Ptr, Ptr], Int);

    // vector reads
    builtin!(EXTRACT11, "extract11", [Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(EXTRACT12, "extract12", [Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(EXTRACT13, "extract13", [Ptr, Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(EXTRACT21, "extract21", [Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(EXTRACT21_INT, "extract21i", [Ptr, Int, Ptr, Int], Ptr);
    builtin!(EXTRACT21_REAL, "extract21r", [Ptr, Double, Ptr, Int], Ptr);
    builtin!(EXTRACT22, "extract22", [Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(EXTRACT22_II, "extract22ii", [Ptr, Int, Int, Ptr, Int], Ptr);
    builtin!(EXTRACT22_RR, "extract22rr", [Ptr, Double, Double, Ptr, Int], Ptr);

    // vector writes
    builtin!(SUBASSIGN11, "subassign11", [Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(SUBASSIGN12, "subassign12", [Ptr, Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(SUBASSIGN13, "subassign13", [Ptr, Ptr, Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(SUBASSIGN21, "subassign21", [Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(SUBASSIGN21_II, "subassign21ii", [Ptr, Int, Int, Ptr, Int], Ptr);
    builtin!(SUBASSIGN21_IR, "subassign21ir", [Ptr, Int, Double, Ptr, Int], Ptr);
    builtin!(SUBASSIGN21_RI, "subassign21ri", [Ptr, Double, Int, Ptr, Int], Ptr);
    builtin!(SUBASSIGN21_RR, "subassign21rr", [Ptr, Double, Double, Ptr, Int], Ptr);
    builtin!(SUBASSIGN22, "subassign22", [Ptr, Ptr, Ptr, Ptr, Ptr, Int], Ptr);
    builtin!(SUBASSIGN22_III, "subassign22iii", [Ptr, Int, Int, Int, Ptr, Int], Ptr);
    builtin!(SUBASSIGN22_IIR, "subassign22iir", [Ptr, Int, Int, Double, Ptr, Int], Ptr);
    builtin!(SUBASSIGN22_RRI, "subassign22rri", [Ptr, Double, Double, Int, Ptr, Int], Ptr);
    builtin!(
        SUBASSIGN22_RRR,
        "subassign22rrr",
        [Ptr, Double, Double, Double, Ptr, Int],
        Ptr
    );

    // shape and attributes
    builtin!(LENGTH, "length", [Ptr], I64);
    builtin!(XLENGTH, "xlength", [Ptr], I64);
    builtin!(MATRIX_NCOLS, "matrix_ncols", [Ptr], Int);
    builtin!(MATRIX_NROWS, "matrix_nrows", [Ptr], Int);
    builtin!(NAMES, "names", [Ptr], Ptr);
    builtin!(SET_NAMES, "set_names", [Ptr, Ptr], Ptr);
    builtin!(GET_ATTRIB, "get_attrib", [Ptr, Ptr], Ptr);

    // arithmetic slow paths
    builtin!(BINOP, "binop", [Ptr, Ptr, Int], Ptr);
    builtin!(BINOP_ENV, "binop_env", [Ptr, Ptr, Ptr, Int, Int], Ptr);
    builtin!(UNOP, "unop", [Ptr, Int], Ptr);
    builtin!(UNOP_ENV, "unop_env", [Ptr, Ptr, Int, Int], Ptr);
    builtin!(NOT_OP, "not_op", [Ptr], Ptr);
    builtin!(NOT_ENV, "not_env", [Ptr, Ptr, Int], Ptr);

    // the colon family
    builtin!(COLON, "colon", [Int, Int], Ptr);
    builtin!(COLON_CAST_LHS, "colon_cast_lhs", [Ptr], Ptr);
    builtin!(COLON_CAST_RHS, "colon_cast_rhs", [Ptr, Ptr], Ptr);
    builtin!(COLON_INPUT_EFFECTS, "colon_input_effects", [Ptr, Ptr, Int], Int);
    builtin!(FOR_SEQ_SIZE, "for_seq_size", [Ptr], Int);

    // coercions
    builtin!(AS_LOGICAL, "as_logical", [Ptr], Int);
    builtin!(AS_TEST, "as_test", [Ptr], Int);
    builtin!(CHKFUN, "chkfun", [Ptr, Ptr]);

    // deopt
    builtin!(DEOPT, "deopt", [Ptr, Ptr, Ptr, Ptr]);
    builtin!(RECORD_DEOPT, "record_deopt", [Ptr, Ptr]);

    // allocation
    builtin!(CONS_NR, "cons_nr", [Ptr, Ptr], Ptr);
    builtin!(MAKE_VECTOR, "make_vector", [Int, I64], Ptr);
    builtin!(CREATE_CLOSURE, "create_closure", [Ptr, Ptr, Ptr, Ptr], Ptr);

    // call contexts
    builtin!(BEGIN_CLOSURE_CONTEXT, "begin_closure_context", [Ptr, Ptr, Ptr, Ptr]);
    builtin!(END_CLOSURE_CONTEXT, "end_closure_context", [Ptr, Ptr]);
    builtin!(EXTERNAL_SET_ENTRY, "external_set_entry", [Ptr, Int, Ptr]);

    // errors and heap edges
    builtin!(ERROR, "error", [Ptr]);
    builtin!(WARN, "warn", [Ptr]);
    builtin!(ASSERT_FAIL, "assert_fail", [Ptr]);
    builtin!(SET_CAR, "set_car", [Ptr, Ptr]);
    builtin!(SET_CDR, "set_cdr", [Ptr, Ptr]);
    builtin!(SET_TAG, "set_tag", [Ptr, Ptr]);

    // typed reductions
    builtin!(SUM_REAL, "sum_real", [Ptr], Double);
    builtin!(PROD_REAL, "prod_real", [Ptr], Double);
}

/// The setjmp entry point the push-context lowering calls. glibc hides
/// `sigsetjmp` behind a macro over `__sigsetjmp`; Darwin exports it
/// directly.
pub const SETJMP_NAME: &str = if cfg!(target_os = "macos") {
    "sigsetjmp"
} else {
    "__sigsetjmp"
};

/// Byte size of the jump buffer embedded in a native call context.
pub const JMP_BUF_SIZE: usize = std::mem::size_of::<libc::sigjmp_buf>();

/// Stable addresses of runtime state and objects, supplied once per
/// compilation. The generated code embeds them as int-to-pointer
/// constants; nothing here is ever dereferenced at compile time.
#[derive(Debug, Clone)]
pub struct NativeRuntime {
    /// Address of the node-stack top pointer.
    pub stack_top_addr: usize,
    /// Address of the interpreter visibility flag.
    pub visible_addr: usize,
    /// Address of the slot a non-local return leaves its value in.
    pub returned_value_addr: usize,
    /// Address of the cell holding the constant-pool vector.
    pub constant_pool_addr: usize,
    /// The restart sentinel object a restart-longjmp returns.
    pub restart_token_addr: usize,

    // eternal singletons
    pub true_addr: usize,
    pub false_addr: usize,
    pub nil_addr: usize,
    pub missing_addr: usize,
    pub unbound_addr: usize,
    pub na_logical_addr: usize,
    pub global_env_addr: usize,
    pub base_env_addr: usize,

    /// The `dim` attribute symbol, needed by the fast-vector-element guard.
    pub dim_sym_addr: usize,
    /// The `...` symbol.
    pub dots_sym_addr: usize,

    symbols: Vec<usize>,
    builtin_objs: Vec<usize>,
}

impl NativeRuntime {
    pub fn new(
        stack_top_addr: usize,
        visible_addr: usize,
        returned_value_addr: usize,
        constant_pool_addr: usize,
        restart_token_addr: usize,
        singletons: [usize; 8],
        dim_sym_addr: usize,
        dots_sym_addr: usize,
        symbols: Vec<usize>,
        builtin_objs: Vec<usize>,
    ) -> Self {
        let [true_addr, false_addr, nil_addr, missing_addr, unbound_addr, na_logical_addr, global_env_addr, base_env_addr] =
            singletons;
        NativeRuntime {
            stack_top_addr,
            visible_addr,
            returned_value_addr,
            constant_pool_addr,
            restart_token_addr,
            true_addr,
            false_addr,
            nil_addr,
            missing_addr,
            unbound_addr,
            na_logical_addr,
            global_env_addr,
            base_env_addr,
            dim_sym_addr,
            dots_sym_addr,
            symbols,
            builtin_objs,
        }
    }

    pub fn symbol_addr(&self, sym: SymId) -> Option<usize> {
        self.symbols.get(sym.0 as usize).copied()
    }

    pub fn builtin_addr(&self, id: u32) -> Option<usize> {
        self.builtin_objs.get(id as usize).copied()
    }

    /// A fabricated runtime for tests: every address is a distinct,
    /// pointer-aligned, non-null value. Generated code referencing these
    /// can be inspected but never executed.
    pub fn fixture(num_symbols: usize) -> Self {
        let mut next = 0x10_0000usize;
        let mut fresh = || {
            next += 64;
            next
        };
        let singletons = [
            fresh(),
            fresh(),
            fresh(),
            fresh(),
            fresh(),
            fresh(),
            fresh(),
            fresh(),
        ];
        let stack_top = fresh();
        let visible = fresh();
        let returned = fresh();
        let pool = fresh();
        let restart = fresh();
        let dim = fresh();
        let dots = fresh();
        let symbols = (0..num_symbols).map(|_| fresh()).collect();
        let builtin_objs = (0..64).map(|_| fresh()).collect();
        NativeRuntime::new(
            stack_top, visible, returned, pool, restart, singletons, dim, dots, symbols,
            builtin_objs,
        )
    }
}
