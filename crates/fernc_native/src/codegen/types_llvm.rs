//! LLVM struct types for the guest heap layout.
//!
//! Built once per lowering and cached on the `LowerFunction`. With opaque
//! pointers every GEP names its pointee type explicitly, so these are the
//! single source of truth for field indices.

use inkwell::context::Context;
use inkwell::types::StructType;
use inkwell::AddressSpace;

use crate::runtime::JMP_BUF_SIZE;

/// Field indices of [`GuestTypes::value`].
pub mod value_field {
    pub const OBJINFO: u32 = 0;
    pub const ATTRIB: u32 = 1;
    pub const CAR: u32 = 4;
    pub const CDR: u32 = 5;
    pub const TAG: u32 = 6;
}

/// Field indices of [`GuestTypes::vector`].
pub mod vector_field {
    pub const LENGTH: u32 = 4;
}

/// Field indices of [`GuestTypes::stack_cell`].
pub mod stack_cell_field {
    pub const VALUE: u32 = 1;
}

/// Field indices of [`GuestTypes::rcntxt`].
pub mod rcntxt_field {
    pub const JMP_BUF: u32 = 2;
}

#[derive(Debug, Clone, Copy)]
pub struct GuestTypes<'ctx> {
    /// A cons-shaped heap cell: objinfo, attributes, two GC links, then
    /// car/cdr/tag.
    pub value: StructType<'ctx>,
    /// A vector heap cell: same four header words, then length and
    /// capacity; element data follows the struct.
    pub vector: StructType<'ctx>,
    /// One node-stack frame cell.
    pub stack_cell: StructType<'ctx>,
    /// The native call context, jump buffer included.
    pub rcntxt: StructType<'ctx>,
    /// Header of a stub environment's payload: magic and local count;
    /// the missing bits and the slot array follow it.
    pub stub_env: StructType<'ctx>,
}

impl<'ctx> GuestTypes<'ctx> {
    pub fn new(context: &'ctx Context) -> Self {
        let i32_t = context.i32_type();
        let i64_t = context.i64_type();
        let ptr = context.ptr_type(AddressSpace::default());

        let value = context.opaque_struct_type("guest.value");
        value.set_body(
            &[
                i64_t.into(), // objinfo
                ptr.into(),   // attrib
                ptr.into(),   // gc next
                ptr.into(),   // gc prev
                ptr.into(),   // car
                ptr.into(),   // cdr
                ptr.into(),   // tag
            ],
            false,
        );

        let vector = context.opaque_struct_type("guest.vector");
        vector.set_body(
            &[
                i64_t.into(), // objinfo
                ptr.into(),   // attrib
                ptr.into(),   // gc next
                ptr.into(),   // gc prev
                i64_t.into(), // length
                i64_t.into(), // capacity
            ],
            false,
        );

        let stack_cell = context.opaque_struct_type("guest.stackcell");
        stack_cell.set_body(&[i64_t.into(), ptr.into()], false);

        let rcntxt = context.opaque_struct_type("guest.context");
        rcntxt.set_body(
            &[
                i64_t.into(),                                      // flags
                ptr.into(),                                        // next context
                context.i8_type().array_type(JMP_BUF_SIZE as u32).into(), // jump buffer
                ptr.into(),                                        // call
                ptr.into(),                                        // cloenv
                ptr.into(),                                        // sysparent
                ptr.into(),                                        // returned value
            ],
            false,
        );

        let stub_env = context.opaque_struct_type("guest.stubenv");
        stub_env.set_body(&[i32_t.into(), i32_t.into()], false);

        GuestTypes {
            value,
            vector,
            stack_cell,
            rcntxt,
            stub_env,
        }
    }
}
