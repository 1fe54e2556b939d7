//! Class descriptors.
//!
//! Trailing objects, in ABI order:
//!
//! 1. generic context (`IS_GENERIC`)
//! 2. resilient superclass
//! 3. foreign or singleton metadata initialization
//! 4. v-table header + method descriptors
//! 5. override table header + override descriptors
//! 6. Objective-C resilient class stub
//! 7. canonical metadata prespecializations, their accessors, caching token
//! 8. invertible protocol set
//! 9. singleton metadata pointer
//! 10. default override table header + descriptors

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::context::{ContextDescriptor, RelativeContextPointer, RelativeOffset};
use super::cursor::{decode_trailing, TrailingBlock, TrailingCursor};
use super::flags::{ExtraClassFlags, MethodDescriptorFlags, TypeContextFlags};
use super::generic::GenericContext;
use super::mangled::MangledName;
use super::types::{
    foreign_initialization_block, invertible_protocols_block, prespecializations_block,
    singleton_initialization_block, singleton_pointer_block, type_context_descriptor,
    TypeContextDescriptor, TypeTrailing,
};
use super::ContextDescriptorWrapper;
use crate::error::Result;
use crate::layout::{locatable, Located};
use crate::pointer::{RelativeDirectPointer, RelativeIndirectablePointer};
use crate::reading::{Address, ReadingContext};
use crate::symbol::SymbolOrElement;

// =============================================================================
// Layouts
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ClassDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
    pub access_function: i32,
    pub fields: i32,
    /// Relative pointer to the superclass's mangled name
    pub superclass_type: i32,
    pub metadata_negative_size_in_words_or_resilient_metadata_bounds: u32,
    pub metadata_positive_size_in_words_or_extra_class_flags: u32,
    pub num_immediate_members: u32,
    pub num_fields: u32,
    pub field_offset_vector_offset: u32,
}
locatable!(ClassDescriptorLayout, 44);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct VTableDescriptorHeader {
    /// Offset of the v-table in the class metadata, in words
    pub vtable_offset: u32,
    pub vtable_size: u32,
}
locatable!(VTableDescriptorHeader, 8);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MethodDescriptor {
    pub flags: u32,
    /// Relative pointer to the implementation
    pub implementation: i32,
}
locatable!(MethodDescriptor, 8);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OverrideTableHeader {
    pub num_entries: u32,
}
locatable!(OverrideTableHeader, 4);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MethodOverrideDescriptor {
    /// Indirectable pointer to the class declaring the overridden method
    pub class: i32,
    /// Indirectable pointer to the overridden method descriptor
    pub method: i32,
    /// Relative pointer to the overriding implementation
    pub implementation: i32,
}
locatable!(MethodOverrideDescriptor, 12);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MethodDefaultOverrideDescriptor {
    pub replacement: i32,
    pub original: i32,
    pub implementation: i32,
}
locatable!(MethodDefaultOverrideDescriptor, 12);

impl<A: Address> Located<MethodDescriptor, A> {
    pub fn flags(&self) -> MethodDescriptorFlags {
        MethodDescriptorFlags::from_bits_retain(self.layout.flags)
    }

    /// Address of the implementation; `None` for abstract entries.
    pub fn implementation(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.layout.implementation);
        (!pointer.is_null())
            .then(|| pointer.target(self.field_address(offset_of!(MethodDescriptor, implementation))))
    }
}

impl<A: Address> Located<MethodOverrideDescriptor, A> {
    /// The class that declares the overridden method.
    pub fn class<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<SymbolOrElement<ContextDescriptorWrapper<A>>>> {
        RelativeContextPointer::<A>::new(self.layout.class).resolve_optional(
            ctx,
            self.field_address(offset_of!(MethodOverrideDescriptor, class)),
        )
    }

    /// The overridden method descriptor, or the symbol it is bound to.
    pub fn method<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<SymbolOrElement<A>>> {
        let pointer = RelativeIndirectablePointer::<()>::new(self.layout.method);
        if pointer.is_null() {
            return Ok(None);
        }
        pointer
            .resolve_address(ctx, self.field_address(offset_of!(MethodOverrideDescriptor, method)))
            .map(Some)
    }

    /// Address of the overriding implementation.
    pub fn implementation(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.layout.implementation);
        (!pointer.is_null()).then(|| {
            pointer.target(self.field_address(offset_of!(MethodOverrideDescriptor, implementation)))
        })
    }
}

// =============================================================================
// Class Descriptor
// =============================================================================

/// A class descriptor with its trailing objects.
#[derive(Debug, Clone)]
pub struct ClassDescriptor<A> {
    pub header: Located<ClassDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    pub resilient_superclass: Option<Located<RelativeOffset, A>>,
    pub vtable_header: Option<Located<VTableDescriptorHeader, A>>,
    pub methods: Vec<Located<MethodDescriptor, A>>,
    pub override_table_header: Option<Located<OverrideTableHeader, A>>,
    pub overrides: Vec<Located<MethodOverrideDescriptor, A>>,
    pub objc_resilient_class_stub: Option<Located<RelativeOffset, A>>,
    pub default_override_table_header: Option<Located<OverrideTableHeader, A>>,
    pub default_overrides: Vec<Located<MethodDefaultOverrideDescriptor, A>>,
    pub trailing: TypeTrailing<A>,
    pub size: usize,
}

type_context_descriptor!(ClassDescriptor, true);

/// A class descriptor read through `C`.
type ClassIn<C> = ClassDescriptor<<C as ReadingContext>::Address>;

fn class_blocks<C: ReadingContext>() -> [TrailingBlock<ClassIn<C>, C>; 10] {
    [
        TrailingBlock {
            name: "resilient superclass",
            present: |d: &ClassIn<C>| d.has_resilient_superclass(),
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ClassIn<C>| {
                d.resilient_superclass = Some(cursor.take_located(ctx)?);
                Ok(())
            },
        },
        foreign_initialization_block(),
        singleton_initialization_block(),
        TrailingBlock {
            name: "vtable",
            present: |d: &ClassIn<C>| d.type_flags().contains(TypeContextFlags::CLASS_HAS_VTABLE),
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ClassIn<C>| {
                let header: Located<VTableDescriptorHeader, _> = cursor.take_located(ctx)?;
                d.methods = cursor.take_located_array(ctx, header.vtable_size as usize)?;
                d.vtable_header = Some(header);
                Ok(())
            },
        },
        TrailingBlock {
            name: "override table",
            present: |d: &ClassIn<C>| {
                d.type_flags().contains(TypeContextFlags::CLASS_HAS_OVERRIDE_TABLE)
            },
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ClassIn<C>| {
                let header: Located<OverrideTableHeader, _> = cursor.take_located(ctx)?;
                d.overrides = cursor.take_located_array(ctx, header.num_entries as usize)?;
                d.override_table_header = Some(header);
                Ok(())
            },
        },
        TrailingBlock {
            name: "objc resilient class stub",
            present: |d: &ClassIn<C>| d.has_objc_resilient_class_stub(),
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ClassIn<C>| {
                d.objc_resilient_class_stub = Some(cursor.take_located(ctx)?);
                Ok(())
            },
        },
        prespecializations_block(),
        invertible_protocols_block(),
        singleton_pointer_block(),
        TrailingBlock {
            name: "default override table",
            present: |d: &ClassIn<C>| {
                d.type_flags()
                    .contains(TypeContextFlags::CLASS_HAS_DEFAULT_OVERRIDE_TABLE)
            },
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ClassIn<C>| {
                cursor.align(4);
                let header: Located<OverrideTableHeader, _> = cursor.take_located(ctx)?;
                d.default_overrides = cursor.take_located_array(ctx, header.num_entries as usize)?;
                d.default_override_table_header = Some(header);
                Ok(())
            },
        },
    ]
}

impl<A: Address> ClassDescriptor<A> {
    /// Decodes the class descriptor at `at` with all trailing objects.
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ClassDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let mut descriptor = Self {
            header,
            generic_context: None,
            resilient_superclass: None,
            vtable_header: None,
            methods: Vec::new(),
            override_table_header: None,
            overrides: Vec::new(),
            objc_resilient_class_stub: None,
            default_override_table_header: None,
            default_overrides: Vec::new(),
            trailing: TypeTrailing::default(),
            size: 0,
        };
        if descriptor.flags().is_generic() {
            descriptor.generic_context = Some(GenericContext::decode(ctx, &mut cursor, true)?);
        }
        decode_trailing(ctx, &mut cursor, &mut descriptor, &class_blocks::<C>())?;
        descriptor.size = cursor.consumed();
        Ok(descriptor)
    }

    pub fn has_resilient_superclass(&self) -> bool {
        self.type_flags()
            .contains(TypeContextFlags::CLASS_HAS_RESILIENT_SUPERCLASS)
    }

    pub fn has_objc_resilient_class_stub(&self) -> bool {
        self.has_resilient_superclass()
            && ExtraClassFlags::from_bits_retain(
                self.header.metadata_positive_size_in_words_or_extra_class_flags,
            )
            .contains(ExtraClassFlags::HAS_OBJC_RESILIENT_CLASS_STUB)
    }

    pub fn is_actor(&self) -> bool {
        self.type_flags().contains(TypeContextFlags::CLASS_IS_ACTOR)
    }

    pub fn are_immediate_members_negative(&self) -> bool {
        self.type_flags()
            .contains(TypeContextFlags::CLASS_ARE_IMMEDIATE_MEMBERS_NEGATIVE)
    }

    pub fn num_fields(&self) -> u32 {
        self.header.num_fields
    }

    /// Mangled name of the superclass, `None` for root classes.
    pub fn superclass_type<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.superclass_type).resolve_optional(
            ctx,
            self.header
                .field_address(offset_of!(ClassDescriptorLayout, superclass_type)),
        )
    }

    /// Number of v-table entries.
    pub fn vtable_size(&self) -> usize {
        self.methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{BufferContext, FixupTables};

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn class_flags(kind_specific: TypeContextFlags) -> u32 {
        16 | 0x40 | ((kind_specific.bits() as u32) << 16)
    }

    #[test]
    fn test_vtable_and_override_table_in_order() {
        let mut data = vec![0u8; 0x200];
        let flags = class_flags(
            TypeContextFlags::CLASS_HAS_VTABLE | TypeContextFlags::CLASS_HAS_OVERRIDE_TABLE,
        );
        put(
            &mut data,
            0x40,
            &ClassDescriptorLayout {
                flags,
                name: 0x180 - 0x48,
                superclass_type: 0x190 - 0x54,
                ..Default::default()
            },
        );
        // vtable at 0x6C: header + 2 methods
        put(
            &mut data,
            0x6C,
            &VTableDescriptorHeader {
                vtable_offset: 10,
                vtable_size: 2,
            },
        );
        put(
            &mut data,
            0x74,
            &MethodDescriptor {
                flags: 0x10,
                implementation: 0x100 - 0x78,
            },
        );
        put(&mut data, 0x7C, &MethodDescriptor::default());
        // override table at 0x84: header + 1 entry
        put(&mut data, 0x84, &OverrideTableHeader { num_entries: 1 });
        put(
            &mut data,
            0x88,
            &MethodOverrideDescriptor {
                class: 0,
                method: (0xF0 - 0x8C) | 1,
                implementation: 0x110 - 0x90,
            },
        );
        data[0x180..0x184].copy_from_slice(b"Cat\0");
        data[0x190..0x19A].copy_from_slice(b"4main3AnyC");

        let mut fixups = FixupTables::new();
        fixups.insert_bind(0xF0, "_$s4main6AnimalC5speakyyFTq");
        let ctx = BufferContext::new(data).with_fixups(fixups);

        let class = ClassDescriptor::decode(&ctx, 0x40).unwrap();
        assert_eq!(class.name(&ctx).unwrap(), "Cat");
        assert_eq!(
            class.superclass_type(&ctx).unwrap().unwrap().as_plain_str(),
            Some("4main3AnyC")
        );

        assert_eq!(class.vtable_header.unwrap().vtable_offset, 10);
        assert_eq!(class.vtable_size(), 2);
        assert_eq!(class.methods[0].address, 0x74);
        assert!(class.methods[0].flags().contains(MethodDescriptorFlags::IS_INSTANCE));
        assert_eq!(class.methods[0].implementation(), Some(0x100));
        assert_eq!(class.methods[1].implementation(), None);

        assert_eq!(class.overrides.len(), 1);
        let entry = &class.overrides[0];
        assert_eq!(entry.address, 0x88);
        assert!(entry.class(&ctx).unwrap().is_none());
        assert!(entry.method(&ctx).unwrap().unwrap().is_symbol());
        assert_eq!(entry.implementation(), Some(0x110));

        assert_eq!(class.actual_size(), 44 + 8 + 16 + 4 + 12);
    }

    #[test]
    fn test_resilient_superclass_and_stub() {
        let mut data = vec![0u8; 0x100];
        let flags = class_flags(TypeContextFlags::CLASS_HAS_RESILIENT_SUPERCLASS);
        put(
            &mut data,
            0,
            &ClassDescriptorLayout {
                flags,
                metadata_positive_size_in_words_or_extra_class_flags: 1,
                ..Default::default()
            },
        );
        put(&mut data, 44, &RelativeOffset { offset: 0x20 });
        put(&mut data, 48, &RelativeOffset { offset: 0x30 });
        let ctx = BufferContext::new(data);

        let class = ClassDescriptor::decode(&ctx, 0).unwrap();
        assert!(class.has_objc_resilient_class_stub());
        assert_eq!(class.resilient_superclass.unwrap().target(), 44 + 0x20);
        assert_eq!(class.objc_resilient_class_stub.unwrap().target(), 48 + 0x30);
        assert!(class.methods.is_empty());
        assert_eq!(class.actual_size(), 52);
    }

    #[test]
    fn test_truncated_vtable() {
        let mut data = vec![0u8; 0x40];
        put(
            &mut data,
            0,
            &ClassDescriptorLayout {
                flags: class_flags(TypeContextFlags::CLASS_HAS_VTABLE),
                ..Default::default()
            },
        );
        put(
            &mut data,
            44,
            &VTableDescriptorHeader {
                vtable_offset: 0,
                vtable_size: 1000,
            },
        );
        let ctx = BufferContext::new(data);
        assert!(ClassDescriptor::decode(&ctx, 0).is_err());
    }
}
