//! Nominal type descriptors: the parts shared by classes, structs and enums,
//! and the struct and enum kinds.

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::context::{ContextDescriptor, RelativeOffset};
use super::cursor::{decode_trailing, TrailingBlock, TrailingCursor};
use super::field::FieldDescriptor;
use super::flags::{MetadataInitialization, TypeContextFlags};
use super::generic::GenericContext;
use crate::error::Result;
use crate::layout::{locatable, Located};
use crate::pointer::RelativeDirectPointer;
use crate::reading::{Address, ReadingContext};

// =============================================================================
// Shared Layouts
// =============================================================================

/// Fields shared by every type descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TypeContextDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
    /// Relative pointer to the metadata access function
    pub access_function: i32,
    /// Relative pointer to the field descriptor
    pub fields: i32,
}
locatable!(TypeContextDescriptorLayout, 20);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SingletonMetadataInitialization {
    pub initialization_cache: i32,
    pub incomplete_metadata_or_resilient_pattern: i32,
    pub completion_function: i32,
}
locatable!(SingletonMetadataInitialization, 12);

/// Trailing objects every type kind may carry.
#[derive(Debug, Clone)]
pub struct TypeTrailing<A> {
    /// Completion function of foreign metadata
    pub foreign_metadata_initialization: Option<Located<RelativeOffset, A>>,
    pub singleton_metadata_initialization: Option<Located<SingletonMetadataInitialization, A>>,
    pub canonical_metadata_prespecializations: Vec<Located<RelativeOffset, A>>,
    /// Classes only: one accessor per prespecialization
    pub canonical_metadata_accessors: Vec<Located<RelativeOffset, A>>,
    pub canonical_metadata_caching_token: Option<Located<RelativeOffset, A>>,
    pub invertible_protocols: Option<u16>,
    pub singleton_metadata_pointer: Option<Located<RelativeOffset, A>>,
}

impl<A> Default for TypeTrailing<A> {
    fn default() -> Self {
        Self {
            foreign_metadata_initialization: None,
            singleton_metadata_initialization: None,
            canonical_metadata_prespecializations: Vec::new(),
            canonical_metadata_accessors: Vec::new(),
            canonical_metadata_caching_token: None,
            invertible_protocols: None,
            singleton_metadata_pointer: None,
        }
    }
}

// =============================================================================
// Type Context Descriptor
// =============================================================================

/// Operations shared by class, struct and enum descriptors.
pub trait TypeContextDescriptor<A: Address>: ContextDescriptor<A> {
    /// The shared leading fields.
    fn type_layout(&self) -> TypeContextDescriptorLayout;

    /// Trailing objects shared by every type kind.
    fn type_trailing(&self) -> &TypeTrailing<A>;

    /// Mutable access for the decoder.
    fn type_trailing_mut(&mut self) -> &mut TypeTrailing<A>;

    /// Classes list an accessor per canonical prespecialization.
    const HAS_PRESPECIALIZATION_ACCESSORS: bool = false;

    fn type_flags(&self) -> TypeContextFlags {
        self.flags().type_flags()
    }

    /// The type's unqualified name.
    fn name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        RelativeDirectPointer::<String>::new(self.type_layout().name).resolve(
            ctx,
            self.address()
                .advanced(offset_of!(TypeContextDescriptorLayout, name)),
        )
    }

    /// Address of the metadata access function.
    fn access_function(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.type_layout().access_function);
        (!pointer.is_null()).then(|| {
            pointer.target(
                self.address()
                    .advanced(offset_of!(TypeContextDescriptorLayout, access_function)),
            )
        })
    }

    /// The field descriptor, when the type has one.
    fn field_descriptor<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<FieldDescriptor<A>>> {
        RelativeDirectPointer::<FieldDescriptor<A>>::new(self.type_layout().fields)
            .resolve_optional(
                ctx,
                self.address()
                    .advanced(offset_of!(TypeContextDescriptorLayout, fields)),
            )
    }
}

/// Implements [`TypeContextDescriptor`] for a descriptor struct holding
/// `header`, `trailing` and `size`.
macro_rules! type_context_descriptor {
    ($ty:ident $(, $accessors:expr)?) => {
        $crate::descriptor::context::context_descriptor!($ty);

        impl<A: $crate::reading::Address> $crate::descriptor::TypeContextDescriptor<A> for $ty<A> {
            $(const HAS_PRESPECIALIZATION_ACCESSORS: bool = $accessors;)?

            #[inline]
            fn type_layout(&self) -> $crate::descriptor::TypeContextDescriptorLayout {
                $crate::descriptor::TypeContextDescriptorLayout {
                    flags: self.header.flags,
                    parent: self.header.parent,
                    name: self.header.name,
                    access_function: self.header.access_function,
                    fields: self.header.fields,
                }
            }

            #[inline]
            fn type_trailing(&self) -> &$crate::descriptor::TypeTrailing<A> {
                &self.trailing
            }

            #[inline]
            fn type_trailing_mut(&mut self) -> &mut $crate::descriptor::TypeTrailing<A> {
                &mut self.trailing
            }
        }
    };
}

pub(crate) use type_context_descriptor;

// =============================================================================
// Shared Trailing Blocks
// =============================================================================

/// Foreign metadata initialization.
pub(crate) fn foreign_initialization_block<C, D>() -> TrailingBlock<D, C>
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    TrailingBlock {
        name: "foreign metadata initialization",
        present: |d: &D| d.type_flags().metadata_initialization() == MetadataInitialization::Foreign,
        decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut D| {
            d.type_trailing_mut().foreign_metadata_initialization = Some(cursor.take_located(ctx)?);
            Ok(())
        },
    }
}

/// Singleton metadata initialization.
pub(crate) fn singleton_initialization_block<C, D>() -> TrailingBlock<D, C>
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    TrailingBlock {
        name: "singleton metadata initialization",
        present: |d: &D| {
            d.type_flags().metadata_initialization() == MetadataInitialization::Singleton
        },
        decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut D| {
            d.type_trailing_mut().singleton_metadata_initialization =
                Some(cursor.take_located(ctx)?);
            Ok(())
        },
    }
}

/// Canonical metadata prespecializations: count, entries, class accessors,
/// caching token. Generic types only.
pub(crate) fn prespecializations_block<C, D>() -> TrailingBlock<D, C>
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    TrailingBlock {
        name: "canonical metadata prespecializations",
        present: |d: &D| {
            d.flags().is_generic() && d.type_flags().has_prespecializations_or_singleton_pointer()
        },
        decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut D| {
            let count = cursor.take::<_, u32>(ctx)? as usize;
            let entries = cursor.take_located_array(ctx, count)?;
            let accessors = if D::HAS_PRESPECIALIZATION_ACCESSORS {
                cursor.take_located_array(ctx, count)?
            } else {
                Vec::new()
            };
            let token = cursor.take_located(ctx)?;

            let trailing = d.type_trailing_mut();
            trailing.canonical_metadata_prespecializations = entries;
            trailing.canonical_metadata_accessors = accessors;
            trailing.canonical_metadata_caching_token = Some(token);
            Ok(())
        },
    }
}

/// Invertible protocol set.
pub(crate) fn invertible_protocols_block<C, D>() -> TrailingBlock<D, C>
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    TrailingBlock {
        name: "invertible protocols",
        present: |d: &D| d.flags().has_invertible_protocols(),
        decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut D| {
            d.type_trailing_mut().invertible_protocols = Some(cursor.take(ctx)?);
            Ok(())
        },
    }
}

/// Singleton metadata pointer. Non-generic types only.
pub(crate) fn singleton_pointer_block<C, D>() -> TrailingBlock<D, C>
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    TrailingBlock {
        name: "singleton metadata pointer",
        present: |d: &D| {
            !d.flags().is_generic() && d.type_flags().has_prespecializations_or_singleton_pointer()
        },
        decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut D| {
            cursor.align(4);
            d.type_trailing_mut().singleton_metadata_pointer = Some(cursor.take_located(ctx)?);
            Ok(())
        },
    }
}

/// Trailing blocks of struct and enum descriptors, in ABI order.
fn value_type_blocks<C, D>() -> [TrailingBlock<D, C>; 5]
where
    C: ReadingContext,
    D: TypeContextDescriptor<C::Address>,
{
    [
        foreign_initialization_block(),
        singleton_initialization_block(),
        prespecializations_block(),
        invertible_protocols_block(),
        singleton_pointer_block(),
    ]
}

// =============================================================================
// Struct
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StructDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
    pub access_function: i32,
    pub fields: i32,
    pub num_fields: u32,
    /// Offset of the field offset vector in the metadata, in words
    pub field_offset_vector_offset: u32,
}
locatable!(StructDescriptorLayout, 28);

/// A struct descriptor.
#[derive(Debug, Clone)]
pub struct StructDescriptor<A> {
    pub header: Located<StructDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    pub trailing: TypeTrailing<A>,
    pub size: usize,
}

type_context_descriptor!(StructDescriptor);

impl<A: Address> StructDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<StructDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let mut descriptor = Self {
            header,
            generic_context: None,
            trailing: TypeTrailing::default(),
            size: 0,
        };
        if descriptor.flags().is_generic() {
            descriptor.generic_context = Some(GenericContext::decode(ctx, &mut cursor, true)?);
        }
        decode_trailing(ctx, &mut cursor, &mut descriptor, &value_type_blocks::<C, Self>())?;
        descriptor.size = cursor.consumed();
        Ok(descriptor)
    }

    pub fn num_fields(&self) -> u32 {
        self.header.num_fields
    }
}

// =============================================================================
// Enum
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EnumDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
    pub access_function: i32,
    pub fields: i32,
    /// Payload case count (low 24 bits) and payload size offset (high 8 bits)
    pub num_payload_cases_and_payload_size_offset: u32,
    pub num_empty_cases: u32,
}
locatable!(EnumDescriptorLayout, 28);

/// An enum descriptor.
#[derive(Debug, Clone)]
pub struct EnumDescriptor<A> {
    pub header: Located<EnumDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    pub trailing: TypeTrailing<A>,
    pub size: usize,
}

type_context_descriptor!(EnumDescriptor);

impl<A: Address> EnumDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<EnumDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let mut descriptor = Self {
            header,
            generic_context: None,
            trailing: TypeTrailing::default(),
            size: 0,
        };
        if descriptor.flags().is_generic() {
            descriptor.generic_context = Some(GenericContext::decode(ctx, &mut cursor, true)?);
        }
        decode_trailing(ctx, &mut cursor, &mut descriptor, &value_type_blocks::<C, Self>())?;
        descriptor.size = cursor.consumed();
        Ok(descriptor)
    }

    pub fn num_payload_cases(&self) -> u32 {
        self.header.num_payload_cases_and_payload_size_offset & 0x00FF_FFFF
    }

    pub fn payload_size_offset(&self) -> u32 {
        self.header.num_payload_cases_and_payload_size_offset >> 24
    }

    pub fn num_empty_cases(&self) -> u32 {
        self.header.num_empty_cases
    }

    /// Payload and empty cases together.
    pub fn num_cases(&self) -> u64 {
        u64::from(self.num_payload_cases()) + u64::from(self.num_empty_cases())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::flags::ContextDescriptorFlags;
    use crate::reading::BufferContext;

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_struct_with_singleton_blocks() {
        let mut data = vec![0u8; 0x100];
        // struct, unique, singleton init + singleton pointer + invertible protocols
        let kind_specific: u32 = 0b1001;
        let flags = 17 | 0x40 | 0x20 | (kind_specific << 16);
        put(
            &mut data,
            0x10,
            &StructDescriptorLayout {
                flags,
                parent: 0,
                name: 0x80 - 0x18,
                access_function: 0x60 - 0x1C,
                fields: 0,
                num_fields: 2,
                field_offset_vector_offset: 2,
            },
        );
        // 0x2C: singleton init (12), 0x38: invertible set (2), pad, 0x3C: pointer
        put(&mut data, 0x38, &3u16);
        data[0x80..0x85].copy_from_slice(b"Point");
        let ctx = BufferContext::new(data);

        let descriptor = StructDescriptor::decode(&ctx, 0x10).unwrap();
        assert!(ContextDescriptorFlags::new(flags).is_unique());
        assert_eq!(descriptor.name(&ctx).unwrap(), "Point");
        assert_eq!(descriptor.access_function(), Some(0x60));
        assert!(descriptor.field_descriptor(&ctx).unwrap().is_none());
        assert_eq!(descriptor.num_fields(), 2);

        let trailing = descriptor.type_trailing();
        assert_eq!(
            trailing.singleton_metadata_initialization.map(|s| s.address),
            Some(0x2C)
        );
        assert_eq!(trailing.invertible_protocols, Some(3));
        assert_eq!(trailing.singleton_metadata_pointer.map(|p| p.address), Some(0x3C));
        assert!(trailing.canonical_metadata_caching_token.is_none());
        assert_eq!(descriptor.actual_size(), 0x30);
    }

    #[test]
    fn test_enum_counts() {
        let mut data = vec![0u8; 0x40];
        put(
            &mut data,
            0,
            &EnumDescriptorLayout {
                flags: 18,
                num_payload_cases_and_payload_size_offset: (2 << 24) | 3,
                num_empty_cases: 4,
                ..Default::default()
            },
        );
        let ctx = BufferContext::new(data);
        let descriptor = EnumDescriptor::decode(&ctx, 0).unwrap();
        assert_eq!(descriptor.num_payload_cases(), 3);
        assert_eq!(descriptor.payload_size_offset(), 2);
        assert_eq!(descriptor.num_cases(), 7);
        assert_eq!(descriptor.access_function(), None);
        assert_eq!(descriptor.actual_size(), 28);
    }

    #[test]
    fn test_enum_counts_do_not_overflow() {
        let mut data = vec![0u8; 0x40];
        put(
            &mut data,
            0,
            &EnumDescriptorLayout {
                flags: 18,
                num_payload_cases_and_payload_size_offset: 1,
                num_empty_cases: u32::MAX,
                ..Default::default()
            },
        );
        let ctx = BufferContext::new(data);
        let descriptor = EnumDescriptor::decode(&ctx, 0).unwrap();
        assert_eq!(descriptor.num_empty_cases(), u32::MAX);
        assert_eq!(descriptor.num_cases(), u64::from(u32::MAX) + 1);
    }
}
