//! Generic contexts: parameters, requirements and their trailing extras.
//!
//! A generic context directly follows the fixed header of a generic
//! descriptor. Type descriptors use the 16-byte type header (instantiation
//! cache and pattern before the base header); every other kind uses the
//! 8-byte base header.
//!
//! ```text
//! header
//! params          u8 x num_params, padded to 4
//! requirements    12 bytes x num_requirements
//! [packs]         header + 8 bytes x num_packs          (HAS_TYPE_PACKS)
//! [inverted]      u16 set + u16 counts + requirements   (HAS_CONDITIONAL_INVERTED_PROTOCOLS)
//! [values]        header + 4 bytes x num_values         (HAS_VALUES)
//! ```

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::cursor::TrailingCursor;
use super::flags::{GenericContextFlags, GenericRequirementFlags, GenericRequirementKind};
use super::mangled::MangledName;
use super::protocol::ProtocolDescriptor;
use crate::error::Result;
use crate::layout::{locatable, Located};
use crate::pointer::{RelativeDirectPointer, RelativeIndirectablePointerIntPair};
use crate::reading::{Address, ReadingContext};
use crate::symbol::SymbolOrElement;

// =============================================================================
// Layouts
// =============================================================================

/// Base generic context header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericContextDescriptorHeader {
    pub num_params: u16,
    pub num_requirements: u16,
    pub num_key_arguments: u16,
    pub flags: u16,
}
locatable!(GenericContextDescriptorHeader, 8);

/// Generic context header of class, struct and enum descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TypeGenericContextDescriptorHeader {
    /// Relative pointer to the metadata instantiation cache
    pub instantiation_cache: i32,
    /// Relative pointer to the default instantiation pattern
    pub default_instantiation_pattern: i32,
    pub base: GenericContextDescriptorHeader,
}
locatable!(TypeGenericContextDescriptorHeader, 16);

/// A generic requirement.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericRequirementDescriptor {
    pub flags: u32,
    /// Relative pointer to the mangled name of the constrained parameter
    pub param: i32,
    /// Protocol, type name, conformance or layout kind, depending on `flags`
    pub content: i32,
}
locatable!(GenericRequirementDescriptor, 12);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericPackShapeHeader {
    pub num_packs: u16,
    pub num_shape_classes: u16,
}
locatable!(GenericPackShapeHeader, 4);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericPackShapeDescriptor {
    pub kind: u16,
    pub index: u16,
    pub shape_class: u16,
    pub unused: u16,
}
locatable!(GenericPackShapeDescriptor, 8);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericValueHeader {
    pub num_values: u32,
}
locatable!(GenericValueHeader, 4);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericValueDescriptor {
    pub value_type: u32,
}
locatable!(GenericValueDescriptor, 4);

/// A generic parameter descriptor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericParamDescriptor(pub u8);

impl GenericParamDescriptor {
    /// Parameter kind: 0 type, 1 type pack, 2 value.
    pub fn kind(self) -> u8 {
        self.0 & 0x3F
    }

    pub fn has_key_argument(self) -> bool {
        self.0 & 0x80 != 0
    }
}

// =============================================================================
// Generic Requirement
// =============================================================================

/// A requirement with the address it was read from.
pub type GenericRequirement<A> = Located<GenericRequirementDescriptor, A>;

impl<A: Address> Located<GenericRequirementDescriptor, A> {
    pub fn flags(&self) -> GenericRequirementFlags {
        GenericRequirementFlags::from_bits_retain(self.layout.flags)
    }

    pub fn kind(&self) -> GenericRequirementKind {
        self.flags().kind()
    }

    /// Mangled name of the constrained parameter.
    pub fn param<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<MangledName<A>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.layout.param)
            .resolve(ctx, self.field_address(offset_of!(GenericRequirementDescriptor, param)))
    }

    /// Mangled type name for same-type and base-class requirements.
    pub fn content_type<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        match self.kind() {
            GenericRequirementKind::SameType | GenericRequirementKind::BaseClass => {
                RelativeDirectPointer::<MangledName<A>>::new(self.layout.content)
                    .resolve(ctx, self.content_address())
                    .map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Protocol of a conformance requirement.
    ///
    /// Objective-C protocols (value bit set) are not Swift descriptors and
    /// yield `None`.
    pub fn content_protocol<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<SymbolOrElement<ProtocolDescriptor<A>>>> {
        if self.kind() != GenericRequirementKind::Protocol {
            return Ok(None);
        }
        let pointer = RelativeIndirectablePointerIntPair::<ProtocolDescriptor<A>, bool>::new(
            self.layout.content,
        );
        if pointer.value() {
            return Ok(None);
        }
        pointer.resolve_optional(ctx, self.content_address())
    }

    /// Layout kind of a layout requirement.
    pub fn content_layout(&self) -> Option<u32> {
        (self.kind() == GenericRequirementKind::Layout).then_some(self.layout.content as u32)
    }

    fn content_address(&self) -> A {
        self.field_address(offset_of!(GenericRequirementDescriptor, content))
    }
}

// =============================================================================
// Generic Context
// =============================================================================

/// A decoded generic context.
#[derive(Debug, Clone)]
pub struct GenericContext<A> {
    /// Address of the header
    pub address: A,
    pub header: GenericContextDescriptorHeader,
    /// Present for class, struct and enum descriptors
    pub type_header: Option<TypeGenericContextDescriptorHeader>,
    pub parameters: Vec<GenericParamDescriptor>,
    pub requirements: Vec<GenericRequirement<A>>,
    pub pack_shape_header: Option<GenericPackShapeHeader>,
    pub pack_shapes: Vec<GenericPackShapeDescriptor>,
    /// Set of inverted protocols with conditional requirements
    pub conditional_invertible_protocols: Option<u16>,
    /// Running requirement counts, one per protocol in the set
    pub conditional_invertible_counts: Vec<u16>,
    pub conditional_invertible_requirements: Vec<GenericRequirement<A>>,
    pub value_header: Option<GenericValueHeader>,
    pub values: Vec<GenericValueDescriptor>,
    /// Bytes occupied, header included
    pub size: usize,
}

impl<A: Address> GenericContext<A> {
    /// Decodes a generic context at the cursor, leaving the cursor after it.
    pub fn decode<C>(ctx: &C, cursor: &mut TrailingCursor<A>, type_context: bool) -> Result<Self>
    where
        C: ReadingContext<Address = A>,
    {
        let address = cursor.position();
        let start = cursor.consumed();

        let (header, type_header) = if type_context {
            let type_header: TypeGenericContextDescriptorHeader = cursor.take(ctx)?;
            (type_header.base, Some(type_header))
        } else {
            (cursor.take::<_, GenericContextDescriptorHeader>(ctx)?, None)
        };
        let flags = GenericContextFlags::from_bits_retain(header.flags);

        let parameters = ctx
            .bytes_at(cursor.position(), header.num_params as usize)?
            .iter()
            .copied()
            .map(GenericParamDescriptor)
            .collect();
        cursor.skip(header.num_params as usize);
        cursor.align(4);

        let requirements = cursor.take_located_array(ctx, header.num_requirements as usize)?;

        let mut context = Self {
            address,
            header,
            type_header,
            parameters,
            requirements,
            pack_shape_header: None,
            pack_shapes: Vec::new(),
            conditional_invertible_protocols: None,
            conditional_invertible_counts: Vec::new(),
            conditional_invertible_requirements: Vec::new(),
            value_header: None,
            values: Vec::new(),
            size: 0,
        };

        if flags.contains(GenericContextFlags::HAS_TYPE_PACKS) {
            let pack_header: GenericPackShapeHeader = cursor.take(ctx)?;
            for _ in 0..pack_header.num_packs {
                context.pack_shapes.push(cursor.take(ctx)?);
            }
            context.pack_shape_header = Some(pack_header);
        }

        if flags.contains(GenericContextFlags::HAS_CONDITIONAL_INVERTED_PROTOCOLS) {
            let set: u16 = cursor.take(ctx)?;
            for _ in 0..set.count_ones() {
                context.conditional_invertible_counts.push(cursor.take(ctx)?);
            }
            cursor.align(4);
            let total = context.conditional_invertible_counts.last().copied().unwrap_or(0);
            context.conditional_invertible_requirements =
                cursor.take_located_array(ctx, total as usize)?;
            context.conditional_invertible_protocols = Some(set);
        }

        if flags.contains(GenericContextFlags::HAS_VALUES) {
            cursor.align(4);
            let value_header: GenericValueHeader = cursor.take(ctx)?;
            for _ in 0..value_header.num_values {
                context.values.push(cursor.take(ctx)?);
            }
            context.value_header = Some(value_header);
        }

        context.size = cursor.consumed() - start;
        Ok(context)
    }

    /// Number of generic parameters.
    pub fn num_params(&self) -> usize {
        self.parameters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::BufferContext;

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_type_generic_context() {
        let mut data = vec![0u8; 0x100];
        let header = TypeGenericContextDescriptorHeader {
            base: GenericContextDescriptorHeader {
                num_params: 2,
                num_requirements: 1,
                num_key_arguments: 3,
                flags: GenericContextFlags::HAS_TYPE_PACKS.bits(),
            },
            ..Default::default()
        };
        put(&mut data, 0x10, &header);
        data[0x20] = 0x80;
        data[0x21] = 0x81;
        // params padded to 4: requirement at 0x24
        put(
            &mut data,
            0x24,
            &GenericRequirementDescriptor {
                flags: 0x80,
                param: 0,
                content: 0,
            },
        );
        put(
            &mut data,
            0x30,
            &GenericPackShapeHeader {
                num_packs: 1,
                num_shape_classes: 1,
            },
        );
        put(
            &mut data,
            0x34,
            &GenericPackShapeDescriptor {
                kind: 0,
                index: 1,
                shape_class: 0,
                unused: 0,
            },
        );
        let ctx = BufferContext::new(data);

        // descriptor at 0x00 with a 16-byte header
        let mut cursor = TrailingCursor::new(0u64, 0x10);
        let context = GenericContext::decode(&ctx, &mut cursor, true).unwrap();

        assert_eq!(context.num_params(), 2);
        assert!(context.parameters[1].has_key_argument());
        assert_eq!(context.parameters[1].kind(), 1);
        assert_eq!(context.requirements.len(), 1);
        assert_eq!(context.requirements[0].address, 0x24);
        assert_eq!(context.requirements[0].kind(), GenericRequirementKind::Protocol);
        assert_eq!(context.pack_shapes.len(), 1);
        assert_eq!(context.pack_shapes[0].index, 1);
        assert_eq!(context.size, 0x2C);
        assert_eq!(cursor.position(), 0x3C);
    }

    #[test]
    fn test_base_header_and_inverted_protocols() {
        let mut data = vec![0u8; 0x80];
        put(
            &mut data,
            0x08,
            &GenericContextDescriptorHeader {
                num_params: 1,
                num_requirements: 0,
                num_key_arguments: 1,
                flags: GenericContextFlags::HAS_CONDITIONAL_INVERTED_PROTOCOLS.bits(),
            },
        );
        data[0x10] = 0x80;
        // inverted set at 0x14 (Copyable), one running count of 1
        put(&mut data, 0x14, &1u16);
        put(&mut data, 0x16, &1u16);
        put(
            &mut data,
            0x18,
            &GenericRequirementDescriptor {
                flags: 5,
                param: 0,
                content: 1,
            },
        );
        let ctx = BufferContext::new(data);

        let mut cursor = TrailingCursor::new(0u64, 0x08);
        let context = GenericContext::decode(&ctx, &mut cursor, false).unwrap();
        assert!(context.type_header.is_none());
        assert_eq!(context.conditional_invertible_protocols, Some(1));
        assert_eq!(context.conditional_invertible_requirements.len(), 1);
        assert_eq!(
            context.conditional_invertible_requirements[0].kind(),
            GenericRequirementKind::InvertedProtocols
        );
        assert_eq!(cursor.position(), 0x24);
        assert_eq!(context.size, 0x1C);
    }

    #[test]
    fn test_requirement_count_past_end() {
        let mut data = vec![0u8; 0x20];
        put(
            &mut data,
            0,
            &GenericContextDescriptorHeader {
                num_params: 0,
                num_requirements: 200,
                num_key_arguments: 0,
                flags: 0,
            },
        );
        let ctx = BufferContext::new(data);
        let mut cursor = TrailingCursor::new(0u64, 0);
        assert!(GenericContext::decode(&ctx, &mut cursor, false).is_err());
    }
}
