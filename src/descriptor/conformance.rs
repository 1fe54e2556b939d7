//! Protocol conformance descriptors (`__swift5_proto` records).
//!
//! Trailing objects, in ABI order:
//!
//! 1. retroactive context (`IS_RETROACTIVE`)
//! 2. conditional requirements
//! 3. conditional pack shape header + descriptors
//! 4. resilient witnesses header + witnesses
//! 5. generic witness table
//! 6. global actor reference (`HAS_GLOBAL_ACTOR_ISOLATION`)

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::context::{RelativeContextPointer, RelativeOffset};
use super::cursor::{decode_trailing, TrailingBlock, TrailingCursor};
use super::flags::{ConformanceFlags, TypeReferenceKind};
use super::generic::{
    GenericPackShapeDescriptor, GenericPackShapeHeader, GenericRequirement,
    GenericRequirementDescriptor,
};
use super::mangled::MangledName;
use super::protocol::ProtocolDescriptor;
use super::ContextDescriptorWrapper;
use crate::error::Result;
use crate::layout::{locatable, Located};
use crate::pointer::{RelativeDirectPointer, RelativeIndirectablePointer};
use crate::reading::{Address, ReadingContext, Resolvable};
use crate::symbol::{resolve_slot, SymbolOrElement};

// =============================================================================
// Layouts
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProtocolConformanceDescriptorLayout {
    /// Indirectable relative pointer to the protocol
    pub protocol: i32,
    /// Relative pointer whose meaning depends on the type reference kind
    pub type_reference: i32,
    /// Relative pointer to the witness table pattern
    pub witness_table_pattern: i32,
    pub flags: u32,
}
locatable!(ProtocolConformanceDescriptorLayout, 16);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResilientWitnessesHeader {
    pub num_witnesses: u32,
}
locatable!(ResilientWitnessesHeader, 4);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResilientWitness {
    /// Indirectable relative pointer to the protocol requirement
    pub requirement: i32,
    /// Relative pointer to the implementation
    pub implementation: i32,
}
locatable!(ResilientWitness, 8);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GenericWitnessTable {
    pub witness_table_size_in_words: u16,
    /// Low bit: the table requires instantiation
    pub witness_table_private_size_in_words_and_requires_instantiation: u16,
    pub instantiator: i32,
    pub private_data: i32,
}
locatable!(GenericWitnessTable, 12);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GlobalActorReference {
    /// Relative pointer to the mangled global actor type
    pub type_name: i32,
    /// Relative pointer to the actor's `GlobalActor` conformance
    pub conformance: i32,
}
locatable!(GlobalActorReference, 8);

impl<A: Address> Located<ResilientWitness, A> {
    /// Address of the requirement, or the symbol its slot is bound to.
    pub fn requirement<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<SymbolOrElement<A>> {
        RelativeIndirectablePointer::<()>::new(self.layout.requirement)
            .resolve_address(ctx, self.field_address(offset_of!(ResilientWitness, requirement)))
    }

    pub fn implementation(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.layout.implementation);
        (!pointer.is_null())
            .then(|| pointer.target(self.field_address(offset_of!(ResilientWitness, implementation))))
    }
}

impl<A: Address> Located<GenericWitnessTable, A> {
    pub fn requires_instantiation(&self) -> bool {
        self.witness_table_private_size_in_words_and_requires_instantiation & 1 != 0
    }

    pub fn private_size_in_words(&self) -> u16 {
        self.witness_table_private_size_in_words_and_requires_instantiation >> 1
    }
}

impl<A: Address> Located<GlobalActorReference, A> {
    pub fn type_name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<MangledName<A>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.type_name)
            .resolve(ctx, self.field_address(offset_of!(GlobalActorReference, type_name)))
    }
}

// =============================================================================
// Conforming Type
// =============================================================================

/// The type a conformance is declared on.
#[derive(Debug, Clone)]
pub enum ConformingType<A> {
    /// A Swift type descriptor, possibly bound to an external symbol
    Descriptor(SymbolOrElement<ContextDescriptorWrapper<A>>),
    /// Name of an Objective-C class
    ObjCClassName(String),
    /// Address of an Objective-C class object, or its bound symbol
    ObjCClass(SymbolOrElement<A>),
    /// A reference kind this reader does not know
    Unknown(u8),
}

// =============================================================================
// Conformance Descriptor
// =============================================================================

/// A protocol conformance record with its trailing objects.
#[derive(Debug, Clone)]
pub struct ProtocolConformanceDescriptor<A> {
    pub header: Located<ProtocolConformanceDescriptorLayout, A>,
    pub retroactive_context: Option<Located<RelativeOffset, A>>,
    pub conditional_requirements: Vec<GenericRequirement<A>>,
    pub pack_shape_header: Option<Located<GenericPackShapeHeader, A>>,
    pub pack_shapes: Vec<Located<GenericPackShapeDescriptor, A>>,
    pub resilient_witnesses_header: Option<Located<ResilientWitnessesHeader, A>>,
    pub resilient_witnesses: Vec<Located<ResilientWitness, A>>,
    pub generic_witness_table: Option<Located<GenericWitnessTable, A>>,
    pub global_actor_reference: Option<Located<GlobalActorReference, A>>,
    pub size: usize,
}

type ConformanceIn<C> = ProtocolConformanceDescriptor<<C as ReadingContext>::Address>;

fn conformance_blocks<C: ReadingContext>() -> [TrailingBlock<ConformanceIn<C>, C>; 6] {
    [
        TrailingBlock {
            name: "retroactive context",
            present: |d: &ConformanceIn<C>| d.flags().contains(ConformanceFlags::IS_RETROACTIVE),
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                d.retroactive_context = Some(cursor.take_located(ctx)?);
                Ok(())
            },
        },
        TrailingBlock {
            name: "conditional requirements",
            present: |d: &ConformanceIn<C>| d.flags().num_conditional_requirements() > 0,
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                let count = d.flags().num_conditional_requirements() as usize;
                d.conditional_requirements =
                    cursor.take_located_array::<_, GenericRequirementDescriptor>(ctx, count)?;
                Ok(())
            },
        },
        TrailingBlock {
            name: "conditional pack shapes",
            present: |d: &ConformanceIn<C>| d.flags().num_conditional_pack_shape_descriptors() > 0,
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                let count = d.flags().num_conditional_pack_shape_descriptors() as usize;
                d.pack_shape_header = Some(cursor.take_located(ctx)?);
                d.pack_shapes = cursor.take_located_array(ctx, count)?;
                Ok(())
            },
        },
        TrailingBlock {
            name: "resilient witnesses",
            present: |d: &ConformanceIn<C>| {
                d.flags().contains(ConformanceFlags::HAS_RESILIENT_WITNESSES)
            },
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                let header: Located<ResilientWitnessesHeader, _> = cursor.take_located(ctx)?;
                d.resilient_witnesses =
                    cursor.take_located_array(ctx, header.num_witnesses as usize)?;
                d.resilient_witnesses_header = Some(header);
                Ok(())
            },
        },
        TrailingBlock {
            name: "generic witness table",
            present: |d: &ConformanceIn<C>| {
                d.flags().contains(ConformanceFlags::HAS_GENERIC_WITNESS_TABLE)
            },
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                d.generic_witness_table = Some(cursor.take_located(ctx)?);
                Ok(())
            },
        },
        TrailingBlock {
            name: "global actor reference",
            present: |d: &ConformanceIn<C>| {
                d.flags().contains(ConformanceFlags::HAS_GLOBAL_ACTOR_ISOLATION)
            },
            decode: |ctx: &C, cursor: &mut TrailingCursor<C::Address>, d: &mut ConformanceIn<C>| {
                d.global_actor_reference = Some(cursor.take_located(ctx)?);
                Ok(())
            },
        },
    ]
}

impl<A: Address> ProtocolConformanceDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ProtocolConformanceDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let mut descriptor = Self {
            header,
            retroactive_context: None,
            conditional_requirements: Vec::new(),
            pack_shape_header: None,
            pack_shapes: Vec::new(),
            resilient_witnesses_header: None,
            resilient_witnesses: Vec::new(),
            generic_witness_table: None,
            global_actor_reference: None,
            size: 0,
        };
        decode_trailing(ctx, &mut cursor, &mut descriptor, &conformance_blocks::<C>())?;
        descriptor.size = cursor.consumed();
        Ok(descriptor)
    }

    pub fn address(&self) -> A {
        self.header.address
    }

    pub fn flags(&self) -> ConformanceFlags {
        ConformanceFlags::new(self.header.flags)
    }

    pub fn actual_size(&self) -> usize {
        self.size
    }

    /// The conformed-to protocol. `None` if the pointer is null.
    pub fn protocol<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<SymbolOrElement<ProtocolDescriptor<A>>>> {
        RelativeIndirectablePointer::<ProtocolDescriptor<A>>::new(self.header.protocol)
            .resolve_optional(
                ctx,
                self.header
                    .field_address(offset_of!(ProtocolConformanceDescriptorLayout, protocol)),
            )
    }

    /// The conforming type, resolved according to the flags' reference kind.
    pub fn type_reference<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<ConformingType<A>> {
        let field = self
            .header
            .field_address(offset_of!(ProtocolConformanceDescriptorLayout, type_reference));
        let target = RelativeDirectPointer::<()>::new(self.header.type_reference).target(field);
        Ok(match self.flags().type_reference_kind() {
            TypeReferenceKind::DirectTypeDescriptor => {
                ConformingType::Descriptor(SymbolOrElement::Element(
                    ContextDescriptorWrapper::resolve(ctx, target)?,
                ))
            }
            TypeReferenceKind::IndirectTypeDescriptor => ConformingType::Descriptor(
                resolve_slot(ctx, target)?
                    .try_map(|at| ContextDescriptorWrapper::resolve(ctx, at))?,
            ),
            TypeReferenceKind::DirectObjCClassName => {
                ConformingType::ObjCClassName(ctx.read_c_string(target)?)
            }
            TypeReferenceKind::IndirectObjCClass => {
                ConformingType::ObjCClass(resolve_slot(ctx, target)?)
            }
            TypeReferenceKind::Unknown(raw) => ConformingType::Unknown(raw),
        })
    }

    /// Address of the witness table pattern.
    pub fn witness_table_pattern(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.header.witness_table_pattern);
        (!pointer.is_null()).then(|| {
            pointer.target(
                self.header
                    .field_address(offset_of!(ProtocolConformanceDescriptorLayout, witness_table_pattern)),
            )
        })
    }

    /// The module that declared a retroactive conformance.
    pub fn retroactive_context<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<SymbolOrElement<ContextDescriptorWrapper<A>>>> {
        let Some(located) = self.retroactive_context.as_ref() else {
            return Ok(None);
        };
        RelativeContextPointer::<A>::new(located.offset).resolve_optional(ctx, located.address)
    }
}

impl<A: Address> Resolvable<A> for ProtocolConformanceDescriptor<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        Self::decode(ctx, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::context::ContextDescriptorLayout;
    use crate::descriptor::ContextDescriptor;
    use crate::reading::{BufferContext, FixupTables};

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_plain_conformance_to_bound_protocol() {
        let mut data = vec![0u8; 0x100];
        // protocol slot at 0x80 is bound; type is an ObjC class name at 0x90
        put(
            &mut data,
            0x10,
            &ProtocolConformanceDescriptorLayout {
                protocol: (0x80 - 0x10) | 1,
                type_reference: 0x90 - 0x14,
                witness_table_pattern: 0xA0 - 0x18,
                flags: 2 << 3,
            },
        );
        data[0x90..0x99].copy_from_slice(b"NSObject\0");
        let mut fixups = FixupTables::new();
        fixups.insert_bind(0x80, "_$sSHMp");
        let ctx = BufferContext::new(data).with_fixups(fixups);

        let conformance = ProtocolConformanceDescriptor::decode(&ctx, 0x10).unwrap();
        assert_eq!(conformance.actual_size(), 16);
        let protocol = conformance.protocol(&ctx).unwrap().unwrap();
        assert_eq!(protocol.symbol().map(|s| s.name.as_str()), Some("_$sSHMp"));
        match conformance.type_reference(&ctx).unwrap() {
            ConformingType::ObjCClassName(name) => assert_eq!(name, "NSObject"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conformance.witness_table_pattern(), Some(0xA0));
        assert!(conformance.retroactive_context(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_trailing_blocks_in_order() {
        let mut data = vec![0u8; 0x200];
        // module at 0x100 serves as both the conforming "type" and the
        // retroactive context
        put(
            &mut data,
            0x100,
            &ContextDescriptorLayout { flags: 0, parent: 0 },
        );
        data[0x108..0x10C].copy_from_slice(&(0x180i32 - 0x108).to_le_bytes());
        data[0x180..0x184].copy_from_slice(b"Ext\0");

        let flags = ConformanceFlags::IS_RETROACTIVE.bits()
            | (1 << 8)
            | ConformanceFlags::HAS_RESILIENT_WITNESSES.bits()
            | ConformanceFlags::HAS_GENERIC_WITNESS_TABLE.bits()
            | ConformanceFlags::HAS_GLOBAL_ACTOR_ISOLATION.bits();
        put(
            &mut data,
            0x10,
            &ProtocolConformanceDescriptorLayout {
                protocol: 0,
                type_reference: 0x100 - 0x14,
                witness_table_pattern: 0,
                flags,
            },
        );
        // 0x20 retroactive context
        put(&mut data, 0x20, &RelativeOffset { offset: 0x100 - 0x20 });
        // 0x24 one conditional requirement
        put(&mut data, 0x24, &GenericRequirementDescriptor { flags: 0, param: 0, content: 0 });
        // 0x30 resilient witnesses: two entries
        put(&mut data, 0x30, &ResilientWitnessesHeader { num_witnesses: 2 });
        put(
            &mut data,
            0x34,
            &ResilientWitness {
                requirement: 0x60 - 0x34,
                implementation: 0x70 - 0x38,
            },
        );
        put(&mut data, 0x3C, &ResilientWitness::default());
        // 0x44 generic witness table
        put(
            &mut data,
            0x44,
            &GenericWitnessTable {
                witness_table_size_in_words: 4,
                witness_table_private_size_in_words_and_requires_instantiation: (2 << 1) | 1,
                instantiator: 0,
                private_data: 0,
            },
        );
        // 0x50 global actor reference
        put(
            &mut data,
            0x50,
            &GlobalActorReference {
                type_name: 0x1A0 - 0x50,
                conformance: 0,
            },
        );
        data[0x1A0..0x1A4].copy_from_slice(b"ScM\0");
        let ctx = BufferContext::new(data);

        let conformance = ProtocolConformanceDescriptor::decode(&ctx, 0x10).unwrap();
        assert!(conformance.protocol(&ctx).unwrap().is_none());

        let retroactive = conformance.retroactive_context(&ctx).unwrap().unwrap();
        let module = retroactive.element().unwrap();
        assert_eq!(module.address(), 0x100);
        assert_eq!(module.name(&ctx).unwrap().as_deref(), Some("Ext"));

        assert_eq!(conformance.conditional_requirements.len(), 1);
        assert_eq!(conformance.conditional_requirements[0].address, 0x24);

        assert_eq!(conformance.resilient_witnesses.len(), 2);
        let witness = &conformance.resilient_witnesses[0];
        assert_eq!(witness.requirement(&ctx).unwrap().element(), Some(&0x60));
        assert_eq!(witness.implementation(), Some(0x70));
        assert_eq!(conformance.resilient_witnesses[1].implementation(), None);

        let table = conformance.generic_witness_table.unwrap();
        assert_eq!(table.address, 0x44);
        assert!(table.requires_instantiation());
        assert_eq!(table.private_size_in_words(), 2);

        let actor = conformance.global_actor_reference.unwrap();
        assert_eq!(actor.address, 0x50);
        assert_eq!(actor.type_name(&ctx).unwrap().as_plain_str(), Some("ScM"));

        assert_eq!(conformance.actual_size(), 0x58 - 0x10);
        match conformance.type_reference(&ctx).unwrap() {
            ConformingType::Descriptor(SymbolOrElement::Element(context)) => {
                assert_eq!(context.address(), 0x100)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
