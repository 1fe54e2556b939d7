//! Protocol descriptors.

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::context::{context_descriptor, ContextDescriptor};
use super::cursor::TrailingCursor;
use super::flags::{ProtocolContextFlags, ProtocolRequirementFlags, ProtocolRequirementKind};
use super::generic::{GenericRequirement, GenericRequirementDescriptor};
use crate::error::Result;
use crate::layout::{locatable, Located};
use crate::pointer::RelativeDirectPointer;
use crate::reading::{Address, ReadingContext, Resolvable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProtocolDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
    pub num_requirements_in_signature: u32,
    pub num_requirements: u32,
    /// Relative pointer to space-separated associated type names
    pub associated_type_names: i32,
}
locatable!(ProtocolDescriptorLayout, 24);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ProtocolRequirement {
    pub flags: u32,
    /// Relative pointer to the default implementation
    pub default_implementation: i32,
}
locatable!(ProtocolRequirement, 8);

impl<A: Address> Located<ProtocolRequirement, A> {
    pub fn flags(&self) -> ProtocolRequirementFlags {
        ProtocolRequirementFlags::from_bits_retain(self.layout.flags)
    }

    pub fn kind(&self) -> ProtocolRequirementKind {
        self.flags().kind()
    }

    pub fn default_implementation(&self) -> Option<A> {
        let pointer = RelativeDirectPointer::<()>::new(self.layout.default_implementation);
        (!pointer.is_null()).then(|| {
            pointer.target(self.field_address(offset_of!(ProtocolRequirement, default_implementation)))
        })
    }
}

/// A protocol descriptor with its requirement signature and requirements.
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor<A> {
    pub header: Located<ProtocolDescriptorLayout, A>,
    /// Requirements on `Self` and associated types
    pub requirements_in_signature: Vec<GenericRequirement<A>>,
    /// Witness table entries, in order
    pub requirements: Vec<Located<ProtocolRequirement, A>>,
    pub size: usize,
}

context_descriptor!(ProtocolDescriptor);

impl<A: Address> ProtocolDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ProtocolDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let requirements_in_signature = cursor.take_located_array::<_, GenericRequirementDescriptor>(
            ctx,
            header.num_requirements_in_signature as usize,
        )?;
        let requirements = cursor.take_located_array(ctx, header.num_requirements as usize)?;
        Ok(Self {
            header,
            requirements_in_signature,
            requirements,
            size: cursor.consumed(),
        })
    }

    pub fn name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        RelativeDirectPointer::<String>::new(self.header.name).resolve(
            ctx,
            self.header
                .field_address(offset_of!(ProtocolDescriptorLayout, name)),
        )
    }

    pub fn protocol_flags(&self) -> ProtocolContextFlags {
        ProtocolContextFlags::from_bits_retain(self.flags().kind_specific_flags())
    }

    /// Names of the protocol's associated types, in declaration order.
    pub fn associated_type_names<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Vec<String>> {
        let names = RelativeDirectPointer::<String>::new(self.header.associated_type_names)
            .resolve_optional(
                ctx,
                self.header
                    .field_address(offset_of!(ProtocolDescriptorLayout, associated_type_names)),
            )?;
        Ok(names
            .map(|names| names.split(' ').filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default())
    }
}

impl<A: Address> Resolvable<A> for ProtocolDescriptor<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let context = super::ContextDescriptorWrapper::read(ctx, at)?;
        context.into_protocol(ctx.offset_from_address(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::flags::GenericRequirementKind;
    use crate::descriptor::ContextDescriptorWrapper;
    use crate::error::Error;
    use crate::reading::BufferContext;

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Protocol at 0x10 with one signature requirement and two requirements.
    fn protocol_context() -> BufferContext {
        let mut data = vec![0u8; 0x100];
        put(
            &mut data,
            0x10,
            &ProtocolDescriptorLayout {
                flags: 3 | 0x40 | (1 << 16),
                parent: 0,
                name: 0xC0 - 0x18,
                num_requirements_in_signature: 1,
                num_requirements: 2,
                associated_type_names: 0xD0 - 0x24,
            },
        );
        // requirement signature at 0x28: Self: <protocol at 0x10>
        put(
            &mut data,
            0x28,
            &GenericRequirementDescriptor {
                flags: 0,
                param: 0xE0 - 0x2C,
                content: 0x10 - 0x30,
            },
        );
        // requirements at 0x34
        put(
            &mut data,
            0x34,
            &ProtocolRequirement {
                flags: 7,
                default_implementation: 0,
            },
        );
        put(
            &mut data,
            0x3C,
            &ProtocolRequirement {
                flags: 0x11,
                default_implementation: 0xA0 - 0x40,
            },
        );
        data[0xC0..0xC7].copy_from_slice(b"Stream\0");
        data[0xD0..0xDA].copy_from_slice(b"Item Sink\0");
        data[0xE0..0xE2].copy_from_slice(b"x\0");
        BufferContext::new(data)
    }

    #[test]
    fn test_decode_protocol() {
        let ctx = protocol_context();
        let protocol = ProtocolDescriptor::decode(&ctx, 0x10).unwrap();
        assert_eq!(protocol.name(&ctx).unwrap(), "Stream");
        assert!(!protocol.protocol_flags().is_class_constrained());
        assert_eq!(
            protocol.associated_type_names(&ctx).unwrap(),
            vec!["Item".to_string(), "Sink".to_string()]
        );

        assert_eq!(protocol.requirements_in_signature.len(), 1);
        assert_eq!(
            protocol.requirements_in_signature[0].kind(),
            GenericRequirementKind::Protocol
        );

        assert_eq!(protocol.requirements.len(), 2);
        assert_eq!(
            protocol.requirements[0].kind(),
            ProtocolRequirementKind::AssociatedTypeAccessFunction
        );
        assert_eq!(protocol.requirements[0].default_implementation(), None);
        assert_eq!(protocol.requirements[1].kind(), ProtocolRequirementKind::Method);
        assert_eq!(protocol.requirements[1].default_implementation(), Some(0xA0));
        assert_eq!(protocol.actual_size(), 24 + 12 + 16);
    }

    #[test]
    fn test_resolve_through_wrapper() {
        let ctx = protocol_context();
        let context: ContextDescriptorWrapper<u64> = ctx.read_wrapper(0x10).unwrap();
        assert!(context.as_protocol().is_some());
        assert_eq!(context.qualified_name(&ctx).unwrap(), "Stream");
    }

    #[test]
    fn test_resolve_wrong_kind() {
        let mut data = vec![0u8; 0x20];
        // a module descriptor
        data[0..4].copy_from_slice(&0u32.to_le_bytes());
        let ctx = BufferContext::new(data);
        match ctx.read_wrapper::<ProtocolDescriptor<u64>>(0) {
            Err(Error::UnexpectedDescriptorKind { expected, found, .. }) => {
                assert_eq!(expected, "protocol");
                assert_eq!(found, "module");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
