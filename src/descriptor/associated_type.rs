//! Associated type descriptors (`__swift5_assocty` records).

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::mangled::MangledName;
use crate::error::Result;
use crate::layout::{locatable, LocatableLayout, Located};
use crate::pointer::RelativeDirectPointer;
use crate::reading::{Address, ReadingContext, Resolvable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AssociatedTypeDescriptorLayout {
    pub conforming_type_name: i32,
    pub protocol_type_name: i32,
    pub num_associated_types: u32,
    pub associated_type_record_size: u32,
}
locatable!(AssociatedTypeDescriptorLayout, 16);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AssociatedTypeRecord {
    pub name: i32,
    pub substituted_type_name: i32,
}
locatable!(AssociatedTypeRecord, 8);

impl<A: Address> Located<AssociatedTypeRecord, A> {
    pub fn name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        RelativeDirectPointer::<String>::new(self.layout.name)
            .resolve(ctx, self.field_address(offset_of!(AssociatedTypeRecord, name)))
    }

    pub fn substituted_type_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<MangledName<A>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.layout.substituted_type_name).resolve(
            ctx,
            self.field_address(offset_of!(AssociatedTypeRecord, substituted_type_name)),
        )
    }
}

/// Witnesses for a conformance's associated types.
#[derive(Debug, Clone)]
pub struct AssociatedTypeDescriptor<A> {
    pub header: Located<AssociatedTypeDescriptorLayout, A>,
    pub records: Vec<Located<AssociatedTypeRecord, A>>,
}

impl<A: Address> AssociatedTypeDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<AssociatedTypeDescriptorLayout>(at)?;
        let stride = header.record_stride();
        let first = header.end();
        ctx.bytes_at(first, stride * header.num_associated_types as usize)?;
        let records = (0..header.num_associated_types as usize)
            .map(|i| ctx.read_locatable_layout::<AssociatedTypeRecord>(first.advanced(i * stride)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { header, records })
    }

    pub fn address(&self) -> A {
        self.header.address
    }

    pub fn conforming_type_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<MangledName<A>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.conforming_type_name).resolve(
            ctx,
            self.header
                .field_address(offset_of!(AssociatedTypeDescriptorLayout, conforming_type_name)),
        )
    }

    pub fn protocol_type_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<MangledName<A>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.protocol_type_name).resolve(
            ctx,
            self.header
                .field_address(offset_of!(AssociatedTypeDescriptorLayout, protocol_type_name)),
        )
    }

    pub fn actual_size(&self) -> usize {
        AssociatedTypeDescriptorLayout::SIZE + self.header.record_stride() * self.records.len()
    }
}

impl AssociatedTypeDescriptorLayout {
    fn record_stride(&self) -> usize {
        match self.associated_type_record_size {
            0 => AssociatedTypeRecord::SIZE,
            size => size as usize,
        }
    }
}

impl<A: Address> Resolvable<A> for AssociatedTypeDescriptor<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        Self::decode(ctx, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::BufferContext;

    #[test]
    fn test_records() {
        let mut data = vec![0u8; 0x80];
        let header = AssociatedTypeDescriptorLayout {
            conforming_type_name: 0x40,
            protocol_type_name: 0x48 - 4,
            num_associated_types: 1,
            associated_type_record_size: 8,
        };
        data[0..16].copy_from_slice(header.as_bytes());
        let record = AssociatedTypeRecord {
            name: 0x50 - 16,
            substituted_type_name: 0x58 - 20,
        };
        data[16..24].copy_from_slice(record.as_bytes());
        data[0x40..0x44].copy_from_slice(b"4Box");
        data[0x48..0x4A].copy_from_slice(b"ST");
        data[0x50..0x55].copy_from_slice(b"Item\0");
        data[0x58..0x5A].copy_from_slice(b"Si");
        let ctx = BufferContext::new(data);

        let descriptor: AssociatedTypeDescriptor<u64> = ctx.read_wrapper(0).unwrap();
        assert_eq!(descriptor.conforming_type_name(&ctx).unwrap().as_plain_str(), Some("4Box"));
        assert_eq!(descriptor.protocol_type_name(&ctx).unwrap().as_plain_str(), Some("ST"));
        assert_eq!(descriptor.records.len(), 1);
        assert_eq!(descriptor.records[0].name(&ctx).unwrap(), "Item");
        assert_eq!(
            descriptor.records[0].substituted_type_name(&ctx).unwrap().as_plain_str(),
            Some("Si")
        );
        assert_eq!(descriptor.actual_size(), 24);
    }
}
