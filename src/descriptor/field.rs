//! Field descriptors (`__swift5_fieldmd` records).

use std::mem::offset_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::mangled::MangledName;
use crate::error::Result;
use crate::layout::{locatable, LocatableLayout, Located};
use crate::pointer::RelativeDirectPointer;
use crate::reading::{Address, ReadingContext, Resolvable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FieldDescriptorLayout {
    pub mangled_type_name: i32,
    pub superclass: i32,
    pub kind: u16,
    /// Stride of the records that follow
    pub field_record_size: u16,
    pub num_fields: u32,
}
locatable!(FieldDescriptorLayout, 16);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FieldRecord {
    pub flags: u32,
    pub mangled_type_name: i32,
    pub field_name: i32,
}
locatable!(FieldRecord, 12);

/// What a field descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDescriptorKind {
    Struct,
    Class,
    Enum,
    MultiPayloadEnum,
    Protocol,
    ClassProtocol,
    ObjCProtocol,
    ObjCClass,
    Unknown(u16),
}

impl FieldDescriptorKind {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Struct,
            1 => Self::Class,
            2 => Self::Enum,
            3 => Self::MultiPayloadEnum,
            4 => Self::Protocol,
            5 => Self::ClassProtocol,
            6 => Self::ObjCProtocol,
            7 => Self::ObjCClass,
            other => Self::Unknown(other),
        }
    }

    pub fn is_enum(self) -> bool {
        matches!(self, Self::Enum | Self::MultiPayloadEnum)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldRecordFlags: u32 {
        /// Enum case stored out of line
        const IS_INDIRECT_CASE = 1 << 0;
        /// `var` rather than `let`
        const IS_VAR = 1 << 1;
        const IS_ARTIFICIAL = 1 << 2;
    }
}

impl<A: Address> Located<FieldRecord, A> {
    pub fn flags(&self) -> FieldRecordFlags {
        FieldRecordFlags::from_bits_retain(self.layout.flags)
    }

    pub fn field_name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        RelativeDirectPointer::<String>::new(self.layout.field_name)
            .resolve(ctx, self.field_address(offset_of!(FieldRecord, field_name)))
    }

    /// Mangled type of the field; `None` for payload-less enum cases.
    pub fn mangled_type_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.layout.mangled_type_name)
            .resolve_optional(ctx, self.field_address(offset_of!(FieldRecord, mangled_type_name)))
    }
}

/// A field descriptor and its records.
#[derive(Debug, Clone)]
pub struct FieldDescriptor<A> {
    pub header: Located<FieldDescriptorLayout, A>,
    pub records: Vec<Located<FieldRecord, A>>,
}

impl<A: Address> FieldDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<FieldDescriptorLayout>(at)?;
        let stride = header.record_stride();
        let first = header.end();
        // bounds-check the whole table before reading records
        ctx.bytes_at(first, stride * header.num_fields as usize)?;
        let records = (0..header.num_fields as usize)
            .map(|i| ctx.read_locatable_layout::<FieldRecord>(first.advanced(i * stride)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { header, records })
    }

    pub fn address(&self) -> A {
        self.header.address
    }

    pub fn kind(&self) -> FieldDescriptorKind {
        FieldDescriptorKind::from_raw(self.header.kind)
    }

    /// Mangled name of the described type.
    pub fn mangled_type_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.mangled_type_name).resolve_optional(
            ctx,
            self.header
                .field_address(offset_of!(FieldDescriptorLayout, mangled_type_name)),
        )
    }

    pub fn superclass<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.superclass).resolve_optional(
            ctx,
            self.header
                .field_address(offset_of!(FieldDescriptorLayout, superclass)),
        )
    }

    /// Names of all fields, in declaration order.
    pub fn field_names<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<Vec<String>> {
        self.records.iter().map(|record| record.field_name(ctx)).collect()
    }

    /// Bytes occupied by the descriptor and its records.
    pub fn actual_size(&self) -> usize {
        FieldDescriptorLayout::SIZE + self.header.record_stride() * self.records.len()
    }
}

impl FieldDescriptorLayout {
    /// Record stride, falling back to the record size when unset.
    fn record_stride(&self) -> usize {
        match self.field_record_size {
            0 => FieldRecord::SIZE,
            size => size as usize,
        }
    }
}

impl<A: Address> Resolvable<A> for FieldDescriptor<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        Self::decode(ctx, at)
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
    fn test_struct_fields() {
        let mut data = vec![0u8; 0x100];
        put(
            &mut data,
            0,
            &FieldDescriptorLayout {
                mangled_type_name: 0x80,
                superclass: 0,
                kind: 0,
                field_record_size: 12,
                num_fields: 2,
            },
        );
        put(
            &mut data,
            16,
            &FieldRecord {
                flags: 2,
                mangled_type_name: 0x90 - 20,
                field_name: 0xA0 - 24,
            },
        );
        put(
            &mut data,
            28,
            &FieldRecord {
                flags: 0,
                mangled_type_name: 0x90 - 32,
                field_name: 0xA4 - 36,
            },
        );
        data[0x80..0x8C].copy_from_slice(b"4main5PointV");
        data[0x90..0x92].copy_from_slice(b"Sd");
        data[0xA0..0xA2].copy_from_slice(b"x\0");
        data[0xA4..0xA6].copy_from_slice(b"y\0");
        let ctx = BufferContext::new(data);

        let fields: FieldDescriptor<u64> = ctx.read_wrapper(0).unwrap();
        assert_eq!(fields.kind(), FieldDescriptorKind::Struct);
        assert_eq!(
            fields.mangled_type_name(&ctx).unwrap().unwrap().as_plain_str(),
            Some("4main5PointV")
        );
        assert!(fields.superclass(&ctx).unwrap().is_none());
        assert_eq!(fields.field_names(&ctx).unwrap(), vec!["x", "y"]);
        assert!(fields.records[0].flags().contains(FieldRecordFlags::IS_VAR));
        assert_eq!(
            fields.records[1].mangled_type_name(&ctx).unwrap().unwrap().as_plain_str(),
            Some("Sd")
        );
        assert_eq!(fields.actual_size(), 40);
    }

    #[test]
    fn test_record_count_exceeds_buffer() {
        let mut data = vec![0u8; 0x20];
        put(
            &mut data,
            0,
            &FieldDescriptorLayout {
                num_fields: 100,
                field_record_size: 12,
                ..Default::default()
            },
        );
        let ctx = BufferContext::new(data);
        assert!(FieldDescriptor::decode(&ctx, 0u64).is_err());
    }
}
